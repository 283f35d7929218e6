//! HTTP route handlers for the instance API.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde::Deserialize;
use serde_json::Value;

use runhost::core::content_type::render_result;
use runhost::core::links::{self, API_BASE};
use runhost::core::types::{CollectionKey, CollectionKind, Status};
use runhost::io::store::{Embed, Selection};
use runhost::lifecycle::{LifecycleError, LifecycleManager};

use crate::error::ApiError;
use crate::sse;
use crate::state::AppState;

/// Build the full router (API, index, health, event feed).
pub fn router() -> Router<AppState> {
    let instances = "/{kind}/{name}/instances";
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route(&format!("{API_BASE}/spec"), get(get_spec))
        .route(&format!("{API_BASE}/events"), get(sse::events_handler))
        .route(
            &format!("{API_BASE}{instances}"),
            get(list_instances).post(create_instance),
        )
        .route(
            &format!("{API_BASE}{instances}/{{id}}"),
            get(read_instance)
                .put(update_instance)
                .delete(remove_instance),
        )
        .route(
            &format!("{API_BASE}{instances}/{{id}}/parameters/{{param}}"),
            get(get_parameter)
                .put(put_parameter)
                .delete(delete_parameter),
        )
        .route(
            &format!("{API_BASE}{instances}/{{id}}/results/{{result}}"),
            get(get_result).delete(delete_result),
        )
}

#[derive(Debug, Deserialize)]
struct CollectionPath {
    kind: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct InstancePath {
    kind: String,
    name: String,
    id: String,
}

#[derive(Debug, Deserialize)]
struct ParameterPath {
    kind: String,
    name: String,
    id: String,
    param: String,
}

#[derive(Debug, Deserialize)]
struct ResultPath {
    kind: String,
    name: String,
    id: String,
    result: String,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

async fn health() -> &'static str {
    "ok"
}

/// GET / - links to the API spec, the event feed and every collection.
async fn index(State(state): State<AppState>) -> Json<Value> {
    Json(links::index(state.manager.spec()))
}

/// GET /api/v1/spec - the loaded API spec.
async fn get_spec(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    serde_json::to_value(state.manager.spec().as_ref())
        .map(Json)
        .map_err(|err| ApiError::internal(format!("serialize spec: {err}"), state.development))
}

/// GET .../instances - list, optionally filtered by `status`.
async fn list_instances(
    State(state): State<AppState>,
    Path(path): Path<CollectionPath>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let collection = collection_key(&state, &path.kind, &path.name)?;
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(Status::parse(raw).ok_or_else(|| {
            ApiError::validation(format!("invalid status = '{}'", raw), state.development)
        })?),
    };
    let key = collection.clone();
    let instances = blocking(&state, move |manager| manager.list(&key, status)).await?;
    let presented = instances
        .iter()
        .map(|instance| links::present(instance, &collection))
        .collect();
    Ok(Json(Value::Array(presented)))
}

/// POST .../instances - create; 201 with `Location`.
async fn create_instance(
    State(state): State<AppState>,
    Path(path): Path<CollectionPath>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let collection = collection_key(&state, &path.kind, &path.name)?;
    let request = json_body(&state, &body)?;
    let key = collection.clone();
    let accepted = blocking(&state, move |manager| manager.create(&key, request)).await?;

    let location = links::instance_href(&collection, &accepted.instance.id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(links::present(&accepted.instance, &collection)),
    )
        .into_response())
}

/// GET .../instances/{id} - read with optional out-of-band embedding.
async fn read_instance(
    State(state): State<AppState>,
    Path(path): Path<InstancePath>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Value>, ApiError> {
    let collection = collection_key(&state, &path.kind, &path.name)?;
    let embed = embed_from_query(&params);
    let key = collection.clone();
    let id = path.id;
    let instance = blocking(&state, move |manager| manager.read(&key, &id, &embed)).await?;
    Ok(Json(links::present(&instance, &collection)))
}

/// PUT .../instances/{id} - patch a `prepare` instance.
async fn update_instance(
    State(state): State<AppState>,
    Path(path): Path<InstancePath>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let collection = collection_key(&state, &path.kind, &path.name)?;
    let patch = json_body(&state, &body)?;
    let key = collection.clone();
    let id = path.id;
    let accepted = blocking(&state, move |manager| manager.update(&key, &id, patch)).await?;
    Ok(Json(links::present(&accepted.instance, &collection)))
}

/// DELETE .../instances/{id} - succeeds whether or not the instance existed.
async fn remove_instance(
    State(state): State<AppState>,
    Path(path): Path<InstancePath>,
) -> Result<StatusCode, ApiError> {
    let collection = collection_key(&state, &path.kind, &path.name)?;
    let id = path.id;
    blocking(&state, move |manager| manager.remove(&collection, &id)).await?;
    Ok(StatusCode::OK)
}

async fn get_parameter(
    State(state): State<AppState>,
    Path(path): Path<ParameterPath>,
) -> Result<Response, ApiError> {
    let collection = collection_key(&state, &path.kind, &path.name)?;
    let (id, param) = (path.id, path.param);
    let value = blocking(&state, move |manager| {
        manager.get_parameter(&collection, &id, &param)
    })
    .await?;
    let rendered = render_result(&value, None);
    Ok(([(header::CONTENT_TYPE, rendered.content_type)], rendered.body).into_response())
}

/// PUT .../parameters/{param} - JSON bodies are stored as JSON, anything else as text.
async fn put_parameter(
    State(state): State<AppState>,
    Path(path): Path<ParameterPath>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let collection = collection_key(&state, &path.kind, &path.name)?;
    let value = match serde_json::from_slice::<Value>(&body) {
        Ok(value) => value,
        Err(_) => match std::str::from_utf8(&body) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => {
                return Err(ApiError::validation(
                    "parameter value must be JSON or UTF-8 text",
                    state.development,
                ));
            }
        },
    };
    let (id, param) = (path.id, path.param);
    blocking(&state, move |manager| {
        manager.put_parameter(&collection, &id, &param, value)
    })
    .await?;
    Ok(StatusCode::OK)
}

async fn delete_parameter(
    State(state): State<AppState>,
    Path(path): Path<ParameterPath>,
) -> Result<StatusCode, ApiError> {
    let collection = collection_key(&state, &path.kind, &path.name)?;
    let (id, param) = (path.id, path.param);
    blocking(&state, move |manager| {
        manager.delete_parameter(&collection, &id, &param)
    })
    .await?;
    Ok(StatusCode::OK)
}

/// GET .../results/{result} - raw value with an inferred Content-Type.
async fn get_result(
    State(state): State<AppState>,
    Path(path): Path<ResultPath>,
) -> Result<Response, ApiError> {
    let collection = collection_key(&state, &path.kind, &path.name)?;
    let (id, result) = (path.id, path.result);
    let rendered = blocking(&state, move |manager| {
        manager.get_result(&collection, &id, &result)
    })
    .await?;
    Ok(([(header::CONTENT_TYPE, rendered.content_type)], rendered.body).into_response())
}

async fn delete_result(
    State(state): State<AppState>,
    Path(path): Path<ResultPath>,
) -> Result<StatusCode, ApiError> {
    let collection = collection_key(&state, &path.kind, &path.name)?;
    let (id, result) = (path.id, path.result);
    blocking(&state, move |manager| {
        manager.delete_result(&collection, &id, &result)
    })
    .await?;
    Ok(StatusCode::OK)
}

/// Run a manager call on the blocking pool.
async fn blocking<T, F>(state: &AppState, call: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&LifecycleManager) -> Result<T, LifecycleError> + Send + 'static,
{
    let manager = Arc::clone(&state.manager);
    let development = state.development;
    match tokio::task::spawn_blocking(move || call(&manager)).await {
        Ok(result) => result.map_err(|err| ApiError::from_lifecycle(err, development)),
        Err(err) => Err(ApiError::internal(
            format!("blocking task failed: {err}"),
            development,
        )),
    }
}

fn collection_key(state: &AppState, kind: &str, name: &str) -> Result<CollectionKey, ApiError> {
    let kind = CollectionKind::from_segment(kind)
        .ok_or_else(|| ApiError::not_found("Not Found", state.development))?;
    Ok(CollectionKey {
        kind,
        name: name.to_string(),
    })
}

fn json_body(state: &AppState, body: &Bytes) -> Result<Value, ApiError> {
    if body.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::validation(format!("invalid JSON body: {err}"), state.development))
}

/// `embed_all_params`, `embed_param=<name>`, `embed_all_results`, `embed_result=<name>`.
fn embed_from_query(params: &[(String, String)]) -> Embed {
    let mut embed = Embed::default();
    let flag = |value: &str| !matches!(value, "false" | "0");
    let mut parameter_names = Vec::new();
    let mut result_names = Vec::new();
    for (key, value) in params {
        match key.as_str() {
            "embed_all_params" if flag(value) => embed.parameters = Selection::All,
            "embed_all_results" if flag(value) => embed.results = Selection::All,
            "embed_param" => parameter_names.push(value.clone()),
            "embed_result" => result_names.push(value.clone()),
            _ => {}
        }
    }
    if embed.parameters != Selection::All && !parameter_names.is_empty() {
        embed.parameters = Selection::Names(parameter_names);
    }
    if embed.results != Selection::All && !result_names.is_empty() {
        embed.results = Selection::Names(result_names);
    }
    embed
}
