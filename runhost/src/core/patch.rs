//! Shaping client requests into instance records.
//!
//! Requests are free-form JSON objects. Server-managed fields are refused so
//! that `results`, timestamps and out-of-band bookkeeping only ever change
//! through the lifecycle manager and the invocation engine.

use serde_json::{Map, Value};

use crate::core::transitions::parse_status;
use crate::core::types::{Instance, Status};

/// Fields clients may neither set on create nor patch on update.
pub const MANAGED_FIELDS: [&str; 8] = [
    "results",
    "created",
    "finished",
    "failed",
    "error",
    "parameters_stored",
    "results_stored",
    "_links",
];

fn reject_managed_fields(fields: &Map<String, Value>) -> Result<(), String> {
    let mut managed: Vec<&str> = MANAGED_FIELDS
        .iter()
        .copied()
        .filter(|name| fields.contains_key(*name))
        .collect();
    if managed.is_empty() {
        return Ok(());
    }
    managed.sort_unstable();
    Err(format!(
        "field(s) managed by the server cannot be set: {}",
        managed.join(", ")
    ))
}

/// Build a new instance record from a create request.
///
/// `status` defaults to `running`. The `id` in `fields` is ignored in favor
/// of the already-validated `id` argument.
pub fn new_instance(
    mut fields: Map<String, Value>,
    id: String,
    created: String,
) -> Result<Instance, String> {
    reject_managed_fields(&fields)?;
    let status = match fields.get("status") {
        None | Some(Value::Null) => Status::Running,
        Some(raw) => parse_status(raw)?,
    };
    fields.insert("id".to_string(), Value::from(id));
    fields.insert("status".to_string(), Value::from(status.as_str()));
    fields.insert("created".to_string(), Value::from(created));
    if matches!(fields.get("parameters"), Some(Value::Null)) {
        fields.remove("parameters");
    }
    serde_json::from_value(Value::Object(fields)).map_err(|err| format!("invalid instance: {err}"))
}

/// Apply a patch: each key replaces the field, `null` deletes it.
///
/// The patch must name the target `status`.
pub fn apply_patch(current: &Instance, patch: &Map<String, Value>) -> Result<Instance, String> {
    reject_managed_fields(patch)?;
    match patch.get("id") {
        None => {}
        Some(Value::String(id)) if *id == current.id => {}
        Some(_) => return Err("id cannot be changed".to_string()),
    }
    match patch.get("status") {
        None => return Err("status is required".to_string()),
        Some(Value::Null) => return Err("status cannot be removed".to_string()),
        Some(raw) => {
            parse_status(raw)?;
        }
    }

    let Value::Object(mut fields) =
        serde_json::to_value(current).map_err(|err| format!("serialize instance: {err}"))?
    else {
        return Err("instance did not serialize to an object".to_string());
    };
    for (key, value) in patch {
        if value.is_null() {
            fields.remove(key);
        } else {
            fields.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(Value::Object(fields)).map_err(|err| format!("invalid instance: {err}"))
}
