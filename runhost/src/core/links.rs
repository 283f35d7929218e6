//! Hypermedia links attached to instances on read.

use serde_json::{Map, Value, json};

use crate::core::spec::ApiSpec;
use crate::core::types::{CollectionKey, Instance};

pub const API_BASE: &str = "/api/v1";

/// Path of a collection's instance list.
pub fn instances_href(collection: &CollectionKey) -> String {
    format!(
        "{}/{}/{}/instances",
        API_BASE,
        collection.kind.segment(),
        urlencoding::encode(&collection.name)
    )
}

/// Path of one instance.
pub fn instance_href(collection: &CollectionKey, id: &str) -> String {
    format!("{}/{}", instances_href(collection), urlencoding::encode(id))
}

/// Path of one out-of-band value below an instance.
fn value_href(instance_href: &str, slot: &str, name: &str) -> Value {
    json!({ "href": format!("{}/{}/{}", instance_href, slot, urlencoding::encode(name)) })
}

/// Serialize `instance` with a `_links` object (`self`, `parent`, and the
/// out-of-band `parameters`/`results` when present).
pub fn present(instance: &Instance, collection: &CollectionKey) -> Value {
    let mut value = serde_json::to_value(instance).unwrap_or_else(|_| json!({}));
    let self_href = instance_href(collection, &instance.id);

    let mut links = Map::new();
    links.insert("self".to_string(), json!({ "href": self_href }));
    links.insert(
        "parent".to_string(),
        json!({ "href": instances_href(collection) }),
    );
    if !instance.parameters_stored.is_empty() {
        let hrefs: Vec<Value> = instance
            .parameters_stored
            .iter()
            .map(|name| value_href(&self_href, "parameters", name))
            .collect();
        links.insert("parameters".to_string(), Value::Array(hrefs));
    }
    if !instance.results_stored.is_empty() {
        let hrefs: Vec<Value> = instance
            .results_stored
            .iter()
            .map(|name| value_href(&self_href, "results", name))
            .collect();
        links.insert("results".to_string(), Value::Array(hrefs));
    }

    if let Value::Object(fields) = &mut value {
        fields.insert("_links".to_string(), Value::Object(links));
    }
    value
}

/// Entry document linking the API spec, the event feed and every collection.
pub fn index(spec: &ApiSpec) -> Value {
    let collection_links = |keys: Vec<CollectionKey>| -> Value {
        Value::Array(
            keys.iter()
                .map(|key| json!({ "name": key.name, "href": instances_href(key) }))
                .collect(),
        )
    };
    json!({
        "_links": {
            "self": { "href": "/" },
            "spec": { "href": format!("{}/spec", API_BASE) },
            "events": { "href": format!("{}/events", API_BASE) },
            "executables": collection_links(
                spec.executables.keys().map(CollectionKey::executable).collect()
            ),
            "invokers": collection_links(
                spec.invokers.keys().map(CollectionKey::invoker).collect()
            ),
        }
    })
}
