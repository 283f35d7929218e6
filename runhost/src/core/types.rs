//! Shared deterministic types for the instance lifecycle.
//!
//! These types define the stable contracts between the lifecycle manager, the
//! invocation engine and the stores. They carry no I/O and serialize to the
//! JSON shape exposed over HTTP.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of an instance.
///
/// `Finished` and `Error` are terminal; no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Prepare,
    Running,
    Finished,
    Error,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Prepare,
        Status::Running,
        Status::Finished,
        Status::Error,
    ];

    /// Parse a wire status value (`prepare`, `running`, `finished`, `error`).
    pub fn parse(raw: &str) -> Option<Status> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Prepare => "prepare",
            Status::Running => "running",
            Status::Finished => "finished",
            Status::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Finished | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which namespace of the API spec an instance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CollectionKind {
    Executable,
    Invoker,
}

impl CollectionKind {
    /// URL/storage segment (`executables` or `invokers`).
    pub fn segment(self) -> &'static str {
        match self {
            CollectionKind::Executable => "executables",
            CollectionKind::Invoker => "invokers",
        }
    }

    pub fn from_segment(raw: &str) -> Option<CollectionKind> {
        match raw {
            "executables" => Some(CollectionKind::Executable),
            "invokers" => Some(CollectionKind::Invoker),
            _ => None,
        }
    }
}

/// Storage partition for instances: one declared executable or invoker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionKey {
    pub kind: CollectionKind,
    pub name: String,
}

impl CollectionKey {
    pub fn executable(name: impl Into<String>) -> Self {
        Self {
            kind: CollectionKind::Executable,
            name: name.into(),
        }
    }

    pub fn invoker(name: impl Into<String>) -> Self {
        Self {
            kind: CollectionKind::Invoker,
            name: name.into(),
        }
    }

    /// Key used for per-instance locks and in-flight bookkeeping.
    pub fn instance_key(&self, id: &str) -> String {
        format!("{}/{}", self, id)
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.segment(), self.name)
    }
}

/// Diagnostic detail attached to instances in the `error` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: None,
            stderr: None,
        }
    }
}

/// One invocation attempt and its recorded lifecycle and output.
///
/// Fields the server does not know about are kept in `extra` and round-trip
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub status: Status,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub results: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Embedded executable reference (invoker collections only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<Value>,
    /// Parameter names whose values live out-of-band.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_stored: Vec<String>,
    /// Result names whose values live out-of-band.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results_stored: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Instance {
    pub fn new(id: impl Into<String>, status: Status) -> Self {
        Self {
            id: id.into(),
            status,
            parameters: Map::new(),
            results: Map::new(),
            created: None,
            finished: None,
            failed: None,
            error: None,
            executable: None,
            parameters_stored: Vec::new(),
            results_stored: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// Kind of change reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Finished,
    Failed,
    Removed,
}

/// A persisted change to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEvent {
    pub kind: ChangeKind,
    pub collection: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl InstanceEvent {
    pub fn new(kind: ChangeKind, collection: &CollectionKey, id: &str, status: Option<Status>) -> Self {
        Self {
            kind,
            collection: collection.to_string(),
            id: id.to_string(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_accepts_only_known_values() {
        assert_eq!(Status::parse("prepare"), Some(Status::Prepare));
        assert_eq!(Status::parse("error"), Some(Status::Error));
        assert_eq!(Status::parse("Running"), None);
        assert_eq!(Status::parse("done"), None);
    }

    /// Unknown client fields survive a serialize/deserialize cycle.
    #[test]
    fn instance_preserves_extra_fields() {
        let raw = serde_json::json!({
            "id": "a",
            "status": "prepare",
            "parameters": { "x": 1 },
            "label": "nightly"
        });
        let instance: Instance = serde_json::from_value(raw.clone()).expect("parse");
        assert_eq!(instance.extra.get("label"), Some(&Value::from("nightly")));

        let back = serde_json::to_value(&instance).expect("serialize");
        assert_eq!(back["label"], "nightly");
        assert_eq!(back["parameters"]["x"], 1);
        assert!(back.get("error").is_none());
    }

    #[test]
    fn collection_key_formats_as_path() {
        let key = CollectionKey::invoker("shell");
        assert_eq!(key.to_string(), "invokers/shell");
        assert_eq!(key.instance_key("42"), "invokers/shell/42");
    }
}
