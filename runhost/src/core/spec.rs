//! Static declaration of executables and invokers, and execution planning.
//!
//! The API spec is loaded once at startup (see `io::spec_store`) and shared
//! immutably. Planning turns a collection plus an optional embedded executable
//! into the working directory, argument list and result schema for one run.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::core::types::{CollectionKey, CollectionKind};

/// Declared executables and invokers (`apispec.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiSpec {
    /// Port handed to programs that start a sub-service of their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation_port: Option<u16>,
    #[serde(default)]
    pub executables: BTreeMap<String, ExecutableSpec>,
    #[serde(default)]
    pub invokers: BTreeMap<String, InvokerSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableSpec {
    pub path: PathBuf,
    /// Invoker that runs this executable when it has no `command` of its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoker_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default)]
    pub parameters_schema: Map<String, Value>,
    #[serde(default)]
    pub parameters_required: Vec<String>,
    #[serde(default)]
    pub results_schema: ResultsSchema,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokerSpec {
    pub path: PathBuf,
    pub command: Vec<String>,
    #[serde(default)]
    pub parameters_schema: Map<String, Value>,
    #[serde(default)]
    pub parameters_required: Vec<String>,
    #[serde(default)]
    pub results_schema: ResultsSchema,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Where a result field takes its value from.
#[derive(Debug, Clone, PartialEq)]
pub enum Mapping {
    Stdout,
    Stderr,
    File,
    /// Any other declared value is used verbatim as the field value.
    Literal(Value),
}

impl Serialize for Mapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Mapping::Stdout => serializer.serialize_str("stdout"),
            Mapping::Stderr => serializer.serialize_str("stderr"),
            Mapping::File => serializer.serialize_str("file"),
            Mapping::Literal(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Mapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(match value.as_str() {
            Some("stdout") => Mapping::Stdout,
            Some("stderr") => Mapping::Stderr,
            Some("file") => Mapping::File,
            _ => Mapping::Literal(value),
        })
    }
}

/// Declaration of one named result field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Mapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResultSpec {
    pub fn with_mapping(mapping: Mapping) -> Self {
        Self {
            mapping: Some(mapping),
            file_path: None,
            value_type: None,
            extra: Map::new(),
        }
    }

    pub fn typed(mut self, value_type: &str) -> Self {
        self.value_type = Some(value_type.to_string());
        self
    }

    pub fn at(mut self, file_path: &str) -> Self {
        self.file_path = Some(file_path.to_string());
        self
    }

    /// Field-level overlay: fields set in `other` win, unset ones are kept,
    /// and nested objects in extra fields merge recursively.
    pub fn overlay(&mut self, other: &ResultSpec) {
        if let Some(mapping) = &other.mapping {
            self.mapping = Some(mapping.clone());
        }
        if let Some(file_path) = &other.file_path {
            self.file_path = Some(file_path.clone());
        }
        if let Some(value_type) = &other.value_type {
            self.value_type = Some(value_type.clone());
        }
        merge_objects(&mut self.extra, &other.extra);
    }

    /// True when the declared type holds structured JSON.
    pub fn is_structured(&self) -> bool {
        matches!(self.value_type.as_deref(), Some("object") | Some("array"))
    }
}

/// Result declarations in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultsSchema(Vec<(String, ResultSpec)>);

impl ResultsSchema {
    pub fn new(entries: Vec<(String, ResultSpec)>) -> Self {
        Self(entries)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResultSpec)> {
        self.0.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn get(&self, name: &str) -> Option<&ResultSpec> {
        self.iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, spec)| spec)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `overrides` on top of `self`: same-named entries merge field by
    /// field in place, new entries are appended in their declaration order.
    pub fn merged(&self, overrides: &ResultsSchema) -> ResultsSchema {
        let mut entries = self.0.clone();
        for (name, spec) in &overrides.0 {
            match entries.iter_mut().find(|(existing, _)| existing == name) {
                Some(slot) => slot.1.overlay(spec),
                None => entries.push((name.clone(), spec.clone())),
            }
        }
        ResultsSchema(entries)
    }
}

fn merge_objects(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_objects(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

impl Serialize for ResultsSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, spec) in &self.0 {
            map.serialize_entry(name, spec)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ResultsSchema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // serde_json's `preserve_order` keeps declaration order in `Map`.
        let raw = Map::<String, Value>::deserialize(deserializer)?;
        let mut entries = Vec::with_capacity(raw.len());
        for (name, value) in raw {
            let spec = serde_json::from_value(value)
                .map_err(|err| D::Error::custom(format!("result '{name}': {err}")))?;
            entries.push((name, spec));
        }
        Ok(ResultsSchema(entries))
    }
}

/// Everything needed to launch one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub workdir: PathBuf,
    pub argv: Vec<String>,
    /// Executable handed to an invoker (`EXECUTABLE` environment variable).
    pub executable: Option<Value>,
    pub results_schema: ResultsSchema,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("no executable declared with name '{0}'")]
    UnknownExecutable(String),
    #[error("no invoker declared with name '{0}'")]
    UnknownInvoker(String),
    #[error("executable must be specified")]
    MissingExecutable,
    #[error("executable '{0}' declares neither a command nor an invoker")]
    NoCommand(String),
    #[error("invalid embedded executable: {0}")]
    InvalidExecutable(String),
}

impl ApiSpec {
    /// Whether the collection names a declared executable or invoker.
    pub fn contains(&self, collection: &CollectionKey) -> bool {
        match collection.kind {
            CollectionKind::Executable => self.executables.contains_key(&collection.name),
            CollectionKind::Invoker => self.invokers.contains_key(&collection.name),
        }
    }

    /// Parameter schema and required names declared for the collection.
    pub fn parameters_of(&self, collection: &CollectionKey) -> Option<(&Map<String, Value>, &[String])> {
        match collection.kind {
            CollectionKind::Executable => self
                .executables
                .get(&collection.name)
                .map(|exe| (&exe.parameters_schema, exe.parameters_required.as_slice())),
            CollectionKind::Invoker => self
                .invokers
                .get(&collection.name)
                .map(|inv| (&inv.parameters_schema, inv.parameters_required.as_slice())),
        }
    }

    /// Result schema known for the collection without an embedded executable.
    pub fn results_schema_of(&self, collection: &CollectionKey) -> ResultsSchema {
        match collection.kind {
            CollectionKind::Executable => {
                let Some(exe) = self.executables.get(&collection.name) else {
                    return ResultsSchema::default();
                };
                match exe.invoker_name.as_ref().and_then(|name| self.invokers.get(name)) {
                    Some(invoker) if exe.command.is_empty() => {
                        invoker.results_schema.merged(&exe.results_schema)
                    }
                    _ => exe.results_schema.clone(),
                }
            }
            CollectionKind::Invoker => self
                .invokers
                .get(&collection.name)
                .map(|inv| inv.results_schema.clone())
                .unwrap_or_default(),
        }
    }

    /// Resolve working directory, command and result schema for one run.
    ///
    /// An executable with its own `command` runs in its own directory; otherwise
    /// it runs through its invoker, which also applies to invoker collections,
    /// where the executable comes from the instance itself.
    pub fn plan(
        &self,
        collection: &CollectionKey,
        embedded: Option<&Value>,
    ) -> Result<ExecutionPlan, PlanError> {
        match collection.kind {
            CollectionKind::Executable => {
                let exe = self
                    .executables
                    .get(&collection.name)
                    .ok_or_else(|| PlanError::UnknownExecutable(collection.name.clone()))?;
                if !exe.command.is_empty() {
                    return Ok(ExecutionPlan {
                        workdir: exe.path.clone(),
                        argv: exe.command.clone(),
                        executable: None,
                        results_schema: exe.results_schema.clone(),
                    });
                }
                let invoker_name = exe
                    .invoker_name
                    .as_ref()
                    .ok_or_else(|| PlanError::NoCommand(collection.name.clone()))?;
                let invoker = self
                    .invokers
                    .get(invoker_name)
                    .ok_or_else(|| PlanError::UnknownInvoker(invoker_name.clone()))?;
                Ok(ExecutionPlan {
                    workdir: invoker.path.clone(),
                    argv: invoker.command.clone(),
                    executable: Some(self.describe_executable(&collection.name, exe)),
                    results_schema: invoker.results_schema.merged(&exe.results_schema),
                })
            }
            CollectionKind::Invoker => {
                let invoker = self
                    .invokers
                    .get(&collection.name)
                    .ok_or_else(|| PlanError::UnknownInvoker(collection.name.clone()))?;
                let (executable, exe_results) = self.resolve_embedded(embedded)?;
                Ok(ExecutionPlan {
                    workdir: invoker.path.clone(),
                    argv: invoker.command.clone(),
                    executable: Some(executable),
                    results_schema: invoker.results_schema.merged(&exe_results),
                })
            }
        }
    }

    fn resolve_embedded(&self, embedded: Option<&Value>) -> Result<(Value, ResultsSchema), PlanError> {
        match embedded {
            Some(Value::String(name)) => {
                let exe = self
                    .executables
                    .get(name)
                    .ok_or_else(|| PlanError::UnknownExecutable(name.clone()))?;
                Ok((self.describe_executable(name, exe), exe.results_schema.clone()))
            }
            Some(Value::Object(fields)) if !fields.is_empty() => {
                let results = match fields.get("results_schema") {
                    Some(raw) => serde_json::from_value(raw.clone())
                        .map_err(|err| PlanError::InvalidExecutable(err.to_string()))?,
                    None => ResultsSchema::default(),
                };
                Ok((Value::Object(fields.clone()), results))
            }
            _ => Err(PlanError::MissingExecutable),
        }
    }

    fn describe_executable(&self, name: &str, exe: &ExecutableSpec) -> Value {
        let mut value = serde_json::to_value(exe).unwrap_or(Value::Null);
        if let Value::Object(fields) = &mut value {
            fields.insert("name".to_string(), Value::from(name));
        }
        value
    }
}
