//! Instance lifecycle manager.
//!
//! Validates and applies client-initiated changes to instance records and
//! hands instances that enter `running` to the [`InvocationEngine`]. Every
//! mutation of one `(collection, id)` happens under its [`KeyedLocks`] entry,
//! which the engine also takes for its terminal write.

use std::sync::Arc;

use jsonschema::validator_for;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock;
use crate::core::content_type::{TypedBody, render_result};
use crate::core::ids::validate_instance_id;
use crate::core::patch::{apply_patch, new_instance};
use crate::core::spec::ApiSpec;
use crate::core::transitions::validate_client_transition;
use crate::core::types::{
    ChangeKind, CollectionKey, CollectionKind, Instance, InstanceEvent, Status,
};
use crate::events::InstanceObserver;
use crate::invocation::{InvocationEngine, InvocationHandle, Outcome, apply_outcome};
use crate::io::runner::ProcessRunner;
use crate::io::store::{Embed, Instances, StoreError, ValueSlot};
use crate::locks::KeyedLocks;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A persisted create or update, plus the invocation it started, if any.
#[derive(Debug)]
pub struct Accepted {
    pub instance: Instance,
    pub invocation: Option<InvocationHandle>,
}

pub struct LifecycleManager {
    spec: Arc<ApiSpec>,
    store: Instances,
    engine: InvocationEngine,
    locks: Arc<KeyedLocks>,
    observer: Arc<dyn InstanceObserver>,
}

impl LifecycleManager {
    pub fn new(
        spec: Arc<ApiSpec>,
        store: Instances,
        runner: Arc<dyn ProcessRunner>,
        observer: Arc<dyn InstanceObserver>,
    ) -> Self {
        let locks = Arc::new(KeyedLocks::default());
        let engine = InvocationEngine::new(
            Arc::clone(&spec),
            store.clone(),
            runner,
            Arc::clone(&locks),
            Arc::clone(&observer),
        );
        Self {
            spec,
            store,
            engine,
            locks,
            observer,
        }
    }

    pub fn spec(&self) -> &Arc<ApiSpec> {
        &self.spec
    }

    pub fn store(&self) -> &Instances {
        &self.store
    }

    /// Create an instance from a client request and start it if `running`.
    pub fn create(
        &self,
        collection: &CollectionKey,
        request: Value,
    ) -> Result<Accepted, LifecycleError> {
        self.ensure_collection(collection)?;
        let Value::Object(fields) = request else {
            return Err(LifecycleError::Validation(
                "request body must be a JSON object".to_string(),
            ));
        };
        if collection.kind == CollectionKind::Invoker {
            self.check_executable(fields.get("executable"))?;
        }
        let id = match fields.get("id") {
            None | Some(Value::Null) => Uuid::new_v4().to_string(),
            Some(Value::String(id)) => {
                validate_instance_id(id).map_err(LifecycleError::Validation)?;
                id.clone()
            }
            Some(_) => {
                return Err(LifecycleError::Validation(
                    "id must be a string".to_string(),
                ));
            }
        };
        let instance =
            new_instance(fields, id.clone(), clock::now()).map_err(LifecycleError::Validation)?;
        if instance.status == Status::Running {
            self.check_parameters(collection, &instance.parameters)?;
        }

        let _guard = self.locks.lock(&collection.instance_key(&id));
        if self.store.get(collection, &id)?.is_some() {
            return Err(LifecycleError::Conflict(format!(
                "instance '{}' already exists",
                id
            )));
        }
        let saved = self.store.save(collection, instance)?;
        self.notify(ChangeKind::Created, collection, &saved);
        info!(collection = %collection, id = %saved.id, status = %saved.status, "instance created");

        let invocation = self.schedule(collection, &saved)?;
        Ok(Accepted {
            instance: saved,
            invocation,
        })
    }

    /// Apply a client patch to a `prepare` instance and start it if it enters `running`.
    pub fn update(
        &self,
        collection: &CollectionKey,
        id: &str,
        patch: Value,
    ) -> Result<Accepted, LifecycleError> {
        self.ensure_collection(collection)?;
        let Value::Object(patch) = patch else {
            return Err(LifecycleError::Validation(
                "request body must be a JSON object".to_string(),
            ));
        };

        let _guard = self.locks.lock(&collection.instance_key(id));
        let current = self.existing(collection, id)?;
        if current.status != Status::Prepare {
            return Err(LifecycleError::Validation(
                "instance can only be updated if status = 'prepare'".to_string(),
            ));
        }
        let next = apply_patch(&current, &patch).map_err(LifecycleError::Validation)?;
        validate_client_transition(current.status, next.status)
            .map_err(LifecycleError::Validation)?;
        if collection.kind == CollectionKind::Invoker {
            self.check_executable(next.executable.as_ref())?;
        }
        if next.status == Status::Running {
            let embedded = self
                .store
                .embed(collection, next.clone(), &Embed::parameters())?;
            self.check_parameters(collection, &embedded.parameters)?;
        }

        let saved = self.store.save(collection, next)?;
        self.notify(ChangeKind::Updated, collection, &saved);
        info!(collection = %collection, id = %saved.id, status = %saved.status, "instance updated");

        let invocation = self.schedule(collection, &saved)?;
        Ok(Accepted {
            instance: saved,
            invocation,
        })
    }

    pub fn read(
        &self,
        collection: &CollectionKey,
        id: &str,
        embed: &Embed,
    ) -> Result<Instance, LifecycleError> {
        self.ensure_collection(collection)?;
        self.store
            .get_embedded(collection, id, embed)?
            .ok_or_else(|| instance_not_found(id))
    }

    pub fn list(
        &self,
        collection: &CollectionKey,
        status: Option<Status>,
    ) -> Result<Vec<Instance>, LifecycleError> {
        self.ensure_collection(collection)?;
        Ok(self.store.list(collection, status)?)
    }

    /// Delete an instance at any status. Returns whether it existed.
    ///
    /// A running invocation is not cancelled; its outcome is discarded when it
    /// completes.
    pub fn remove(&self, collection: &CollectionKey, id: &str) -> Result<bool, LifecycleError> {
        self.ensure_collection(collection)?;
        let _guard = self.locks.lock(&collection.instance_key(id));
        let status = self.store.get(collection, id)?.map(|instance| instance.status);
        let removed = self.store.remove(collection, id)?;
        if removed {
            if status == Some(Status::Running) {
                warn!(collection = %collection, id = %id, "removed instance while its invocation is running");
            }
            self.observer.notify(&InstanceEvent::new(
                ChangeKind::Removed,
                collection,
                id,
                None,
            ));
            info!(collection = %collection, id = %id, "instance removed");
        } else {
            debug!(collection = %collection, id = %id, "remove of missing instance");
        }
        Ok(removed)
    }

    pub fn get_parameter(
        &self,
        collection: &CollectionKey,
        id: &str,
        name: &str,
    ) -> Result<Value, LifecycleError> {
        self.ensure_collection(collection)?;
        let instance = self.existing(collection, id)?;
        self.lookup(ValueSlot::Parameter, collection, &instance, name)?
            .ok_or_else(|| LifecycleError::NotFound(format!("parameter '{}' not found", name)))
    }

    /// Store one parameter out-of-band on a `prepare` instance.
    pub fn put_parameter(
        &self,
        collection: &CollectionKey,
        id: &str,
        name: &str,
        value: Value,
    ) -> Result<Instance, LifecycleError> {
        self.ensure_collection(collection)?;
        let _guard = self.locks.lock(&collection.instance_key(id));
        let mut instance = self.existing(collection, id)?;
        require_prepare(&instance)?;

        self.store
            .set_value(ValueSlot::Parameter, collection, id, name, &value)?;
        instance.parameters.remove(name);
        if !instance.parameters_stored.iter().any(|stored| stored == name) {
            instance.parameters_stored.push(name.to_string());
        }
        let saved = self.store.save(collection, instance)?;
        self.notify(ChangeKind::Updated, collection, &saved);
        debug!(collection = %collection, id = %id, name = %name, "parameter stored");
        Ok(saved)
    }

    pub fn delete_parameter(
        &self,
        collection: &CollectionKey,
        id: &str,
        name: &str,
    ) -> Result<Instance, LifecycleError> {
        self.ensure_collection(collection)?;
        let _guard = self.locks.lock(&collection.instance_key(id));
        let mut instance = self.existing(collection, id)?;
        require_prepare(&instance)?;

        let removed_stored = self
            .store
            .remove_value(ValueSlot::Parameter, collection, id, name)?;
        let removed_inline = instance.parameters.remove(name).is_some();
        if !removed_stored && !removed_inline {
            return Err(LifecycleError::NotFound(format!(
                "parameter '{}' not found",
                name
            )));
        }
        instance.parameters_stored.retain(|stored| stored != name);
        let saved = self.store.save(collection, instance)?;
        self.notify(ChangeKind::Updated, collection, &saved);
        debug!(collection = %collection, id = %id, name = %name, "parameter deleted");
        Ok(saved)
    }

    /// Result value with the content type to serve it as.
    pub fn get_result(
        &self,
        collection: &CollectionKey,
        id: &str,
        name: &str,
    ) -> Result<TypedBody, LifecycleError> {
        self.ensure_collection(collection)?;
        let instance = self.existing(collection, id)?;
        let value = self
            .lookup(ValueSlot::Result, collection, &instance, name)?
            .ok_or_else(|| LifecycleError::NotFound(format!("result '{}' not found", name)))?;
        let schema = self
            .spec
            .plan(collection, instance.executable.as_ref())
            .map(|plan| plan.results_schema)
            .unwrap_or_else(|_| self.spec.results_schema_of(collection));
        let declared = schema.get(name).and_then(|spec| spec.value_type.as_deref());
        Ok(render_result(&value, declared))
    }

    pub fn delete_result(
        &self,
        collection: &CollectionKey,
        id: &str,
        name: &str,
    ) -> Result<Instance, LifecycleError> {
        self.ensure_collection(collection)?;
        let _guard = self.locks.lock(&collection.instance_key(id));
        let mut instance = self.existing(collection, id)?;

        let removed_stored = self
            .store
            .remove_value(ValueSlot::Result, collection, id, name)?;
        let removed_inline = instance.results.remove(name).is_some();
        if !removed_stored && !removed_inline {
            return Err(LifecycleError::NotFound(format!(
                "result '{}' not found",
                name
            )));
        }
        instance.results_stored.retain(|stored| stored != name);
        let saved = self.store.save(collection, instance)?;
        self.notify(ChangeKind::Updated, collection, &saved);
        debug!(collection = %collection, id = %id, name = %name, "result deleted");
        Ok(saved)
    }

    fn schedule(
        &self,
        collection: &CollectionKey,
        instance: &Instance,
    ) -> Result<Option<InvocationHandle>, LifecycleError> {
        if instance.status != Status::Running {
            return Ok(None);
        }
        match self.engine.submit(collection, instance.clone()) {
            Ok(handle) => Ok(Some(handle)),
            Err(err) => {
                warn!(collection = %collection, id = %instance.id, err = %err, "cannot start invocation");
                let failed = apply_outcome(
                    instance.clone(),
                    Outcome::failed(err.to_string()),
                    clock::now(),
                );
                let saved = self.store.save(collection, failed)?;
                self.notify(ChangeKind::Failed, collection, &saved);
                Ok(None)
            }
        }
    }

    fn existing(&self, collection: &CollectionKey, id: &str) -> Result<Instance, LifecycleError> {
        self.store
            .get(collection, id)?
            .ok_or_else(|| instance_not_found(id))
    }

    /// Out-of-band value first, then the inline one.
    fn lookup(
        &self,
        slot: ValueSlot,
        collection: &CollectionKey,
        instance: &Instance,
        name: &str,
    ) -> Result<Option<Value>, LifecycleError> {
        let (stored, inline) = match slot {
            ValueSlot::Parameter => (&instance.parameters_stored, &instance.parameters),
            ValueSlot::Result => (&instance.results_stored, &instance.results),
        };
        if stored.iter().any(|candidate| candidate == name) {
            if let Some(value) = self.store.value(slot, collection, &instance.id, name)? {
                return Ok(Some(value));
            }
        }
        Ok(inline.get(name).cloned())
    }

    fn ensure_collection(&self, collection: &CollectionKey) -> Result<(), LifecycleError> {
        if self.spec.contains(collection) {
            return Ok(());
        }
        let what = match collection.kind {
            CollectionKind::Executable => "executable",
            CollectionKind::Invoker => "invoker",
        };
        Err(LifecycleError::NotFound(format!(
            "no {} declared with name '{}'",
            what, collection.name
        )))
    }

    fn check_executable(&self, executable: Option<&Value>) -> Result<(), LifecycleError> {
        match executable {
            Some(Value::String(name)) if self.spec.executables.contains_key(name) => Ok(()),
            Some(Value::String(name)) => Err(LifecycleError::Validation(format!(
                "no executable declared with name '{}'",
                name
            ))),
            Some(Value::Object(fields)) if !fields.is_empty() => Ok(()),
            _ => Err(LifecycleError::Validation(
                "executable must be specified".to_string(),
            )),
        }
    }

    /// Required parameters are present and declared schemas accept their values.
    fn check_parameters(
        &self,
        collection: &CollectionKey,
        parameters: &Map<String, Value>,
    ) -> Result<(), LifecycleError> {
        let Some((schema, required)) = self.spec.parameters_of(collection) else {
            return Ok(());
        };
        let missing: Vec<&str> = required
            .iter()
            .map(String::as_str)
            .filter(|name| !parameters.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(LifecycleError::Validation(format!(
                "missing required parameter(s): {}",
                missing.join(", ")
            )));
        }

        for (name, value) in parameters {
            let Some(parameter_schema) = schema.get(name) else {
                continue;
            };
            let compiled = match validator_for(parameter_schema) {
                Ok(compiled) => compiled,
                Err(err) => {
                    debug!(parameter = %name, err = %err, "parameter schema not checkable; skipping");
                    continue;
                }
            };
            if !compiled.is_valid(value) {
                let messages = compiled
                    .iter_errors(value)
                    .map(|err| err.to_string())
                    .collect::<Vec<_>>();
                return Err(LifecycleError::Validation(format!(
                    "parameter '{}' is invalid: {}",
                    name,
                    messages.join("; ")
                )));
            }
        }
        Ok(())
    }

    fn notify(&self, kind: ChangeKind, collection: &CollectionKey, instance: &Instance) {
        self.observer.notify(&InstanceEvent::new(
            kind,
            collection,
            &instance.id,
            Some(instance.status),
        ));
    }
}

fn require_prepare(instance: &Instance) -> Result<(), LifecycleError> {
    if instance.status == Status::Prepare {
        return Ok(());
    }
    Err(LifecycleError::Validation(
        "instance can only be updated if status = 'prepare'".to_string(),
    ))
}

fn instance_not_found(id: &str) -> LifecycleError {
    LifecycleError::NotFound(format!("instance '{}' not found", id))
}
