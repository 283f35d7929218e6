//! Invocation engine: runs one instance's program and records the outcome.
//!
//! [`InvocationEngine::submit`] returns immediately with an
//! [`InvocationHandle`]; the program runs on its own thread and the terminal
//! record (`finished` or `error`) is written back to the store when it exits.
//! Failures of the program are a normal outcome and never propagate to the
//! caller that scheduled the run.

use std::fs;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::clock;
use crate::core::result_mapping::{map_results, raw_results};
use crate::core::spec::{ApiSpec, ExecutionPlan};
use crate::core::transitions::validate_engine_transition;
use crate::core::types::{ChangeKind, CollectionKey, ErrorDetail, Instance, InstanceEvent, Status};
use crate::events::InstanceObserver;
use crate::io::runner::{ProcessRequest, ProcessRunner};
use crate::io::store::{Embed, Instances, StoreError};
use crate::locks::KeyedLocks;

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("instance '{id}' has status '{status}', expected 'running'")]
    NotRunning { id: String, status: Status },
    #[error("failed to start invocation thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("invocation thread panicked")]
    Panicked,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Completion handle for a submitted invocation.
///
/// Dropping the handle detaches the invocation; it still runs to completion.
#[derive(Debug)]
pub struct InvocationHandle {
    join: JoinHandle<Result<Option<Instance>, StoreError>>,
}

impl InvocationHandle {
    /// Block until the invocation completes.
    ///
    /// Returns the persisted terminal record, or `None` when the instance was
    /// removed (or replaced) while its program ran and the outcome was discarded.
    pub fn wait(self) -> Result<Option<Instance>, InvocationError> {
        match self.join.join() {
            Ok(result) => result.map_err(InvocationError::from),
            Err(_) => Err(InvocationError::Panicked),
        }
    }
}

/// How an invocation ended, before it is applied to the record.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Finished { results: Map<String, Value> },
    Failed {
        detail: ErrorDetail,
        results: Map<String, Value>,
    },
}

impl Outcome {
    /// Failure before any process output exists.
    pub fn failed(message: impl Into<String>) -> Self {
        Outcome::Failed {
            detail: ErrorDetail::new(message),
            results: raw_results("", ""),
        }
    }
}

#[derive(Clone)]
pub struct InvocationEngine {
    spec: Arc<ApiSpec>,
    store: Instances,
    runner: Arc<dyn ProcessRunner>,
    locks: Arc<KeyedLocks>,
    in_flight: Arc<KeyedLocks>,
    observer: Arc<dyn InstanceObserver>,
}

impl InvocationEngine {
    /// `locks` must be shared with the lifecycle manager so the terminal write
    /// cannot interleave with a remove of the same instance.
    pub fn new(
        spec: Arc<ApiSpec>,
        store: Instances,
        runner: Arc<dyn ProcessRunner>,
        locks: Arc<KeyedLocks>,
        observer: Arc<dyn InstanceObserver>,
    ) -> Self {
        Self {
            spec,
            store,
            runner,
            locks,
            in_flight: Arc::new(KeyedLocks::default()),
            observer,
        }
    }

    /// Start the invocation of a `running` instance on a background thread.
    pub fn submit(
        &self,
        collection: &CollectionKey,
        instance: Instance,
    ) -> Result<InvocationHandle, InvocationError> {
        if instance.status != Status::Running {
            return Err(InvocationError::NotRunning {
                id: instance.id,
                status: instance.status,
            });
        }
        let key = collection.instance_key(&instance.id);
        let engine = self.clone();
        let collection = collection.clone();
        let join = thread::Builder::new()
            .name(format!("invoke-{}", instance.id))
            .spawn(move || {
                let result = engine.run_exclusive(&collection, instance);
                if let Err(err) = &result {
                    error!(collection = %collection, err = %err, "failed to record invocation outcome");
                }
                result
            })
            .map_err(InvocationError::Spawn)?;

        debug!(key = %key, "invocation submitted");
        Ok(InvocationHandle { join })
    }

    /// Wait for any earlier run under the same id, then invoke if the record is still current.
    fn run_exclusive(
        &self,
        collection: &CollectionKey,
        instance: Instance,
    ) -> Result<Option<Instance>, StoreError> {
        let key = collection.instance_key(&instance.id);
        let _claim = self.in_flight.lock(&key);
        let current = self.store.get(collection, &instance.id)?;
        if !current.is_some_and(|current| {
            current.status == Status::Running && current.created == instance.created
        }) {
            info!(key = %key, "instance changed before its invocation started; skipping");
            return Ok(None);
        }
        self.invoke(collection, instance)
    }

    /// Run the invocation on the current thread and persist the terminal record.
    #[instrument(skip_all, fields(collection = %collection, id = %instance.id))]
    pub fn invoke(
        &self,
        collection: &CollectionKey,
        instance: Instance,
    ) -> Result<Option<Instance>, StoreError> {
        let started = Instant::now();
        let outcome = self.execute(collection, &instance);
        let terminal = apply_outcome(instance, outcome, clock::now());
        let saved = self.persist_terminal(collection, terminal)?;
        if let Some(saved) = &saved {
            info!(
                status = %saved.status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "invocation complete"
            );
        }
        Ok(saved)
    }

    fn execute(&self, collection: &CollectionKey, instance: &Instance) -> Outcome {
        let plan = match self.spec.plan(collection, instance.executable.as_ref()) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(err = %err, "cannot resolve execution plan");
                return Outcome::failed(err.to_string());
            }
        };
        let parameters = match self
            .store
            .embed(collection, instance.clone(), &Embed::parameters())
        {
            Ok(embedded) => embedded.parameters,
            Err(err) => return Outcome::failed(format!("load parameters: {err}")),
        };
        let request = match self.process_request(&plan, &parameters) {
            Ok(request) => request,
            Err(err) => return Outcome::failed(format!("serialize environment: {err}")),
        };

        let output = match self.runner.run(&request) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %err, "launch failed");
                return Outcome::failed(err.to_string());
            }
        };

        if !output.success() {
            let message = match (output.timed_out, output.exit_code) {
                (true, _) => "process timed out".to_string(),
                (false, Some(code)) => format!("process exited with status {}", code),
                (false, None) => "process terminated by signal".to_string(),
            };
            warn!(exit_code = ?output.exit_code, timed_out = output.timed_out, "process failed");
            return Outcome::Failed {
                detail: ErrorDetail {
                    message,
                    exit_code: output.exit_code,
                    stderr: Some(output.stderr.clone()),
                },
                results: raw_results(&output.stdout, &output.stderr),
            };
        }

        match map_results(
            &output.stdout,
            &output.stderr,
            &plan.workdir,
            &plan.results_schema,
            |path| fs::read_to_string(path),
        ) {
            Ok(results) => Outcome::Finished { results },
            Err(err) => {
                warn!(err = %err, "result mapping failed");
                Outcome::Failed {
                    detail: ErrorDetail {
                        message: err.to_string(),
                        exit_code: output.exit_code,
                        stderr: None,
                    },
                    results: raw_results(&output.stdout, &output.stderr),
                }
            }
        }
    }

    fn process_request(
        &self,
        plan: &ExecutionPlan,
        parameters: &Map<String, Value>,
    ) -> Result<ProcessRequest, serde_json::Error> {
        let mut env = vec![
            ("APISPEC".to_string(), serde_json::to_string(&*self.spec)?),
            ("PARAMETERS".to_string(), serde_json::to_string(parameters)?),
        ];
        if let Some(executable) = &plan.executable {
            env.push(("EXECUTABLE".to_string(), serde_json::to_string(executable)?));
        }
        if let Some(port) = self.spec.implementation_port {
            env.push(("PORT".to_string(), port.to_string()));
        }
        if let Ok(path) = std::env::var("PATH") {
            env.push(("PATH".to_string(), path));
        }
        Ok(ProcessRequest {
            workdir: plan.workdir.clone(),
            argv: plan.argv.clone(),
            env,
        })
    }

    fn persist_terminal(
        &self,
        collection: &CollectionKey,
        terminal: Instance,
    ) -> Result<Option<Instance>, StoreError> {
        let _guard = self.locks.lock(&collection.instance_key(&terminal.id));
        match self.store.get(collection, &terminal.id)? {
            None => {
                warn!("instance removed during invocation; discarding outcome");
                return Ok(None);
            }
            Some(current)
                if current.status != Status::Running || current.created != terminal.created =>
            {
                warn!(status = %current.status, "instance replaced during invocation; discarding outcome");
                return Ok(None);
            }
            Some(_) => {}
        }

        let kind = match terminal.status {
            Status::Finished => ChangeKind::Finished,
            _ => ChangeKind::Failed,
        };
        let saved = self.store.save(collection, terminal)?;
        self.observer.notify(&InstanceEvent::new(
            kind,
            collection,
            &saved.id,
            Some(saved.status),
        ));
        Ok(Some(saved))
    }
}

/// Apply an outcome to a running instance, stamping the matching timestamp.
pub fn apply_outcome(mut instance: Instance, outcome: Outcome, now: String) -> Instance {
    let target = match outcome {
        Outcome::Finished { .. } => Status::Finished,
        Outcome::Failed { .. } => Status::Error,
    };
    if let Err(message) = validate_engine_transition(instance.status, target) {
        warn!(id = %instance.id, message = %message, "unexpected engine transition");
    }
    instance.status = target;
    match outcome {
        Outcome::Finished { results } => {
            instance.results.extend(results);
            instance.finished = Some(now);
            instance.error = None;
        }
        Outcome::Failed { detail, results } => {
            instance.results.extend(results);
            instance.failed = Some(now);
            instance.error = Some(detail);
        }
    }
    instance
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_outcome_finished_sets_timestamp_and_results() {
        let instance = Instance::new("a", Status::Running);
        let mut results = Map::new();
        results.insert("stdout".to_string(), json!("ok"));
        let done = apply_outcome(instance, Outcome::Finished { results }, "t1".to_string());
        assert_eq!(done.status, Status::Finished);
        assert_eq!(done.finished.as_deref(), Some("t1"));
        assert!(done.failed.is_none());
        assert!(done.error.is_none());
        assert_eq!(done.results.get("stdout"), Some(&json!("ok")));
    }

    #[test]
    fn apply_outcome_failed_records_detail() {
        let instance = Instance::new("a", Status::Running);
        let failed = apply_outcome(instance, Outcome::failed("boom"), "t2".to_string());
        assert_eq!(failed.status, Status::Error);
        assert_eq!(failed.failed.as_deref(), Some("t2"));
        assert!(failed.finished.is_none());
        assert_eq!(failed.error.as_ref().map(|e| e.message.as_str()), Some("boom"));
        assert_eq!(failed.results.get("stdout"), Some(&json!("")));
        assert_eq!(failed.results.get("stderr"), Some(&json!("")));
    }
}
