//! Test helpers: scripted process runners, observers and fixture builders.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;

use crate::core::spec::ApiSpec;
use crate::core::types::InstanceEvent;
use crate::events::InstanceObserver;
use crate::io::runner::{LaunchError, ProcessRequest, ProcessRunner, RawOutput};
use crate::io::store::{Instances, MemoryStore};
use crate::lifecycle::LifecycleManager;

/// Output of a process that exited with `code`.
pub fn exited(code: i32, stdout: &str, stderr: &str) -> RawOutput {
    RawOutput {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code: Some(code),
        timed_out: false,
    }
}

/// Runner that replays queued outcomes in order and records every request.
///
/// An exhausted queue yields a launch failure.
#[derive(Default)]
pub struct ScriptedRunner {
    outcomes: Mutex<VecDeque<Result<RawOutput, LaunchError>>>,
    requests: Mutex<Vec<ProcessRequest>>,
}

impl ScriptedRunner {
    pub fn new(outcomes: Vec<Result<RawOutput, LaunchError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ProcessRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ProcessRunner for ScriptedRunner {
    fn run(&self, request: &ProcessRequest) -> Result<RawOutput, LaunchError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| {
                Err(LaunchError {
                    program: request.argv.first().cloned().unwrap_or_default(),
                    reason: "no scripted outcome left".to_string(),
                })
            })
    }
}

/// Runner that blocks each run until the test releases it through its [`Gate`].
pub struct GatedRunner {
    started: Mutex<Sender<()>>,
    release: Mutex<Receiver<RawOutput>>,
}

/// Test-side controls of a [`GatedRunner`].
pub struct Gate {
    started: Receiver<()>,
    release: Sender<RawOutput>,
}

impl GatedRunner {
    pub fn new() -> (Self, Gate) {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        (
            Self {
                started: Mutex::new(started_tx),
                release: Mutex::new(release_rx),
            },
            Gate {
                started: started_rx,
                release: release_tx,
            },
        )
    }
}

impl ProcessRunner for GatedRunner {
    fn run(&self, request: &ProcessRequest) -> Result<RawOutput, LaunchError> {
        let program = request.argv.first().cloned().unwrap_or_default();
        let _ = self
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(());
        self.release
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv()
            .map_err(|_| LaunchError {
                program,
                reason: "gate dropped".to_string(),
            })
    }
}

impl Gate {
    /// Block until the runner has been entered.
    pub fn wait_started(&self) {
        self.started
            .recv_timeout(Duration::from_secs(10))
            .expect("runner never started");
    }

    pub fn release(&self, output: RawOutput) {
        self.release.send(output).expect("runner gone");
    }
}

/// Observer that keeps every event for later assertions.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<InstanceEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<InstanceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl InstanceObserver for RecordingObserver {
    fn notify(&self, event: &InstanceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Spec with an `echo` executable (requires a string `message`), a `wrapped`
/// executable run through the `shell` invoker, and the `shell` invoker.
pub fn sample_spec() -> ApiSpec {
    serde_json::from_value(json!({
        "implementation_port": 3001,
        "executables": {
            "echo": {
                "path": ".",
                "command": ["./echo.sh"],
                "parameters_schema": { "message": { "type": "string" } },
                "parameters_required": ["message"]
            },
            "wrapped": {
                "path": "wrapped",
                "invoker_name": "shell",
                "results_schema": {
                    "report": { "mapping": "stdout", "type": "object" }
                }
            }
        },
        "invokers": {
            "shell": {
                "path": "invoker",
                "command": ["./invoke.sh"]
            }
        }
    }))
    .expect("sample spec")
}

/// Manager over an in-memory store with a recording observer.
pub fn memory_manager(
    spec: ApiSpec,
    runner: Arc<dyn ProcessRunner>,
    inline_limit_bytes: usize,
) -> (LifecycleManager, Arc<RecordingObserver>) {
    let observer = Arc::new(RecordingObserver::default());
    let manager = LifecycleManager::new(
        Arc::new(spec),
        Instances::new(Arc::new(MemoryStore::default()), inline_limit_bytes),
        runner,
        observer.clone(),
    );
    (manager, observer)
}

/// Write an executable shell script at `dir/name`.
pub fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
    }
}

/// Temporary directory holding an `apispec.json` and the scripts it declares.
pub struct SpecDir {
    pub dir: tempfile::TempDir,
}

impl SpecDir {
    /// Create a spec directory; `spec` paths are relative to it.
    pub fn new(spec: serde_json::Value) -> Self {
        Self::with_dir(tempfile::tempdir().expect("tempdir"), spec)
    }

    /// Like [`SpecDir::new`], placed under `parent`.
    pub fn new_in(parent: &Path, spec: serde_json::Value) -> Self {
        Self::with_dir(tempfile::tempdir_in(parent).expect("tempdir"), spec)
    }

    fn with_dir(dir: tempfile::TempDir, spec: serde_json::Value) -> Self {
        let contents = serde_json::to_string_pretty(&spec).expect("serialize spec");
        std::fs::write(dir.path().join("apispec.json"), contents).expect("write spec");
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn spec_path(&self) -> std::path::PathBuf {
        self.dir.path().join("apispec.json")
    }

    pub fn script(&self, relative_dir: &str, name: &str, body: &str) -> &Self {
        let dir = self.dir.path().join(relative_dir);
        std::fs::create_dir_all(&dir).expect("create script dir");
        write_script(&dir, name, body);
        self
    }
}
