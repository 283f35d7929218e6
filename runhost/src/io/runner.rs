//! Process runner abstraction for invocations.
//!
//! The [`ProcessRunner`] trait decouples the invocation engine from actual
//! process spawning. Tests use scripted runners that return predetermined
//! outputs without spawning processes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::io::process::{CapturedStream, run_command};

/// One process launch: argument list, working directory and full environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub workdir: PathBuf,
    /// Program followed by its arguments; never interpreted by a shell.
    pub argv: Vec<String>,
    /// Complete child environment (the parent environment is not inherited).
    pub env: Vec<(String, String)>,
}

/// Captured output of a process that was launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl RawOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// The process could not be launched or waited for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to launch '{program}': {reason}")]
pub struct LaunchError {
    pub program: String,
    pub reason: String,
}

/// Abstraction over process execution backends.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, request: &ProcessRequest) -> Result<RawOutput, LaunchError>;
}

/// Runner that spawns real child processes.
#[derive(Debug, Clone)]
pub struct SystemProcessRunner {
    pub timeout: Option<Duration>,
    pub output_limit_bytes: usize,
}

impl ProcessRunner for SystemProcessRunner {
    #[instrument(skip_all, fields(workdir = %request.workdir.display()))]
    fn run(&self, request: &ProcessRequest) -> Result<RawOutput, LaunchError> {
        let Some((program, args)) = request.argv.split_first() else {
            return Err(LaunchError {
                program: String::new(),
                reason: "empty command".to_string(),
            });
        };
        info!(program = %program, args = args.len(), "launching process");

        let workdir = std::path::absolute(&request.workdir).map_err(|err| LaunchError {
            program: program.clone(),
            reason: format!("resolve working directory {}: {err}", request.workdir.display()),
        })?;
        // Relative programs with a separator are relative to the working directory.
        let program_path = if program.contains('/') && Path::new(program).is_relative() {
            workdir.join(program)
        } else {
            PathBuf::from(program)
        };
        let mut cmd = Command::new(program_path);
        cmd.args(args)
            .current_dir(&workdir)
            .env_clear()
            .envs(request.env.iter().map(|(k, v)| (k, v)));

        let output =
            run_command(cmd, self.timeout, self.output_limit_bytes).map_err(|err| LaunchError {
                program: program.clone(),
                reason: format!("{err:#}"),
            })?;

        if output.timed_out {
            warn!(program = %program, "process timed out");
        } else {
            debug!(exit_code = ?output.status.code(), "process exited");
        }
        Ok(RawOutput {
            stdout: render(&output.stdout, "stdout"),
            stderr: render(&output.stderr, "stderr"),
            exit_code: output.status.code(),
            timed_out: output.timed_out,
        })
    }
}

/// Decode captured bytes, noting how much was cut off.
fn render(stream: &CapturedStream, name: &str) -> String {
    let mut text = String::from_utf8_lossy(&stream.bytes).into_owned();
    if stream.dropped > 0 {
        text.push_str(&format!("\n[{name} truncated {} bytes]\n", stream.dropped));
    }
    text
}
