//! Child process execution with bounded capture and an optional deadline.

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Bytes kept from one output stream, plus how many were dropped past the limit.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    pub dropped: u64,
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub timed_out: bool,
}

/// Spawn `cmd` with piped output and wait for it, killing it after `timeout`.
///
/// Both pipes are drained on their own threads while the child runs, so a
/// chatty child never blocks on a full pipe. At most `limit` bytes per stream
/// are kept.
#[instrument(skip_all, fields(timeout_ms = timeout.map(|t| t.as_millis() as u64), limit))]
pub fn run_command(mut cmd: Command, timeout: Option<Duration>, limit: usize) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|err| {
        error!(err = %err, "spawn failed");
        anyhow::Error::new(err).context("spawn command")
    })?;
    debug!(pid = child.id(), "child spawned");

    let stdout = capture(child.stdout.take(), "stdout", limit)?;
    let stderr = capture(child.stderr.take(), "stderr", limit)?;
    let (status, timed_out) = wait_with_deadline(&mut child, timeout)?;

    let output = CommandOutput {
        status,
        stdout: collect(stdout).context("collect stdout")?,
        stderr: collect(stderr).context("collect stderr")?,
        timed_out,
    };
    if output.stdout.dropped > 0 || output.stderr.dropped > 0 {
        warn!(
            stdout_dropped = output.stdout.dropped,
            stderr_dropped = output.stderr.dropped,
            "output over limit"
        );
    }
    debug!(exit_code = ?output.status.code(), timed_out, "child exited");
    Ok(output)
}

fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> Result<(ExitStatus, bool)> {
    let Some(timeout) = timeout else {
        return Ok((child.wait().context("wait for command")?, false));
    };
    if let Some(status) = child.wait_timeout(timeout).context("wait for command")? {
        return Ok((status, false));
    }
    warn!(timeout_ms = timeout.as_millis() as u64, "deadline passed, killing child");
    child.kill().context("kill command")?;
    Ok((child.wait().context("reap killed command")?, true))
}

fn capture<R>(
    stream: Option<R>,
    name: &'static str,
    limit: usize,
) -> Result<JoinHandle<io::Result<CapturedStream>>>
where
    R: Read + Send + 'static,
{
    let mut stream = stream.ok_or_else(|| anyhow!("{name} was not piped"))?;
    thread::Builder::new()
        .name(format!("capture-{name}"))
        .spawn(move || {
            let mut captured = CapturedStream::default();
            (&mut stream)
                .take(limit as u64)
                .read_to_end(&mut captured.bytes)?;
            captured.dropped = io::copy(&mut stream, &mut io::sink())?;
            Ok(captured)
        })
        .with_context(|| format!("start {name} reader"))
}

fn collect(handle: JoinHandle<io::Result<CapturedStream>>) -> Result<CapturedStream> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader panicked"))?
        .context("read output")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams_and_exit_code() {
        let output = run_command(sh("echo out; echo err >&2; exit 3"), None, 1024).expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout.bytes, b"out\n");
        assert_eq!(output.stderr.bytes, b"err\n");
        assert!(!output.timed_out);
    }

    /// Bytes past the limit are counted, not kept, and the child still completes.
    #[test]
    fn drops_bytes_beyond_limit() {
        let output = run_command(sh("printf 'abcdefgh'"), None, 4).expect("run");
        assert_eq!(
            output.stdout,
            CapturedStream {
                bytes: b"abcd".to_vec(),
                dropped: 4
            }
        );
        assert!(output.status.success());
    }

    #[test]
    fn kills_child_after_timeout() {
        let output =
            run_command(sh("exec sleep 5"), Some(Duration::from_millis(100)), 1024).expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_command(Command::new("/definitely/not/a/program"), None, 1024)
            .expect_err("spawn should fail");
        assert!(format!("{err:#}").contains("spawn command"));
    }
}
