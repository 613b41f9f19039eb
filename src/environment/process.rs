//! Subprocess execution with a deadline.
//!
//! Commands run in their own process group with stdout and stderr merged
//! into one buffer. On timeout the whole group is killed and the output
//! captured so far is returned inside [`EnvironmentError::Timeout`]. If the
//! future is dropped mid-run (interrupt, task abort) the group is killed too.

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::EnvironmentError;

/// How long to wait for pipes to drain once the process group is killed.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Output of a finished subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Interleaved stdout and stderr, lossily decoded as UTF-8.
    pub output: String,
    /// Exit code; a negative value is the signal that ended the process.
    pub returncode: i32,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

fn snapshot(buffer: &SharedBuffer) -> String {
    let bytes = buffer.lock().unwrap_or_else(PoisonError::into_inner);
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, buffer: SharedBuffer) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&chunk[..n]),
        }
    }
}

fn kill_process_group(pid: u32) {
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pid, "Process group already gone");
    }
}

/// Kills the process group when dropped unless disarmed.
///
/// The pid is the one captured at spawn. `Child::id` turns `None` once the
/// leader is reaped even though the rest of its group may still run.
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn disarm(&mut self) {
        self.pid = None;
    }

    /// Kill the group now and disarm.
    fn kill_now(&mut self) {
        if let Some(pid) = self.pid.take() {
            kill_process_group(pid);
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            kill_process_group(pid);
        }
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Run `command` to completion or until `timeout` elapses.
pub async fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
) -> Result<ProcessOutput, EnvironmentError> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| EnvironmentError::SpawnFailed {
            program: program.clone(),
            reason: e.to_string(),
        })?;
    let mut guard = GroupGuard { pid: child.id() };

    let buffer: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(drain(stdout, buffer.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(drain(stderr, buffer.clone())));
    }

    let waited = tokio::time::timeout(timeout, async {
        let status = child.wait().await;
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
        status
    })
    .await;

    match waited {
        Ok(Ok(status)) => {
            guard.disarm();
            Ok(ProcessOutput {
                output: snapshot(&buffer),
                returncode: exit_code(status),
            })
        }
        Ok(Err(e)) => Err(EnvironmentError::Io(e)),
        Err(_) => {
            guard.kill_now();
            let _ = child.start_kill();
            let _ = tokio::time::timeout(DRAIN_GRACE, child.wait()).await;
            let _ = tokio::time::timeout(DRAIN_GRACE, async {
                for reader in readers.iter_mut() {
                    let _ = reader.await;
                }
            })
            .await;
            for reader in &readers {
                reader.abort();
            }

            let output = snapshot(&buffer);
            tracing::debug!(
                program = %program,
                timeout_secs = timeout.as_secs_f64(),
                captured_bytes = output.len(),
                "Command timed out, process group killed"
            );
            Err(EnvironmentError::Timeout { timeout, output })
        }
    }
}

/// Run a short helper command (container management) and return its output.
///
/// Spawn failures and timeouts are reported as errors; a non-zero exit code
/// is left to the caller to interpret.
pub async fn run_helper(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<ProcessOutput, EnvironmentError> {
    let mut command = Command::new(program);
    command.args(args);
    run_with_timeout(command, timeout).await
}
