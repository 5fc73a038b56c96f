// walbackuptool/src/runner/mod.rs
//! Thin wrapper around the external `barman-cloud-*` binaries.
//!
//! The runner streams the child's stdout and stderr line by line into the
//! log sink instead of buffering them, and maps the process outcome into
//! a typed [`RunError`]. Cancellation is propagated by sending SIGTERM to
//! the child and escalating to SIGKILL after a grace period.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::RunError;

#[cfg(test)]
pub mod mock;

/// How long a cancelled child is given to exit after SIGTERM before
/// being killed.
const TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Seam between the archiver/restorer and the external binaries.
///
/// The production implementation is [`StreamingRunner`]; tests swap in a
/// mock so the pipeline can be exercised without barman installed.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs `command` with the given arguments and environment, streaming
    /// its output to the log sink, and waits for it to exit.
    async fn run_streaming(
        &self,
        command: &str,
        args: &[String],
        env: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<(), RunError>;
}

/// Production [`ProcessRunner`] based on `tokio::process`.
#[derive(Debug, Default)]
pub struct StreamingRunner;

#[async_trait]
impl ProcessRunner for StreamingRunner {
    async fn run_streaming(
        &self,
        command: &str,
        args: &[String],
        env: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        debug!(command, ?args, "Spawning external command");

        let mut child = Command::new(command)
            .args(args)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RunError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = stream_lines(command.to_string(), "stdout", stdout);
        let stderr_task = stream_lines(command.to_string(), "stderr", stderr);

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let status = match waited {
            Some(status) => status.map_err(|source| RunError::Stream {
                command: command.to_string(),
                source,
            })?,
            None => {
                terminate(&mut child, command).await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                return Err(RunError::Cancelled {
                    command: command.to_string(),
                });
            }
        };

        // The pipes are closed once the child exits, so these finish
        // promptly.
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if status.success() {
            return Ok(());
        }

        match status.code() {
            Some(code) => Err(RunError::ExitCode {
                command: command.to_string(),
                code,
            }),
            None => Err(RunError::Terminated {
                command: command.to_string(),
            }),
        }
    }
}

/// Copies one of the child's output pipes to the log sink, one line at a
/// time, without accumulating the full output in memory.
fn stream_lines<R>(
    command: String,
    stream: &'static str,
    pipe: Option<R>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(pipe) = pipe else {
            return;
        };

        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(command = %command, stream, "{}", line),
                Ok(None) => break,
                Err(err) => {
                    warn!(command = %command, stream, error = %err, "Failed reading command output");
                    break;
                }
            }
        }
    })
}

/// Asks the child to terminate, waiting up to the grace period before
/// resorting to SIGKILL.
async fn terminate(child: &mut Child, command: &str) {
    if let Some(pid) = child.id() {
        info!(command, pid, "Cancellation requested, sending SIGTERM");
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(TERMINATION_GRACE_PERIOD, child.wait()).await {
        Ok(_) => (),
        Err(_) => {
            warn!(command, "Child ignored SIGTERM, killing it");
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_env() -> Vec<(String, String)> {
        std::env::vars().collect()
    }

    #[tokio::test]
    async fn reports_success_for_a_zero_exit() {
        let runner = StreamingRunner;
        let result = runner
            .run_streaming("true", &[], &plain_env(), &CancellationToken::new())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn reports_the_numeric_exit_code() {
        let runner = StreamingRunner;
        let err = runner
            .run_streaming(
                "sh",
                &["-c".to_string(), "exit 3".to_string()],
                &plain_env(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn distinguishes_spawn_failures() {
        let runner = StreamingRunner;
        let err = runner
            .run_streaming(
                "this-binary-does-not-exist",
                &[],
                &plain_env(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Spawn { .. }));
        assert_eq!(err.exit_code(), None);
    }

    #[tokio::test]
    async fn cancellation_terminates_the_child() {
        let runner = StreamingRunner;
        let cancel = CancellationToken::new();

        let child_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            runner
                .run_streaming(
                    "sleep",
                    &["30".to_string()],
                    &plain_env(),
                    &child_cancel,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }
}
