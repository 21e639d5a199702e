//! External process launching and log tailing.

use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::AsyncWriteExt;

use crate::error::{DeployError, DeployResult};
use crate::fs::FsHandler;
use crate::poller::Poller;

/// Log line that marks a failed script.
pub const FAILURE_SENTINEL: &str = "has failed.";

/// Log line appended once a script exits cleanly.
pub const EXIT_SENTINEL: &str = "External process exited.";

/// Launches an external command whose output ends up in a log file.
///
/// `launch` returns once the process is running; completion is observed by
/// tailing the log.
pub trait ProcessRunner: Send + Sync + 'static {
    fn launch(&self, command: &str, log_path: &Path)
    -> impl Future<Output = DeployResult<()>> + Send;
}

/// Runs commands through the platform shell.
#[derive(Debug, Clone)]
pub struct ShellProcessRunner {
    shell: String,
    flag: String,
}

impl Default for ShellProcessRunner {
    fn default() -> Self {
        if cfg!(windows) {
            Self::new("powershell", "-Command")
        } else {
            Self::new("sh", "-c")
        }
    }
}

impl ShellProcessRunner {
    pub fn new(shell: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            flag: flag.into(),
        }
    }

    fn spawn(&self, command: &str, log_path: &Path) -> anyhow::Result<tokio::process::Child> {
        if let Some(parent) = log_path.parent() {
            FsHandler::create_log_directory(parent)?;
        }

        let stdout = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file {}", log_path.display()))?;
        let stderr = stdout
            .try_clone()
            .context("Failed to share log file with stderr")?;

        tokio::process::Command::new(&self.shell)
            .arg(&self.flag)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .with_context(|| format!("Failed to start {}", self.shell))
    }
}

impl ProcessRunner for ShellProcessRunner {
    async fn launch(&self, command: &str, log_path: &Path) -> DeployResult<()> {
        let mut child = self
            .spawn(command, log_path)
            .map_err(|err| DeployError::ProcessFailed(format!("{err:#}")))?;

        tracing::info!(log = %log_path.display(), pid = ?child.id(), "Started external process");

        // Reap the child and make sure its exit shows up in the log.
        let log_path = log_path.to_path_buf();
        tokio::spawn(async move {
            let exit = child.wait().await;
            let line = match exit {
                Ok(status) if status.success() => {
                    tracing::debug!(log = %log_path.display(), "External process exited");
                    format!("\n{EXIT_SENTINEL}\n")
                }
                Ok(status) => format!("\nProcess exited with {status}, command {FAILURE_SENTINEL}\n"),
                Err(err) => format!("\nProcess could not be awaited ({err}), command {FAILURE_SENTINEL}\n"),
            };

            let appended = async {
                let mut file = tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(&log_path)
                    .await?;
                file.write_all(line.as_bytes()).await
            };
            if let Err(err) = appended.await {
                tracing::warn!(log = %log_path.display(), error = %err, "Failed to record process exit");
            }
        });

        Ok(())
    }
}

/// Tail `log_path` every `period` until it contains `success`, the failure
/// sentinel or the exit sentinel, bounded by `timeout`. A process that exits
/// without writing `success` has failed.
///
/// Read errors while the log is being written are ignored and retried.
pub async fn tail_log(
    log_path: &Path,
    success: &str,
    period: Duration,
    timeout: Duration,
) -> DeployResult<()> {
    let started = Instant::now();

    if let Err(err) = FsHandler::wait_for_file(log_path, timeout).await {
        if started.elapsed() >= timeout {
            return Err(DeployError::PollTimeout {
                what: format!("log file {}", log_path.display()),
                seconds: timeout.as_secs(),
            });
        }
        return Err(DeployError::FileAccess(format!("{err:#}")));
    }

    let log = Poller::new(period)
        .poll_within(
            timeout.saturating_sub(started.elapsed()),
            "process log",
            move || async move {
                let log = tokio::fs::read_to_string(log_path).await.unwrap_or_default();
                Ok::<_, DeployError>(log)
            },
            |log| {
                log.contains(success) || log.contains(FAILURE_SENTINEL) || log.contains(EXIT_SENTINEL)
            },
        )
        .await?;

    if log.contains(success) {
        return Ok(());
    }
    if log.contains(FAILURE_SENTINEL) {
        return Err(DeployError::ProcessFailed(format!(
            "see the log at {}",
            log_path.display()
        )));
    }
    Err(DeployError::ProcessFailed(format!(
        "exited without reporting success, see the log at {}",
        log_path.display()
    )))
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    const PERIOD: Duration = Duration::from_millis(5);

    #[tokio::test]
    async fn test_tail_detects_success_written_later() {
        let dir = TempDir::new("tail").unwrap();
        let path = dir.path().join("build.log");
        std::fs::write(&path, "building...\n").unwrap();

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tokio::fs::write(&writer_path, "building...\nImage built.\n")
                .await
                .unwrap();
        });

        tail_log(&path, "Image built.", PERIOD, Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tail_reports_failure_sentinel() {
        let dir = TempDir::new("tail").unwrap();
        let path = dir.path().join("push.log");
        std::fs::write(&path, "docker push has failed.\n").unwrap();

        let err = tail_log(&path, "pushed", PERIOD, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ProcessFailed");
    }

    #[tokio::test]
    async fn test_tail_times_out_without_sentinel() {
        let dir = TempDir::new("tail").unwrap();
        let path = dir.path().join("quiet.log");
        std::fs::write(&path, "still going\n").unwrap();

        let err = tail_log(&path, "done", PERIOD, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::PollTimeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_runner_output_reaches_log() {
        let dir = TempDir::new("runner").unwrap();
        let path = dir.path().join("logs").join("echo.log");

        ShellProcessRunner::default()
            .launch("echo all good", &path)
            .await
            .unwrap();
        tail_log(&path, "all good", PERIOD, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tail_fails_when_process_exits_quietly() {
        let dir = TempDir::new("tail").unwrap();
        let path = dir.path().join("quiet.log");
        std::fs::write(&path, format!("built layers\n{EXIT_SENTINEL}\n")).unwrap();

        let err = tail_log(&path, "successfully built", PERIOD, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ProcessFailed(message) if message.contains("without reporting success")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_runner_reports_clean_exit_without_success() {
        let dir = TempDir::new("runner").unwrap();
        let path = dir.path().join("quiet.log");

        ShellProcessRunner::default()
            .launch("echo building", &path)
            .await
            .unwrap();
        let started = Instant::now();
        let err = tail_log(&path, "never printed", PERIOD, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ProcessFailed");
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_runner_records_nonzero_exit() {
        let dir = TempDir::new("runner").unwrap();
        let path = dir.path().join("fail.log");

        ShellProcessRunner::default()
            .launch("exit 3", &path)
            .await
            .unwrap();
        let err = tail_log(&path, "never printed", PERIOD, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ProcessFailed");
    }
}
