//! Command execution backend for RUN instructions.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cancel::CancelToken;

/// `PATH` used when the stage environment does not set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Lines of stderr kept in a failure report.
const STDERR_TAIL_LINES: usize = 20;

/// A command to run against a stage filesystem.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Stage environment.
    pub env: BTreeMap<String, String>,
    /// Stage root filesystem.
    pub rootfs: PathBuf,
    /// Working directory inside the stage.
    pub workdir: String,
    /// `USER` in effect, if any.
    pub user: Option<String>,
}

impl RunRequest {
    /// Host directory the command starts in.
    #[must_use]
    pub fn host_cwd(&self) -> PathBuf {
        self.rootfs.join(self.workdir.trim_start_matches('/'))
    }
}

/// Why a command did not succeed.
#[derive(Debug, Error)]
pub enum RunFailure {
    /// The process could not be started.
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The process exited unsuccessfully.
    #[error("{}", exit_message(*code, stderr))]
    Exit {
        /// Exit code; `None` when killed by a signal.
        code: Option<i32>,
        /// Last lines of stderr.
        stderr: String,
    },

    /// The stage filesystem could not be rolled back for another attempt.
    #[error("failed to restore the stage filesystem before retrying: {0}")]
    Restore(#[source] std::io::Error),
}

fn exit_message(code: Option<i32>, stderr: &str) -> String {
    let status = code.map_or_else(
        || "terminated by signal".to_string(),
        |code| format!("exited with code {code}"),
    );
    if stderr.is_empty() {
        status
    } else {
        format!("{status}: {stderr}")
    }
}

/// Runs RUN commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `request` to completion.
    async fn run(&self, request: &RunRequest) -> Result<(), RunFailure>;
}

/// Runs commands directly on the host with the working directory inside the
/// stage root filesystem. Provides no isolation.
#[derive(Debug, Clone, Default)]
pub struct HostRunner;

impl HostRunner {
    /// Create a host runner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, request: &RunRequest) -> Result<(), RunFailure> {
        let Some((program, args)) = request.argv.split_first() else {
            return Err(RunFailure::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        let cwd = request.host_cwd();
        tokio::fs::create_dir_all(&cwd)
            .await
            .map_err(|source| RunFailure::Spawn {
                program: program.clone(),
                source,
            })?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .envs(&request.env)
            .env("KILN_ROOTFS", &request.rootfs)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(user) = &request.user {
            command.env("KILN_USER", user);
        }

        tracing::debug!(program = %program, cwd = %cwd.display(), "Spawning command");
        let output = command.output().await.map_err(|source| RunFailure::Spawn {
            program: program.clone(),
            source,
        })?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            tracing::debug!(target: "kiln::run", "{line}");
        }

        if output.status.success() {
            return Ok(());
        }
        Err(RunFailure::Exit {
            code: output.status.code(),
            stderr: tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_LINES),
        })
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// How often a failing RUN is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least 1.
    pub attempts: u32,
    /// Delay before the second attempt; doubles after each retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based; the first attempt has none).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor)
    }
}

/// Outcome of [`run_with_retry`].
#[derive(Debug)]
pub enum RetryOutcome {
    /// The command succeeded.
    Succeeded,
    /// Every attempt failed; the last failure.
    Failed(RunFailure),
    /// Cancelled before or between attempts.
    Cancelled,
}

/// Run `request` under `policy`, stopping early on cancellation.
///
/// `restore` runs before every attempt after the first and must undo what
/// the failed attempt left behind.
pub async fn run_with_retry<R, Fut>(
    runner: &dyn CommandRunner,
    request: &RunRequest,
    policy: RetryPolicy,
    cancel: &CancelToken,
    mut restore: R,
) -> RetryOutcome
where
    R: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    let attempts = policy.attempts.max(1);
    let mut last = None;

    for attempt in 1..=attempts {
        let delay = policy.delay(attempt);
        if !delay.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return RetryOutcome::Cancelled,
                () = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return RetryOutcome::Cancelled;
        }
        if attempt > 1 {
            if let Err(e) = restore().await {
                return RetryOutcome::Failed(RunFailure::Restore(e));
            }
        }

        match runner.run(request).await {
            Ok(()) => return RetryOutcome::Succeeded,
            Err(failure) => {
                if attempt < attempts {
                    tracing::warn!(attempt, attempts, error = %failure, "Command failed, retrying");
                }
                last = Some(failure);
            }
        }
    }

    last.map_or(RetryOutcome::Succeeded, RetryOutcome::Failed)
}

/// Join a container path onto the stage root, keeping it inside the root.
#[must_use]
pub fn resolve_in_rootfs(rootfs: &Path, workdir: &str, path: &str) -> PathBuf {
    let logical = if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        Path::new("/").join(workdir.trim_start_matches('/')).join(path)
    };

    let mut resolved = PathBuf::new();
    for component in logical.components() {
        match component {
            std::path::Component::Normal(part) => resolved.push(part),
            std::path::Component::ParentDir => {
                resolved.pop();
            }
            _ => {}
        }
    }
    rootfs.join(resolved)
}
