//! One-shot jobs: run to completion once, never restarted.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::command::ChildCommand;
use crate::error::{SupervisorError, SupervisorResult};

/// Run `command` once and wait for it to exit.
///
/// A non-zero exit or death by signal is an error; so is a shutdown request
/// that arrives first, in which case the child is killed.
pub async fn run_once(
    command: &ChildCommand,
    mut shutdown: watch::Receiver<bool>,
) -> SupervisorResult<()> {
    let role = command.role;
    let mut child = command.spawn()?;
    info!(%role, pid = child.id().unwrap_or(0), "one-shot job started");

    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| SupervisorError::Spawn {
            role,
            reason: e.to_string(),
        })?,
        _ = shutdown.changed() => {
            let _ = child.kill().await;
            return Err(SupervisorError::Interrupted { role });
        }
    };

    if status.success() {
        info!(%role, "one-shot job completed");
        Ok(())
    } else {
        error!(%role, code = ?status.code(), "one-shot job failed");
        Err(SupervisorError::OneShotFailed {
            role,
            code: status.code(),
        })
    }
}

/// [`run_once`] with an upper bound on how long the job may take. A job
/// still running at `limit` is killed.
pub async fn run_once_within(
    command: &ChildCommand,
    limit: Duration,
    shutdown: watch::Receiver<bool>,
) -> SupervisorResult<()> {
    match tokio::time::timeout(limit, run_once(command, shutdown)).await {
        Ok(result) => result,
        Err(_) => {
            error!(role = %command.role, ?limit, "one-shot job timed out");
            Err(SupervisorError::TimedOut {
                role: command.role,
                limit,
            })
        }
    }
}
