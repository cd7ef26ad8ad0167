//! Role and lifecycle types shared by the controller and the roles it runs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Roles ─────────────────────────────────────────────────────────

/// The part a process plays in a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    /// The durable metadata store (external process).
    Store,
    /// One-shot schema migration and admin provisioning.
    Initializer,
    /// HTTP API/UI server.
    ApiServer,
    /// Workflow scheduler loop.
    SchedulerLoop,
}

impl ServiceRole {
    pub const ALL: [ServiceRole; 4] = [
        ServiceRole::Store,
        ServiceRole::Initializer,
        ServiceRole::ApiServer,
        ServiceRole::SchedulerLoop,
    ];

    /// Keyword passed to a control-plane image to select this role.
    ///
    /// The store runs its own image and has no keyword.
    pub fn command_keyword(self) -> Option<&'static str> {
        match self {
            ServiceRole::Store => None,
            ServiceRole::Initializer => Some("version"),
            ServiceRole::ApiServer => Some("webserver"),
            ServiceRole::SchedulerLoop => Some("scheduler"),
        }
    }

    /// Resolve a command keyword back to its role.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|role| role.command_keyword() == Some(keyword))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceRole::Store => "store",
            ServiceRole::Initializer => "initializer",
            ServiceRole::ApiServer => "api_server",
            ServiceRole::SchedulerLoop => "scheduler_loop",
        }
    }

    /// Whether the role is a supervised, restart-always service.
    pub fn is_control_plane(self) -> bool {
        matches!(self, ServiceRole::ApiServer | ServiceRole::SchedulerLoop)
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Readiness ─────────────────────────────────────────────────────

/// Readiness of the durable store as seen by the prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    Unknown,
    Probing,
    Ready,
    Unreachable,
}

impl ReadinessState {
    pub fn is_ready(self) -> bool {
        self == ReadinessState::Ready
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadinessState::Unknown => "unknown",
            ReadinessState::Probing => "probing",
            ReadinessState::Ready => "ready",
            ReadinessState::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

// ── Process lifecycle ─────────────────────────────────────────────

/// Lifecycle of a supervised control-plane process.
///
/// `Starting -> Healthy -> (Unhealthy -> Restarting -> Starting)* -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Healthy,
    Unhealthy,
    Restarting,
    Stopped,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Starting => "starting",
            ProcessState::Healthy => "healthy",
            ProcessState::Unhealthy => "unhealthy",
            ProcessState::Restarting => "restarting",
            ProcessState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Health status as determined by health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

// ── Executor ──────────────────────────────────────────────────────

/// Executor mode handed to the control-plane roles.
///
/// The controller never executes tasks; the value is propagated and
/// reported so every role agrees on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    #[default]
    Sequential,
    Local,
}

impl ExecutorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorMode::Sequential => "sequential",
            ExecutorMode::Local => "local",
        }
    }
}

impl fmt::Display for ExecutorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorMode {
    type Err = String;

    /// Accepts `local` as well as the `LocalExecutor` spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let name = lower.strip_suffix("executor").unwrap_or(&lower);
        match name {
            "sequential" => Ok(ExecutorMode::Sequential),
            "local" => Ok(ExecutorMode::Local),
            other => Err(format!("unknown executor mode: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_round_trip_for_control_plane_images() {
        for role in [
            ServiceRole::Initializer,
            ServiceRole::ApiServer,
            ServiceRole::SchedulerLoop,
        ] {
            let kw = role.command_keyword().unwrap();
            assert_eq!(ServiceRole::from_keyword(kw), Some(role));
        }
        assert_eq!(ServiceRole::Store.command_keyword(), None);
        assert_eq!(ServiceRole::from_keyword("triggerer"), None);
    }

    #[test]
    fn only_servers_are_control_plane() {
        assert!(ServiceRole::ApiServer.is_control_plane());
        assert!(ServiceRole::SchedulerLoop.is_control_plane());
        assert!(!ServiceRole::Initializer.is_control_plane());
        assert!(!ServiceRole::Store.is_control_plane());
    }

    #[test]
    fn executor_accepts_long_spelling() {
        assert_eq!("LocalExecutor".parse::<ExecutorMode>(), Ok(ExecutorMode::Local));
        assert_eq!("sequential".parse::<ExecutorMode>(), Ok(ExecutorMode::Sequential));
        assert!("CeleryExecutor".parse::<ExecutorMode>().is_err());
    }
}
