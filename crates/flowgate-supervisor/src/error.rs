//! Supervisor error types.

use std::time::Duration;

use thiserror::Error;

use flowgate_core::ServiceRole;

/// Errors raised while launching or tracking role processes.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {role}: {reason}")]
    Spawn { role: ServiceRole, reason: String },

    #[error("{role} exited with {}", describe_exit(.code))]
    OneShotFailed { role: ServiceRole, code: Option<i32> },

    #[error("{role} stopped by shutdown before completing")]
    Interrupted { role: ServiceRole },

    #[error("{role} did not finish within {limit:?}")]
    TimedOut { role: ServiceRole, limit: Duration },

    #[error("{0} is already supervised")]
    AlreadySupervised(ServiceRole),

    #[error("{0} is not supervised")]
    NotSupervised(ServiceRole),

    #[error("cannot locate the flowgate binary: {0}")]
    Program(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Errors found while validating a startup graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate node: {0}")]
    DuplicateNode(ServiceRole),

    #[error("{node} depends on {dependency}, which is not in the graph")]
    MissingDependency {
        node: ServiceRole,
        dependency: ServiceRole,
    },

    #[error("dependency cycle through {0}")]
    Cycle(ServiceRole),
}

pub type GraphResult<T> = Result<T, GraphError>;
