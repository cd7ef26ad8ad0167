//! Process exit codes.
//!
//! | code | meaning |
//! |---|---|
//! | 0 | success |
//! | 1 | any other failure |
//! | 2 | store unreachable |
//! | 3 | initialization failed |

use thiserror::Error;

use flowgate_core::ServiceRole;
use flowgate_init::InitError;

pub const GENERIC_FAILURE: u8 = 1;
pub const STORE_UNREACHABLE: u8 = 2;
pub const INITIALIZATION_FAILED: u8 = 3;

/// Failures that map to a specific exit code.
#[derive(Debug, Error)]
pub enum Fatal {
    #[error("{target} unreachable after {attempts} attempts: {reason}")]
    StoreUnreachable {
        target: String,
        attempts: u32,
        reason: String,
    },

    #[error("startup failed at {role}: {reason}")]
    Startup { role: ServiceRole, reason: String },
}

impl Fatal {
    fn code(&self) -> u8 {
        match self {
            Fatal::StoreUnreachable { .. } => STORE_UNREACHABLE,
            Fatal::Startup { role, .. } => match role {
                ServiceRole::Store => STORE_UNREACHABLE,
                ServiceRole::Initializer => INITIALIZATION_FAILED,
                ServiceRole::ApiServer | ServiceRole::SchedulerLoop => GENERIC_FAILURE,
            },
        }
    }
}

/// Exit code for an error, from the first cause that carries one.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(fatal) = cause.downcast_ref::<Fatal>() {
            return fatal.code();
        }
        if let Some(init) = cause.downcast_ref::<InitError>() {
            return u8::try_from(init.exit_code()).unwrap_or(GENERIC_FAILURE);
        }
    }
    GENERIC_FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;

    use anyhow::Context;

    #[test]
    fn unreachable_store_is_two() {
        let err = anyhow::Error::new(Fatal::StoreUnreachable {
            target: "postgres metadata store".into(),
            attempts: 5,
            reason: "connection refused".into(),
        });
        assert_eq!(exit_code(&err), STORE_UNREACHABLE);
    }

    #[test]
    fn startup_failures_map_by_role() {
        let at = |role| {
            anyhow::Error::new(Fatal::Startup {
                role,
                reason: "boom".into(),
            })
        };
        assert_eq!(exit_code(&at(ServiceRole::Store)), STORE_UNREACHABLE);
        assert_eq!(exit_code(&at(ServiceRole::Initializer)), INITIALIZATION_FAILED);
        assert_eq!(exit_code(&at(ServiceRole::ApiServer)), GENERIC_FAILURE);
    }

    #[test]
    fn init_errors_keep_their_code_under_context() {
        let err = Err::<(), _>(InitError::InvalidCredentials("password missing".into()))
            .context("bootstrap")
            .unwrap_err();
        assert_eq!(exit_code(&err), INITIALIZATION_FAILED);

        let err = anyhow::Error::new(InitError::StoreUnreachable("refused".into()));
        assert_eq!(exit_code(&err), STORE_UNREACHABLE);
    }

    #[test]
    fn anything_else_is_one() {
        assert_eq!(exit_code(&anyhow::anyhow!("bind failed")), GENERIC_FAILURE);
    }
}
