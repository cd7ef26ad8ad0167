//! Records persisted in the metadata store.
//!
//! All types serialize to JSON for the embedded backend and map onto
//! plain columns for PostgreSQL. Timestamps are unix seconds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Unix timestamp in seconds.
pub type Timestamp = i64;

/// Current unix time in seconds.
pub fn epoch_secs() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as Timestamp
}

// ── Bootstrap ─────────────────────────────────────────────────────

/// One applied schema migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    pub applied_at: Timestamp,
}

/// Progress of the one-time bootstrap, stored in the store itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InitializationRecord {
    pub schema_version: i64,
    pub schema_migrated: bool,
    pub admin_created: bool,
    pub completed_at: Option<Timestamp>,
}

impl InitializationRecord {
    /// Whether the bootstrap finished against the given schema version.
    pub fn is_complete_for(&self, latest_version: i64) -> bool {
        self.completed_at.is_some()
            && self.schema_migrated
            && self.schema_version >= latest_version
    }
}

// ── Principals ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalRole {
    Admin,
    Viewer,
}

impl PrincipalRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PrincipalRole::Admin => "admin",
            PrincipalRole::Viewer => "viewer",
        }
    }
}

impl FromStr for PrincipalRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(PrincipalRole::Admin),
            "viewer" => Ok(PrincipalRole::Viewer),
            other => Err(format!("unknown principal role: {other}")),
        }
    }
}

/// A user allowed to operate the platform.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Principal {
    pub username: String,
    /// Hex SHA-256 of `salt:password`.
    pub password_hash: String,
    pub salt: String,
    pub role: PrincipalRole,
    pub created_at: Timestamp,
}

impl Principal {
    /// Build a principal with a fresh random salt.
    pub fn new(username: &str, password: &str, role: PrincipalRole, created_at: Timestamp) -> Self {
        let salt = uuid::Uuid::new_v4().simple().to_string();
        let password_hash = hash_password(&salt, password);
        Self {
            username: username.to_string(),
            password_hash,
            salt,
            role,
            created_at,
        }
    }

    pub fn verify(&self, password: &str) -> bool {
        hash_password(&self.salt, password) == self.password_hash
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal")
            .field("username", &self.username)
            .field("role", &self.role)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

// ── Workflows ─────────────────────────────────────────────────────

/// A workflow definition known to the platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// `@once`, `@hourly`, `@daily`, `@weekly`, or a duration such as `6h`.
    pub schedule: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Shipped with the platform rather than read from the workflows folder.
    pub is_example: bool,
    pub is_paused: bool,
    /// File the definition was read from.
    pub source: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// State of a run. Only `Queued` is ever written by the scheduler loop;
/// executing runs is left to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Success,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Failed => "failed",
        }
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunState::Queued),
            "running" => Ok(RunState::Running),
            "success" => Ok(RunState::Success),
            "failed" => Ok(RunState::Failed),
            other => Err(format!("unknown run state: {other}")),
        }
    }
}

/// A task invocation emitted by the scheduler loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRun {
    pub run_id: String,
    pub workflow_id: String,
    /// The schedule slot this run covers.
    pub logical_ts: Timestamp,
    pub state: RunState,
    pub created_at: Timestamp,
}

impl WorkflowRun {
    /// A queued run for `workflow_id` at `logical_ts`.
    pub fn scheduled(workflow_id: &str, logical_ts: Timestamp) -> Self {
        Self {
            run_id: format!("scheduled__{workflow_id}__{logical_ts}"),
            workflow_id: workflow_id.to_string(),
            logical_ts,
            state: RunState::Queued,
            created_at: epoch_secs(),
        }
    }

    /// Build the composite key for the runs table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}:{}", self.workflow_id, self.logical_ts, self.run_id)
    }
}

/// Latest liveness mark written by a role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    pub role: String,
    pub at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_verifies_its_own_password() {
        let p = Principal::new("admin", "admin", PrincipalRole::Admin, 1000);
        assert!(p.verify("admin"));
        assert!(!p.verify("Admin"));
        assert_eq!(p.password_hash.len(), 64);
    }

    #[test]
    fn principals_with_same_password_get_distinct_hashes() {
        let a = Principal::new("a", "pw", PrincipalRole::Admin, 1);
        let b = Principal::new("b", "pw", PrincipalRole::Admin, 1);
        assert_ne!(a.password_hash, b.password_hash);
    }

    #[test]
    fn principal_debug_hides_secrets() {
        let p = Principal::new("admin", "hunter2", PrincipalRole::Admin, 1);
        let rendered = format!("{p:?}");
        assert!(!rendered.contains(&p.password_hash));
        assert!(!rendered.contains(&p.salt));
    }

    #[test]
    fn init_record_completion_tracks_schema_version() {
        let record = InitializationRecord {
            schema_version: 3,
            schema_migrated: true,
            admin_created: true,
            completed_at: Some(10),
        };
        assert!(record.is_complete_for(3));
        assert!(!record.is_complete_for(4));
        assert!(!InitializationRecord::default().is_complete_for(0));
    }

    #[test]
    fn run_keys_sort_by_logical_time() {
        let early = WorkflowRun::scheduled("etl", 99);
        let late = WorkflowRun::scheduled("etl", 1000);
        assert!(early.table_key() < late.table_key());
        assert_eq!(early.run_id, "scheduled__etl__99");
    }
}
