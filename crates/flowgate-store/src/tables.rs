//! redb table definitions for the embedded backend.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).
//! PostgreSQL table names are the same names with a `flowgate_` prefix.

use redb::TableDefinition;

pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Applied migrations keyed by zero-padded version.
pub const SCHEMA_MIGRATIONS: JsonTable = TableDefinition::new("schema_migrations");

/// The single initialization record, keyed by [`INIT_RECORD_KEY`].
pub const INIT_RECORD: JsonTable = TableDefinition::new("init_record");
pub const INIT_RECORD_KEY: &str = "bootstrap";

/// Principals keyed by username.
pub const PRINCIPALS: JsonTable = TableDefinition::new("principals");

/// Workflow definitions keyed by workflow id.
pub const WORKFLOWS: JsonTable = TableDefinition::new("workflows");

/// Runs keyed by `{workflow_id}:{logical_ts:020}:{run_id}`.
pub const WORKFLOW_RUNS: JsonTable = TableDefinition::new("workflow_runs");

/// Latest heartbeat keyed by role name.
pub const HEARTBEATS: JsonTable = TableDefinition::new("heartbeats");

/// Look up a data table by name (used by migrations).
pub fn by_name(name: &str) -> Option<JsonTable> {
    [INIT_RECORD, PRINCIPALS, WORKFLOWS, WORKFLOW_RUNS, HEARTBEATS]
        .into_iter()
        .find(|table| redb::TableHandle::name(table) == name)
}
