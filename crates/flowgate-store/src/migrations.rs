//! Versioned schema migrations.
//!
//! Each migration carries its PostgreSQL DDL and the redb tables it
//! creates. Versions are applied in ascending order, each in its own
//! transaction together with its ledger entry.

use std::collections::BTreeSet;

/// A single schema migration.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    /// DDL for the PostgreSQL backend.
    pub postgres: &'static str,
    /// Tables created on the embedded backend.
    pub embedded_tables: &'static [&'static str],
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create bootstrap tables",
        postgres: r#"
            CREATE TABLE IF NOT EXISTS flowgate_init_record (
                id SMALLINT PRIMARY KEY CHECK (id = 1),
                schema_version BIGINT NOT NULL,
                schema_migrated BOOLEAN NOT NULL,
                admin_created BOOLEAN NOT NULL,
                completed_at BIGINT
            );
            CREATE TABLE IF NOT EXISTS flowgate_principals (
                username TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at BIGINT NOT NULL
            );
        "#,
        embedded_tables: &["init_record", "principals"],
    },
    Migration {
        version: 2,
        name: "create workflow tables",
        postgres: r#"
            CREATE TABLE IF NOT EXISTS flowgate_workflows (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL DEFAULT '',
                schedule TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                is_example BOOLEAN NOT NULL DEFAULT FALSE,
                is_paused BOOLEAN NOT NULL DEFAULT TRUE,
                source TEXT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS flowgate_workflow_runs (
                run_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL REFERENCES flowgate_workflows (id) ON DELETE CASCADE,
                logical_ts BIGINT NOT NULL,
                state TEXT NOT NULL,
                created_at BIGINT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS flowgate_workflow_runs_by_workflow
                ON flowgate_workflow_runs (workflow_id, logical_ts);
        "#,
        embedded_tables: &["workflows", "workflow_runs"],
    },
    Migration {
        version: 3,
        name: "create heartbeat table",
        postgres: r#"
            CREATE TABLE IF NOT EXISTS flowgate_heartbeats (
                role TEXT PRIMARY KEY,
                at BIGINT NOT NULL
            );
        "#,
        embedded_tables: &["heartbeats"],
    },
];

/// Highest schema version this build knows about.
pub fn latest_version() -> i64 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Migrations not yet in `applied`, in ascending version order.
pub fn pending(applied: &BTreeSet<i64>) -> Vec<&'static Migration> {
    let mut pending: Vec<_> = MIGRATIONS
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();
    pending.sort_by_key(|m| m.version);
    pending
}
