//! PostgresStore — sqlx-backed metadata store.
//!
//! Tables carry a `flowgate_` prefix. The migration ledger lives in
//! `flowgate_schema_migrations`; it is created together with the first
//! migration so that read-only roles never alter the schema.

use std::collections::BTreeSet;
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Postgres, Row};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::migrations::Migration;
use crate::types::*;

/// Advisory lock key serializing concurrent initializers.
const INIT_LOCK_KEY: i64 = 0x666c_6f77_6761_7465;

const LEDGER_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS flowgate_schema_migrations (
        version BIGINT PRIMARY KEY,
        name TEXT NOT NULL,
        applied_at BIGINT NOT NULL
    )
"#;

const WORKFLOW_COLUMNS: &str =
    "id, description, schedule, tags, is_example, is_paused, source, created_at, updated_at";

/// Shared connection pool to a PostgreSQL metadata database.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Build a pool without connecting. The first query (usually the
    /// readiness probe) opens the first connection.
    pub fn connect_lazy(url: &str, acquire_timeout: Duration) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)
            .map_err(|e| StoreError::Open(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    // ── Migrations ─────────────────────────────────────────────────

    pub async fn applied_migrations(&self) -> StoreResult<BTreeSet<i64>> {
        if !self.table_exists("flowgate_schema_migrations").await? {
            return Ok(BTreeSet::new());
        }
        let versions = sqlx::query_scalar::<_, i64>("SELECT version FROM flowgate_schema_migrations")
            .fetch_all(&self.pool)
            .await?;
        Ok(versions.into_iter().collect())
    }

    /// Run the migration's DDL and record it, in one transaction.
    pub async fn apply_migration(&self, migration: &Migration, applied_at: Timestamp) -> StoreResult<()> {
        let fail = |e: sqlx::Error| StoreError::Migration {
            version: migration.version,
            reason: e.to_string(),
        };
        let mut tx = self.pool.begin().await?;
        tx.execute(sqlx::raw_sql(LEDGER_DDL)).await.map_err(fail)?;
        tx.execute(sqlx::raw_sql(migration.postgres))
            .await
            .map_err(fail)?;
        sqlx::query(
            "INSERT INTO flowgate_schema_migrations (version, name, applied_at) \
             VALUES ($1, $2, $3) ON CONFLICT (version) DO NOTHING",
        )
        .bind(migration.version)
        .bind(migration.name)
        .bind(applied_at)
        .execute(&mut *tx)
        .await
        .map_err(fail)?;
        tx.commit().await.map_err(fail)?;
        debug!(version = migration.version, name = migration.name, "migration applied");
        Ok(())
    }

    /// Take the session-level initialization lock on a dedicated connection.
    pub async fn lock_initialization(&self) -> StoreResult<PoolConnection<Postgres>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(INIT_LOCK_KEY)
            .execute(&mut *conn)
            .await?;
        debug!("initialization lock acquired");
        Ok(conn)
    }

    pub async fn unlock_initialization(mut conn: PoolConnection<Postgres>) -> StoreResult<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(INIT_LOCK_KEY)
            .execute(&mut *conn)
            .await?;
        debug!("initialization lock released");
        Ok(())
    }

    // ── Initialization record ──────────────────────────────────────

    pub async fn init_record(&self) -> StoreResult<Option<InitializationRecord>> {
        if !self.table_exists("flowgate_init_record").await? {
            return Ok(None);
        }
        let row = sqlx::query(
            "SELECT schema_version, schema_migrated, admin_created, completed_at \
             FROM flowgate_init_record WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> StoreResult<InitializationRecord> {
            Ok(InitializationRecord {
                schema_version: row.try_get("schema_version")?,
                schema_migrated: row.try_get("schema_migrated")?,
                admin_created: row.try_get("admin_created")?,
                completed_at: row.try_get("completed_at")?,
            })
        })
        .transpose()
    }

    pub async fn put_init_record(&self, record: &InitializationRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO flowgate_init_record \
             (id, schema_version, schema_migrated, admin_created, completed_at) \
             VALUES (1, $1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET \
             schema_version = EXCLUDED.schema_version, \
             schema_migrated = EXCLUDED.schema_migrated, \
             admin_created = EXCLUDED.admin_created, \
             completed_at = EXCLUDED.completed_at",
        )
        .bind(record.schema_version)
        .bind(record.schema_migrated)
        .bind(record.admin_created)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Principals ─────────────────────────────────────────────────

    pub async fn get_principal(&self, username: &str) -> StoreResult<Option<Principal>> {
        let row = sqlx::query(
            "SELECT username, password_hash, salt, role, created_at \
             FROM flowgate_principals WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(principal_from_row).transpose()
    }

    pub async fn list_principals(&self) -> StoreResult<Vec<Principal>> {
        let rows = sqlx::query(
            "SELECT username, password_hash, salt, role, created_at \
             FROM flowgate_principals ORDER BY username",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(principal_from_row).collect()
    }

    pub async fn create_principal_if_absent(&self, principal: &Principal) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO flowgate_principals (username, password_hash, salt, role, created_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (username) DO NOTHING",
        )
        .bind(&principal.username)
        .bind(&principal.password_hash)
        .bind(&principal.salt)
        .bind(principal.role.as_str())
        .bind(principal.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ── Workflows ──────────────────────────────────────────────────

    pub async fn register_workflow(&self, def: &WorkflowDefinition) -> StoreResult<bool> {
        let tags = serde_json::to_string(&def.tags).map_err(|e| StoreError::Serialize(e.to_string()))?;
        let inserted = sqlx::query_scalar::<_, bool>(
            "INSERT INTO flowgate_workflows \
             (id, description, schedule, tags, is_example, is_paused, source, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO UPDATE SET \
             description = EXCLUDED.description, \
             schedule = EXCLUDED.schedule, \
             tags = EXCLUDED.tags, \
             is_example = EXCLUDED.is_example, \
             source = EXCLUDED.source, \
             updated_at = EXCLUDED.updated_at \
             RETURNING (xmax = 0)",
        )
        .bind(&def.id)
        .bind(&def.description)
        .bind(&def.schedule)
        .bind(tags)
        .bind(def.is_example)
        .bind(def.is_paused)
        .bind(&def.source)
        .bind(def.created_at)
        .bind(def.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(inserted)
    }

    pub async fn get_workflow(&self, id: &str) -> StoreResult<Option<WorkflowDefinition>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM flowgate_workflows WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    pub async fn list_workflows(&self) -> StoreResult<Vec<WorkflowDefinition>> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM flowgate_workflows ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(workflow_from_row).collect()
    }

    pub async fn set_workflow_paused(&self, id: &str, paused: bool, now: Timestamp) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE flowgate_workflows SET is_paused = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(paused)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Runs go with the workflow (`ON DELETE CASCADE`).
    pub async fn delete_workflow(&self, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM flowgate_workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // ── Runs ───────────────────────────────────────────────────────

    pub async fn insert_run(&self, run: &WorkflowRun) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO flowgate_workflow_runs (run_id, workflow_id, logical_ts, state, created_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (run_id) DO NOTHING",
        )
        .bind(&run.run_id)
        .bind(&run.workflow_id)
        .bind(run.logical_ts)
        .bind(run.state.as_str())
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_runs(&self, workflow_id: &str) -> StoreResult<Vec<WorkflowRun>> {
        let rows = sqlx::query(
            "SELECT run_id, workflow_id, logical_ts, state, created_at \
             FROM flowgate_workflow_runs WHERE workflow_id = $1 ORDER BY logical_ts",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn latest_run(&self, workflow_id: &str) -> StoreResult<Option<WorkflowRun>> {
        let row = sqlx::query(
            "SELECT run_id, workflow_id, logical_ts, state, created_at \
             FROM flowgate_workflow_runs WHERE workflow_id = $1 \
             ORDER BY logical_ts DESC LIMIT 1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    // ── Heartbeats ─────────────────────────────────────────────────

    pub async fn record_heartbeat(&self, role: &str, at: Timestamp) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO flowgate_heartbeats (role, at) VALUES ($1, $2) \
             ON CONFLICT (role) DO UPDATE SET at = EXCLUDED.at",
        )
        .bind(role)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_heartbeat(&self, role: &str) -> StoreResult<Option<Timestamp>> {
        let at = sqlx::query_scalar::<_, i64>("SELECT at FROM flowgate_heartbeats WHERE role = $1")
            .bind(role)
            .fetch_optional(&self.pool)
            .await?;
        Ok(at)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn principal_from_row(row: &PgRow) -> StoreResult<Principal> {
    let role: String = row.try_get("role")?;
    Ok(Principal {
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        salt: row.try_get("salt")?,
        role: role.parse().map_err(StoreError::Deserialize)?,
        created_at: row.try_get("created_at")?,
    })
}

fn workflow_from_row(row: &PgRow) -> StoreResult<WorkflowDefinition> {
    let tags: String = row.try_get("tags")?;
    Ok(WorkflowDefinition {
        id: row.try_get("id")?,
        description: row.try_get("description")?,
        schedule: row.try_get("schedule")?,
        tags: serde_json::from_str(&tags).map_err(|e| StoreError::Deserialize(e.to_string()))?,
        is_example: row.try_get("is_example")?,
        is_paused: row.try_get("is_paused")?,
        source: row.try_get("source")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_from_row(row: &PgRow) -> StoreResult<WorkflowRun> {
    let state: String = row.try_get("state")?;
    Ok(WorkflowRun {
        run_id: row.try_get("run_id")?,
        workflow_id: row.try_get("workflow_id")?,
        logical_ts: row.try_get("logical_ts")?,
        state: state.parse().map_err(StoreError::Deserialize)?,
        created_at: row.try_get("created_at")?,
    })
}
