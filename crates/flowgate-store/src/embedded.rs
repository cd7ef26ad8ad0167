//! EmbeddedStore — redb-backed metadata store.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. Tables
//! are created only by [`EmbeddedStore::apply_migration`]; every other
//! operation reports [`StoreError::SchemaNotMigrated`] when its table is
//! missing instead of creating it.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use redb::{
    Database, ReadOnlyTable, ReadTransaction, ReadableDatabase, ReadableTable, TableError,
    TableHandle, WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::migrations::Migration;
use crate::tables::{self, JsonTable};
use crate::types::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

type JsonReadTable = ReadOnlyTable<&'static str, &'static [u8]>;

/// Thread-safe metadata store backed by redb.
#[derive(Clone)]
pub struct EmbeddedStore {
    db: Arc<Database>,
}

impl EmbeddedStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        debug!(?path, "embedded store opened");
        Ok(Self { db: Arc::new(db) })
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        debug!("in-memory embedded store opened");
        Ok(Self { db: Arc::new(db) })
    }

    pub fn ping(&self) -> StoreResult<()> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        drop(txn);
        Ok(())
    }

    // ── Migrations ─────────────────────────────────────────────────

    pub fn applied_migrations(&self) -> StoreResult<BTreeSet<i64>> {
        let records: Vec<MigrationRecord> = self.scan(tables::SCHEMA_MIGRATIONS, "", false)?;
        Ok(records.into_iter().map(|r| r.version).collect())
    }

    /// Create the migration's tables and record it, in one transaction.
    pub fn apply_migration(&self, migration: &Migration, applied_at: Timestamp) -> StoreResult<()> {
        let record = MigrationRecord {
            version: migration.version,
            name: migration.name.to_string(),
            applied_at,
        };
        let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for name in migration.embedded_tables {
            let table = tables::by_name(name).ok_or_else(|| StoreError::Migration {
                version: migration.version,
                reason: format!("unknown table {name}"),
            })?;
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        {
            let mut ledger = txn
                .open_table(tables::SCHEMA_MIGRATIONS)
                .map_err(map_err!(Table))?;
            let key = format!("{:020}", migration.version);
            ledger
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(version = migration.version, name = migration.name, "migration applied");
        Ok(())
    }

    // ── Initialization record ──────────────────────────────────────

    /// The bootstrap record, or `None` before the first initialization.
    pub fn init_record(&self) -> StoreResult<Option<InitializationRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        match open_read(&txn, tables::INIT_RECORD)? {
            Some(table) => get_from(&table, tables::INIT_RECORD_KEY),
            None => Ok(None),
        }
    }

    pub fn put_init_record(&self, record: &InitializationRecord) -> StoreResult<()> {
        self.put(tables::INIT_RECORD, tables::INIT_RECORD_KEY, record)
    }

    // ── Principals ─────────────────────────────────────────────────

    pub fn get_principal(&self, username: &str) -> StoreResult<Option<Principal>> {
        self.get(tables::PRINCIPALS, username)
    }

    pub fn list_principals(&self) -> StoreResult<Vec<Principal>> {
        self.scan(tables::PRINCIPALS, "", true)
    }

    /// Insert unless a principal with that username exists. Returns true if
    /// inserted. Check and insert share one write transaction.
    pub fn create_principal_if_absent(&self, principal: &Principal) -> StoreResult<bool> {
        let value = serde_json::to_vec(principal).map_err(map_err!(Serialize))?;
        let txn = self.begin_data_write(tables::PRINCIPALS)?;
        let created;
        {
            let mut table = txn.open_table(tables::PRINCIPALS).map_err(map_err!(Table))?;
            let exists = table
                .get(principal.username.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if !exists {
                table
                    .insert(principal.username.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            created = !exists;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(created)
    }

    // ── Workflows ──────────────────────────────────────────────────

    /// Insert a definition, or refresh an existing one while keeping its
    /// pause state and creation time. Returns true if inserted.
    pub fn register_workflow(&self, def: &WorkflowDefinition) -> StoreResult<bool> {
        let txn = self.begin_data_write(tables::WORKFLOWS)?;
        let created;
        {
            let mut table = txn.open_table(tables::WORKFLOWS).map_err(map_err!(Table))?;
            let existing: Option<WorkflowDefinition> = match table
                .get(def.id.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let merged = match &existing {
                Some(old) => WorkflowDefinition {
                    is_paused: old.is_paused,
                    created_at: old.created_at,
                    ..def.clone()
                },
                None => def.clone(),
            };
            let value = serde_json::to_vec(&merged).map_err(map_err!(Serialize))?;
            table
                .insert(def.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            created = existing.is_none();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(created)
    }

    pub fn get_workflow(&self, id: &str) -> StoreResult<Option<WorkflowDefinition>> {
        self.get(tables::WORKFLOWS, id)
    }

    pub fn list_workflows(&self) -> StoreResult<Vec<WorkflowDefinition>> {
        self.scan(tables::WORKFLOWS, "", true)
    }

    /// Returns false if the workflow does not exist. Read and write share
    /// one write transaction, so a concurrent delete is never undone.
    pub fn set_workflow_paused(&self, id: &str, paused: bool, now: Timestamp) -> StoreResult<bool> {
        let txn = self.begin_data_write(tables::WORKFLOWS)?;
        {
            let mut table = txn.open_table(tables::WORKFLOWS).map_err(map_err!(Table))?;
            let existing: Option<WorkflowDefinition> =
                match table.get(id).map_err(map_err!(Read))? {
                    Some(guard) => {
                        Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                    }
                    None => None,
                };
            let Some(mut def) = existing else {
                drop(table);
                txn.abort().map_err(map_err!(Transaction))?;
                return Ok(false);
            };
            def.is_paused = paused;
            def.updated_at = now;
            let value = serde_json::to_vec(&def).map_err(map_err!(Serialize))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    /// Delete a workflow and its runs. Returns true if it existed.
    pub fn delete_workflow(&self, id: &str) -> StoreResult<bool> {
        let prefix = format!("{id}:");
        let txn = self.begin_data_write(tables::WORKFLOWS)?;
        let existed;
        let removed_runs;
        {
            let mut table = txn.open_table(tables::WORKFLOWS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
            let mut runs = txn.open_table(tables::WORKFLOW_RUNS).map_err(map_err!(Table))?;
            let run_keys = keys_with_prefix(&runs, &prefix)?;
            for key in &run_keys {
                runs.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            removed_runs = run_keys.len();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, existed, runs = removed_runs, "workflow deleted");
        Ok(existed)
    }

    // ── Runs ───────────────────────────────────────────────────────

    /// Insert a run unless it already exists. Returns true if inserted.
    pub fn insert_run(&self, run: &WorkflowRun) -> StoreResult<bool> {
        let key = run.table_key();
        let value = serde_json::to_vec(run).map_err(map_err!(Serialize))?;
        let txn = self.begin_data_write(tables::WORKFLOW_RUNS)?;
        let inserted;
        {
            let mut table = txn.open_table(tables::WORKFLOW_RUNS).map_err(map_err!(Table))?;
            inserted = table.get(key.as_str()).map_err(map_err!(Read))?.is_none();
            if inserted {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(inserted)
    }

    /// Runs of a workflow ordered by logical time.
    pub fn list_runs(&self, workflow_id: &str) -> StoreResult<Vec<WorkflowRun>> {
        self.scan(tables::WORKFLOW_RUNS, &format!("{workflow_id}:"), true)
    }

    pub fn latest_run(&self, workflow_id: &str) -> StoreResult<Option<WorkflowRun>> {
        Ok(self.list_runs(workflow_id)?.pop())
    }

    // ── Heartbeats ─────────────────────────────────────────────────

    pub fn record_heartbeat(&self, role: &str, at: Timestamp) -> StoreResult<()> {
        let beat = Heartbeat {
            role: role.to_string(),
            at,
        };
        self.put(tables::HEARTBEATS, role, &beat)
    }

    pub fn latest_heartbeat(&self, role: &str) -> StoreResult<Option<Timestamp>> {
        let beat: Option<Heartbeat> = self.get(tables::HEARTBEATS, role)?;
        Ok(beat.map(|b| b.at))
    }

    // ── Helpers ────────────────────────────────────────────────────

    /// Begin a write transaction on a data table that must already exist.
    fn begin_data_write(&self, table: JsonTable) -> StoreResult<WriteTransaction> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let exists = txn
            .list_tables()
            .map_err(map_err!(Table))?
            .any(|handle| handle.name() == table.name());
        if !exists {
            txn.abort().map_err(map_err!(Transaction))?;
            return Err(StoreError::SchemaNotMigrated(format!(
                "table {} does not exist",
                table.name()
            )));
        }
        Ok(txn)
    }

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StoreResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.begin_data_write(table)?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StoreResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = require(open_read(&txn, table)?, table)?;
        get_from(&t, key)
    }

    /// All values whose key starts with `prefix`, in key order. A missing
    /// table is an error when `required`, otherwise an empty result.
    fn scan<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        prefix: &str,
        required: bool,
    ) -> StoreResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = match open_read(&txn, table)? {
            Some(t) => t,
            None if required => return Err(not_migrated(table)),
            None => return Ok(Vec::new()),
        };
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }
}

/// Keys starting with `prefix`, in key order. Any read error fails the scan.
fn keys_with_prefix<T>(table: &T, prefix: &str) -> StoreResult<Vec<String>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut keys = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            keys.push(key.value().to_string());
        }
    }
    Ok(keys)
}

fn open_read(txn: &ReadTransaction, table: JsonTable) -> StoreResult<Option<JsonReadTable>> {
    match txn.open_table(table) {
        Ok(t) => Ok(Some(t)),
        Err(TableError::TableDoesNotExist(_)) => Ok(None),
        Err(e) => Err(StoreError::Table(e.to_string())),
    }
}

fn require(t: Option<JsonReadTable>, table: JsonTable) -> StoreResult<JsonReadTable> {
    t.ok_or_else(|| not_migrated(table))
}

fn not_migrated(table: JsonTable) -> StoreError {
    StoreError::SchemaNotMigrated(format!("table {} does not exist", table.name()))
}

fn get_from<T: DeserializeOwned>(t: &JsonReadTable, key: &str) -> StoreResult<Option<T>> {
    match t.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::MIGRATIONS;

    fn migrated_store() -> EmbeddedStore {
        let store = EmbeddedStore::open_in_memory().unwrap();
        for m in MIGRATIONS {
            store.apply_migration(m, 1000).unwrap();
        }
        store
    }

    fn test_workflow(id: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.to_string(),
            description: "daily crawl".to_string(),
            schedule: Some("@daily".to_string()),
            tags: vec!["crawler".to_string()],
            is_example: false,
            is_paused: true,
            source: None,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    // ── Schema ─────────────────────────────────────────────────────

    #[test]
    fn fresh_store_has_no_schema() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        assert!(store.applied_migrations().unwrap().is_empty());
        assert!(store.init_record().unwrap().is_none());
        assert!(matches!(
            store.list_workflows(),
            Err(StoreError::SchemaNotMigrated(_))
        ));
    }

    #[test]
    fn writes_never_create_tables_implicitly() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        let err = store.record_heartbeat("scheduler_loop", 1).unwrap_err();
        assert!(matches!(err, StoreError::SchemaNotMigrated(_)));
        assert!(matches!(
            store.get_principal("admin"),
            Err(StoreError::SchemaNotMigrated(_))
        ));
    }

    #[test]
    fn migrations_are_recorded() {
        let store = migrated_store();
        let applied = store.applied_migrations().unwrap();
        let expected: BTreeSet<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        assert_eq!(applied, expected);
        assert!(store.list_workflows().unwrap().is_empty());
    }

    #[test]
    fn partial_migration_exposes_only_its_tables() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        store.apply_migration(&MIGRATIONS[0], 1).unwrap();
        assert!(store.get_principal("admin").unwrap().is_none());
        assert!(matches!(
            store.list_workflows(),
            Err(StoreError::SchemaNotMigrated(_))
        ));
    }

    // ── Principals ─────────────────────────────────────────────────

    #[test]
    fn principal_created_once() {
        let store = migrated_store();
        let first = Principal::new("admin", "pw", PrincipalRole::Admin, 1);
        let second = Principal::new("admin", "other", PrincipalRole::Admin, 2);

        assert!(store.create_principal_if_absent(&first).unwrap());
        assert!(!store.create_principal_if_absent(&second).unwrap());

        let stored = store.get_principal("admin").unwrap().unwrap();
        assert!(stored.verify("pw"));
        assert_eq!(store.list_principals().unwrap().len(), 1);
    }

    // ── Workflows ──────────────────────────────────────────────────

    #[test]
    fn register_preserves_pause_state() {
        let store = migrated_store();
        assert!(store.register_workflow(&test_workflow("crawl")).unwrap());
        assert!(store.set_workflow_paused("crawl", false, 2000).unwrap());

        let mut refreshed = test_workflow("crawl");
        refreshed.description = "updated".to_string();
        refreshed.created_at = 5000;
        assert!(!store.register_workflow(&refreshed).unwrap());

        let stored = store.get_workflow("crawl").unwrap().unwrap();
        assert!(!stored.is_paused);
        assert_eq!(stored.description, "updated");
        assert_eq!(stored.created_at, 1000);
    }

    #[test]
    fn pause_unknown_workflow_returns_false() {
        let store = migrated_store();
        assert!(!store.set_workflow_paused("nope", true, 1).unwrap());
        assert!(store.get_workflow("nope").unwrap().is_none());
    }

    #[test]
    fn pause_after_delete_does_not_resurrect() {
        let store = migrated_store();
        store.register_workflow(&test_workflow("crawl")).unwrap();
        assert!(store.delete_workflow("crawl").unwrap());

        assert!(!store.set_workflow_paused("crawl", false, 2000).unwrap());
        assert!(store.get_workflow("crawl").unwrap().is_none());
        assert!(store.list_workflows().unwrap().is_empty());
    }

    #[test]
    fn concurrent_pause_and_delete_leave_no_definition() {
        let store = migrated_store();
        for round in 0..50 {
            store.register_workflow(&test_workflow("crawl")).unwrap();
            let pauser = {
                let store = store.clone();
                std::thread::spawn(move || store.set_workflow_paused("crawl", round % 2 == 0, round))
            };
            let deleter = {
                let store = store.clone();
                std::thread::spawn(move || store.delete_workflow("crawl"))
            };
            pauser.join().unwrap().unwrap();
            assert!(deleter.join().unwrap().unwrap());
            assert!(store.get_workflow("crawl").unwrap().is_none(), "round {round}");
        }
    }

    #[test]
    fn keys_with_prefix_stops_at_the_separator() {
        let store = migrated_store();
        store.insert_run(&WorkflowRun::scheduled("crawl", 10)).unwrap();
        store.insert_run(&WorkflowRun::scheduled("crawl", 20)).unwrap();
        store.insert_run(&WorkflowRun::scheduled("crawl_extra", 10)).unwrap();

        let txn = store.db.begin_read().unwrap();
        let runs = txn.open_table(tables::WORKFLOW_RUNS).unwrap();
        let keys = keys_with_prefix(&runs, "crawl:").unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.starts_with("crawl:")));
    }

    #[test]
    fn delete_workflow_removes_runs() {
        let store = migrated_store();
        store.register_workflow(&test_workflow("crawl")).unwrap();
        store.register_workflow(&test_workflow("crawl_extra")).unwrap();
        store.insert_run(&WorkflowRun::scheduled("crawl", 10)).unwrap();
        store.insert_run(&WorkflowRun::scheduled("crawl_extra", 10)).unwrap();

        assert!(store.delete_workflow("crawl").unwrap());
        assert!(store.list_runs("crawl").unwrap().is_empty());
        assert_eq!(store.list_runs("crawl_extra").unwrap().len(), 1);
        assert!(!store.delete_workflow("crawl").unwrap());
    }

    // ── Runs ───────────────────────────────────────────────────────

    #[test]
    fn runs_are_unique_and_ordered() {
        let store = migrated_store();
        store.register_workflow(&test_workflow("crawl")).unwrap();

        assert!(store.insert_run(&WorkflowRun::scheduled("crawl", 200)).unwrap());
        assert!(store.insert_run(&WorkflowRun::scheduled("crawl", 100)).unwrap());
        assert!(!store.insert_run(&WorkflowRun::scheduled("crawl", 100)).unwrap());

        let runs = store.list_runs("crawl").unwrap();
        let times: Vec<_> = runs.iter().map(|r| r.logical_ts).collect();
        assert_eq!(times, vec![100, 200]);
        assert_eq!(store.latest_run("crawl").unwrap().unwrap().logical_ts, 200);
    }

    // ── Heartbeats ─────────────────────────────────────────────────

    #[test]
    fn heartbeat_overwrites() {
        let store = migrated_store();
        assert_eq!(store.latest_heartbeat("scheduler_loop").unwrap(), None);
        store.record_heartbeat("scheduler_loop", 10).unwrap();
        store.record_heartbeat("scheduler_loop", 20).unwrap();
        assert_eq!(store.latest_heartbeat("scheduler_loop").unwrap(), Some(20));
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("meta.redb");

        {
            let store = EmbeddedStore::open(&db_path).unwrap();
            for m in MIGRATIONS {
                store.apply_migration(m, 1).unwrap();
            }
            store.register_workflow(&test_workflow("crawl")).unwrap();
        }

        let store = EmbeddedStore::open(&db_path).unwrap();
        assert_eq!(store.applied_migrations().unwrap().len(), MIGRATIONS.len());
        assert!(store.get_workflow("crawl").unwrap().is_some());
    }
}
