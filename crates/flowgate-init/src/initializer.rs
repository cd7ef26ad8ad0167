//! Bootstrap sequence.
//!
//! ```text
//! ping ─► lock ─► read record ─► migrate (db_upgrade) ─► admin (user_create) ─► mark complete ─► unlock
//! ```
//!
//! The lock is a PostgreSQL session advisory lock, so two initializers
//! started against the same database run one after the other.

use serde::Serialize;
use tracing::{debug, info, warn};

use flowgate_core::config::BootstrapSettings;
use flowgate_store::migrations::{latest_version, pending};
use flowgate_store::{InitializationRecord, MetaStore, Principal, PrincipalRole, epoch_secs};

use crate::error::{InitError, InitResult};

/// What one initializer run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InitReport {
    /// Versions applied by this run, ascending.
    pub migrations_applied: Vec<i64>,
    /// Schema version after the run.
    pub schema_version: i64,
    /// Whether this run created the admin principal.
    pub admin_created: bool,
    /// Whether the record already showed a completed bootstrap.
    pub already_initialized: bool,
}

impl InitReport {
    /// Whether the run changed anything in the store.
    pub fn changed(&self) -> bool {
        !self.migrations_applied.is_empty() || self.admin_created
    }
}

/// The bootstrap initializer.
pub struct Initializer {
    store: MetaStore,
    settings: BootstrapSettings,
}

impl Initializer {
    pub fn new(store: MetaStore, settings: BootstrapSettings) -> Self {
        Self { store, settings }
    }

    /// Run the bootstrap once.
    ///
    /// Fails with `StoreUnreachable` if the store does not answer, and with
    /// `SchemaOutdated` when the schema is behind while upgrades are off.
    pub async fn initialize(&self) -> InitResult<InitReport> {
        self.store.ping().await.map_err(InitError::from_store)?;
        let admin = self.admin_credentials()?;

        let lock = self
            .store
            .lock_initialization()
            .await
            .map_err(InitError::from_store)?;
        let result = self.run_locked(admin).await;
        if let Err(e) = lock.release().await {
            warn!(error = %e, "failed to release initialization lock");
        }

        if let Ok(report) = &result {
            info!(
                schema_version = report.schema_version,
                migrations = report.migrations_applied.len(),
                admin_created = report.admin_created,
                "initialization complete"
            );
        }
        result
    }

    /// Username and password to provision, when admin creation is on.
    fn admin_credentials(&self) -> InitResult<Option<(&str, &str)>> {
        if !self.settings.user_create {
            return Ok(None);
        }
        let username = self.settings.username.trim();
        if username.is_empty() {
            return Err(InitError::InvalidCredentials("username is empty".into()));
        }
        match self.settings.password.as_deref() {
            Some(password) if !password.is_empty() => Ok(Some((username, password))),
            _ => Err(InitError::InvalidCredentials(format!(
                "no password configured for {username}"
            ))),
        }
    }

    async fn run_locked(&self, admin: Option<(&str, &str)>) -> InitResult<InitReport> {
        let latest = latest_version();
        let mut report = InitReport::default();

        let applied = self
            .store
            .applied_migrations()
            .await
            .map_err(InitError::from_store)?;
        let current = applied.last().copied().unwrap_or(0);

        // The record table only exists once the first migration ran.
        let mut record = if current > 0 {
            self.store
                .init_record()
                .await
                .map_err(InitError::from_store)?
                .unwrap_or_default()
        } else {
            InitializationRecord::default()
        };
        report.already_initialized = record.is_complete_for(latest);

        let todo = pending(&applied);
        if todo.is_empty() {
            debug!(version = current, "schema already current");
        } else if !self.settings.db_upgrade {
            return Err(InitError::SchemaOutdated { current, latest });
        } else {
            info!(from = current, to = latest, count = todo.len(), "migrating schema");
            for migration in todo {
                self.store
                    .apply_migration(migration)
                    .await
                    .map_err(InitError::from_store)?;
                report.migrations_applied.push(migration.version);
            }
        }
        report.schema_version = latest;

        if let Some((username, password)) = admin {
            let principal = Principal::new(username, password, PrincipalRole::Admin, epoch_secs());
            let created = self
                .store
                .create_principal_if_absent(&principal)
                .await
                .map_err(InitError::from_store)?;
            if created {
                info!(%username, "admin principal created");
            } else {
                debug!(%username, "admin principal already present");
            }
            report.admin_created = created;
            record.admin_created = true;
        }

        if report.changed() || !report.already_initialized {
            record.schema_version = latest;
            record.schema_migrated = true;
            record.completed_at = Some(epoch_secs());
            self.store
                .put_init_record(&record)
                .await
                .map_err(InitError::from_store)?;
        }

        Ok(report)
    }
}
