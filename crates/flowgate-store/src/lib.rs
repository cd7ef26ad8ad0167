//! flowgate-store — the durable metadata store shared by every role.
//!
//! [`MetaStore`] is a cheaply clonable handle passed explicitly to the
//! initializer, the API server, and the scheduler loop. Two backends sit
//! behind it:
//!
//! - **PostgreSQL** (`postgres://…`) via sqlx, for real deployments where
//!   every role runs in its own process.
//! - **Embedded** (`redb://<path>`, `memory://`) via redb, for standalone
//!   mode and tests. A redb file admits a single process at a time.
//!
//! # Schema
//!
//! Nothing but the initializer creates tables. Each backend keeps a
//! migration ledger inside the store itself, so "already initialized" is a
//! property of the data volume, not of the controller. Reads and writes
//! against tables that don't exist yet fail with
//! [`StoreError::SchemaNotMigrated`].

pub mod embedded;
pub mod error;
pub mod migrations;
pub mod postgres;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use migrations::{MIGRATIONS, Migration, latest_version};
pub use store::{InitLock, MetaStore, redact_url};
pub use types::*;
