//! flowgate-scheduler — the Scheduler Loop role.
//!
//! Every tick the loop:
//!
//! ```text
//! heartbeat ─► sync definitions ─► emit due runs
//!                │                    └── one queued run per due, unpaused workflow
//!                ├── *.toml in the workflows folder
//!                └── built-in examples (removed when disabled)
//! ```
//!
//! Runs are only queued here; executing them is left to the executor.

pub mod definitions;
pub mod error;
pub mod schedule;
pub mod scheduler;

pub use definitions::{SyncReport, example_definitions, load_folder};
pub use error::{SchedulerError, SchedulerResult};
pub use schedule::Schedule;
pub use scheduler::{SchedulerLoop, TickReport};
