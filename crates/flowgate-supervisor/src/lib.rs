//! flowgate-supervisor — starting and keeping alive the deployment's roles.
//!
//! ```text
//! StartupGraph            store ─► initializer ─► { api_server, scheduler_loop }
//!   │
//!   ├── run_once_within() initializer: fail fast, bounded, never restarted
//!   └── ControlPlaneSupervisor
//!         └── ProcessHandle (one supervision task per role)
//!               Starting → Healthy → (Unhealthy → Restarting → Starting)* → Stopped
//! ```

pub mod command;
pub mod error;
pub mod graph;
pub mod oneshot;
pub mod policy;
pub mod process;
pub mod supervisor;

pub use command::{ChildCommand, HealthProbe};
pub use error::{GraphError, GraphResult, SupervisorError, SupervisorResult};
pub use graph::{NodeOutcome, StartupGraph, StartupReport};
pub use oneshot::{run_once, run_once_within};
pub use policy::{Backoff, RestartHistory, RestartPolicy, SupervisionPolicy};
pub use process::ProcessHandle;
pub use supervisor::{ControlPlaneSupervisor, ProcessStatus};
