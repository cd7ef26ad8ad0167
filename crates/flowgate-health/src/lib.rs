//! flowgate-health — readiness and liveness checking for flowgate.
//!
//! Two kinds of checks live here:
//!
//! ```text
//! ReadinessProber (gates dependents)
//!   ├── ReadinessTarget: MetaStore (connect + trivial query), TcpTarget
//!   └── Unknown → Probing → Ready | Unreachable  (bounded attempts)
//!
//! HealthTracker (keeps services alive)
//!   ├── http_probe() → ProbeResult
//!   └── consecutive failures ≥ threshold → Unhealthy
//! ```
//!
//! The prober never retries past its bound: a store that stays down makes
//! the prober report `Unreachable` so the caller can fail the deployment
//! instead of blocking forever. The tracker has no bound; the supervisor
//! restarts whatever it marks unhealthy.

pub mod checker;
pub mod readiness;

pub use checker::{HealthTracker, ProbeResult, http_probe};
pub use readiness::{ReadinessProber, ReadinessTarget, TcpTarget};
