//! flowgate-core — shared vocabulary for the flowgate bootstrap controller.
//!
//! Every role of a deployment (store, initializer, API server, scheduler
//! loop) links this crate to agree on role names, lifecycle states, and the
//! configuration surface.

pub mod config;
pub mod duration;
pub mod types;

pub use config::{ConfigError, ConfigResult, Settings};
pub use duration::{format_duration, parse_duration};
pub use types::*;
