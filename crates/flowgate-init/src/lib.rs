//! flowgate-init — the one-shot bootstrap initializer.
//!
//! Brings a reachable store up to the latest schema and provisions the
//! admin principal. Every step is idempotent, so the initializer can run on
//! every deployment: a store that is already initialized is left untouched.

pub mod error;
pub mod initializer;

pub use error::{InitError, InitResult};
pub use initializer::{InitReport, Initializer};
