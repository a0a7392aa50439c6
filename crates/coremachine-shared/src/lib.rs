//! # coremachine-shared
//!
//! Data model, deterministic identity, registries, the workflow contract,
//! state-machine transition rules, configuration, and the error taxonomy
//! shared by every other `coremachine-*` crate. No I/O lives here; the
//! store and bus adapters own that.

pub mod config;
pub mod errors;
pub mod identity;
pub mod model;
pub mod registry;
pub mod resilience;
pub mod state_machine;
pub mod workflow;

pub use errors::{CoreError, CoreResult};
pub use identity::Digest256;
