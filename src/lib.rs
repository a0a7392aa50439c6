//! # coremachine
//!
//! Workspace root. No library code of its own — this crate exists so the
//! end-to-end scenario tests under `tests/` (spec.md §8) can depend on one
//! name instead of four.

pub use coremachine_bus as bus;
pub use coremachine_orchestration as orchestration;
pub use coremachine_shared as shared;
pub use coremachine_store as store;
