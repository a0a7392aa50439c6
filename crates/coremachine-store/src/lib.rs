//! # coremachine-store
//!
//! The relational state store (spec.md §4.3, §6): job/stage/task
//! persistence behind the [`StateStore`] trait, a Postgres-backed
//! implementation, and an in-memory test double with identical semantics.

pub mod in_memory;
pub mod postgres;
pub mod traits;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use traits::{CompletionOutcome, StateStore};
