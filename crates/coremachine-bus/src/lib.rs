//! # coremachine-bus
//!
//! The message bus adapter (spec.md §4.4): the [`MessageBus`] trait, a
//! PGMQ-backed implementation, an in-memory test double, and the
//! lease-renewal background task both share.

pub mod error;
pub mod in_memory;
pub mod lease;
pub mod pgmq;
pub mod traits;

pub use error::BusError;
pub use in_memory::InMemoryBus;
pub use lease::LeaseGuard;
pub use pgmq::PgmqBus;
pub use traits::{Delivery, MessageBus, ReceiptHandle};
