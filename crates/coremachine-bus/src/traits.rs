//! # Message bus contract (spec.md §4.4)

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::error::BusError;

/// Opaque handle identifying a delivered message to its origin queue, so
/// callers can ack/nack/extend without re-threading the queue name through
/// every call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptHandle {
    pub queue_name: String,
    pub msg_id: i64,
}

/// A message delivered off a queue, paired with its receipt handle and
/// delivery count (spec.md §6 "attempts").
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Value,
    pub receipt: ReceiptHandle,
    pub receive_count: u32,
}

/// Two logical queues (job queue, task queue), each carrying at-least-once,
/// lease-based messages (spec.md §4.4). Payloads travel as JSON `Value` —
/// `JobMessage`/`TaskMessage` are serialized/deserialized at the
/// orchestration layer, keeping this trait object-safe (`Arc<dyn
/// MessageBus>` is shared across every consumer task). Implemented by
/// [`crate::pgmq::PgmqBus`] and [`crate::in_memory::InMemoryBus`].
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn ensure_queue(&self, queue_name: &str) -> Result<(), BusError>;

    async fn send(&self, queue_name: &str, payload: &Value) -> Result<(), BusError>;

    /// Receives up to `max_messages`, each invisible to other consumers for
    /// `visibility_timeout` until acked, nacked, or the lease expires.
    async fn receive(
        &self,
        queue_name: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery>, BusError>;

    /// Acknowledges successful processing; the message is permanently removed.
    async fn ack(&self, receipt: &ReceiptHandle) -> Result<(), BusError>;

    /// Negative-acknowledges. `requeue = true` makes the message immediately
    /// visible again (bus-level retry is disabled per spec.md §4.4, so this
    /// is used only for the reconciler and explicit operator intervention,
    /// never as automatic handler retry); `requeue = false` deletes it
    /// (dead-letter-equivalent for a queue with no native DLQ).
    async fn nack(&self, receipt: &ReceiptHandle, requeue: bool) -> Result<(), BusError>;

    /// Extends the lease on an in-flight message (spec.md §4.4 "lease renewal").
    async fn extend_visibility(
        &self,
        receipt: &ReceiptHandle,
        extension: Duration,
    ) -> Result<(), BusError>;
}
