//! # In-memory message bus test double (spec.md §7 test tooling)
//!
//! Reproduces PGMQ's visibility-timeout semantics (a received message is
//! invisible to other consumers until acked, nacked, or its lease expires)
//! with a `std::sync::Mutex<HashMap<...>>` instead of Postgres rows.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BusError;
use crate::traits::{Delivery, MessageBus, ReceiptHandle};

struct StoredMessage {
    msg_id: i64,
    payload: Value,
    receive_count: u32,
    /// `None` means immediately visible; `Some(deadline)` means invisible
    /// until that instant.
    visible_after: Option<Instant>,
}

#[derive(Default)]
struct Queue {
    messages: Vec<StoredMessage>,
}

#[derive(Default)]
pub struct InMemoryBus {
    queues: Mutex<HashMap<String, Queue>>,
    next_id: AtomicI64,
}

impl std::fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queues = self.queues.lock().unwrap();
        f.debug_struct("InMemoryBus")
            .field("queue_count", &queues.len())
            .finish()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total undelivered-or-redeliverable message count across a queue —
    /// used by tests asserting "only one `JobMessage` was published".
    pub fn queue_depth(&self, queue_name: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(queue_name)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn ensure_queue(&self, queue_name: &str) -> Result<(), BusError> {
        self.queues
            .lock()
            .unwrap()
            .entry(queue_name.to_string())
            .or_default();
        Ok(())
    }

    async fn send(&self, queue_name: &str, payload: &Value) -> Result<(), BusError> {
        let msg_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(queue_name.to_string())
            .or_default()
            .messages
            .push(StoredMessage {
                msg_id,
                payload: payload.clone(),
                receive_count: 0,
                visible_after: None,
            });
        Ok(())
    }

    async fn receive(
        &self,
        queue_name: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery>, BusError> {
        let now = Instant::now();
        let mut queues = self.queues.lock().unwrap();
        let Some(queue) = queues.get_mut(queue_name) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for msg in queue.messages.iter_mut() {
            if out.len() >= max_messages {
                break;
            }
            let is_visible = msg.visible_after.map_or(true, |deadline| now >= deadline);
            if !is_visible {
                continue;
            }
            msg.receive_count += 1;
            msg.visible_after = Some(now + visibility_timeout);
            out.push(Delivery {
                payload: msg.payload.clone(),
                receipt: ReceiptHandle {
                    queue_name: queue_name.to_string(),
                    msg_id: msg.msg_id,
                },
                receive_count: msg.receive_count,
            });
        }
        Ok(out)
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> Result<(), BusError> {
        let mut queues = self.queues.lock().unwrap();
        if let Some(queue) = queues.get_mut(&receipt.queue_name) {
            queue.messages.retain(|m| m.msg_id != receipt.msg_id);
        }
        Ok(())
    }

    async fn nack(&self, receipt: &ReceiptHandle, requeue: bool) -> Result<(), BusError> {
        let mut queues = self.queues.lock().unwrap();
        let Some(queue) = queues.get_mut(&receipt.queue_name) else {
            return Ok(());
        };
        if requeue {
            if let Some(msg) = queue.messages.iter_mut().find(|m| m.msg_id == receipt.msg_id) {
                msg.visible_after = None;
            }
        } else {
            queue.messages.retain(|m| m.msg_id != receipt.msg_id);
        }
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt: &ReceiptHandle,
        extension: Duration,
    ) -> Result<(), BusError> {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues
            .get_mut(&receipt.queue_name)
            .ok_or_else(|| BusError::NotFound(receipt.clone()))?;
        let msg = queue
            .messages
            .iter_mut()
            .find(|m| m.msg_id == receipt.msg_id)
            .ok_or_else(|| BusError::NotFound(receipt.clone()))?;
        msg.visible_after = Some(Instant::now() + extension);
        Ok(())
    }
}
