//! # PGMQ-backed message bus (spec.md §4.4)
//!
//! Wraps the `pgmq` crate directly, exposing a send/receive/ack/nack/
//! extend-visibility shape, trimmed to this crate's scope (no LISTEN/NOTIFY
//! push path — spec.md §4.4 only requires polling-based lease consumption
//! with renewal; PGMQ's LISTEN/NOTIFY is not guaranteed delivery and would
//! still need fallback polling alongside it).

use std::time::Duration;

use async_trait::async_trait;
use pgmq::{Message, PGMQueueExt};
use serde_json::Value;
use sqlx::PgPool;

use crate::error::BusError;
use crate::traits::{Delivery, MessageBus, ReceiptHandle};

#[derive(Clone)]
pub struct PgmqBus {
    queue: PGMQueueExt<Value>,
}

impl std::fmt::Debug for PgmqBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgmqBus").finish_non_exhaustive()
    }
}

impl PgmqBus {
    pub async fn connect(database_url: &str) -> Result<Self, BusError> {
        let queue = PGMQueueExt::new(database_url.to_string(), 5)
            .await
            .map_err(|e| BusError::QueueCreation {
                queue: "<connect>".to_string(),
                detail: e.to_string(),
            })?;
        Ok(Self { queue })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            queue: PGMQueueExt::new_with_pool(pool),
        }
    }
}

fn to_receipt(queue_name: &str, msg_id: i64) -> ReceiptHandle {
    ReceiptHandle {
        queue_name: queue_name.to_string(),
        msg_id,
    }
}

fn from_pgmq_message(queue_name: &str, msg: Message<Value>) -> Delivery {
    Delivery {
        payload: msg.message,
        receipt: to_receipt(queue_name, msg.msg_id),
        receive_count: msg.read_ct.max(0) as u32,
    }
}

#[async_trait]
impl MessageBus for PgmqBus {
    async fn ensure_queue(&self, queue_name: &str) -> Result<(), BusError> {
        self.queue
            .create(queue_name)
            .await
            .map_err(|e| BusError::QueueCreation {
                queue: queue_name.to_string(),
                detail: e.to_string(),
            })
    }

    async fn send(&self, queue_name: &str, payload: &Value) -> Result<(), BusError> {
        self.queue
            .send(queue_name, payload)
            .await
            .map(|_msg_id| ())
            .map_err(|e| BusError::Send {
                queue: queue_name.to_string(),
                detail: e.to_string(),
            })
    }

    async fn receive(
        &self,
        queue_name: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery>, BusError> {
        let vt = visibility_timeout.as_secs() as i32;
        let messages = self
            .queue
            .read_batch(queue_name, Some(vt), max_messages as i32)
            .await
            .map_err(|e| BusError::Receive {
                queue: queue_name.to_string(),
                detail: e.to_string(),
            })?;

        Ok(messages
            .into_iter()
            .flatten()
            .map(|msg| from_pgmq_message(queue_name, msg))
            .collect())
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> Result<(), BusError> {
        self.queue
            .archive(&receipt.queue_name, receipt.msg_id)
            .await
            .map(|_| ())
            .map_err(|e| BusError::Ack {
                queue: receipt.queue_name.clone(),
                msg_id: receipt.msg_id,
                detail: e.to_string(),
            })
    }

    async fn nack(&self, receipt: &ReceiptHandle, requeue: bool) -> Result<(), BusError> {
        if requeue {
            self.queue
                .set_vt(&receipt.queue_name, receipt.msg_id, 0)
                .await
                .map(|_| ())
                .map_err(|e| BusError::Nack {
                    queue: receipt.queue_name.clone(),
                    msg_id: receipt.msg_id,
                    detail: e.to_string(),
                })
        } else {
            self.queue
                .delete(&receipt.queue_name, receipt.msg_id)
                .await
                .map(|_| ())
                .map_err(|e| BusError::Nack {
                    queue: receipt.queue_name.clone(),
                    msg_id: receipt.msg_id,
                    detail: e.to_string(),
                })
        }
    }

    async fn extend_visibility(
        &self,
        receipt: &ReceiptHandle,
        extension: Duration,
    ) -> Result<(), BusError> {
        let vt = extension.as_secs() as i32;
        self.queue
            .set_vt(&receipt.queue_name, receipt.msg_id, vt)
            .await
            .map(|_| ())
            .map_err(|e| BusError::ExtendVisibility {
                queue: receipt.queue_name.clone(),
                msg_id: receipt.msg_id,
                detail: e.to_string(),
            })
    }
}
