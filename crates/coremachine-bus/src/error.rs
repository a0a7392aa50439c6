use thiserror::Error;

/// Adapter-level error, converted into `CoreError::BusTransient` at the
/// orchestration boundary.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("queue creation failed for {queue}: {detail}")]
    QueueCreation { queue: String, detail: String },

    #[error("send failed on {queue}: {detail}")]
    Send { queue: String, detail: String },

    #[error("receive failed on {queue}: {detail}")]
    Receive { queue: String, detail: String },

    #[error("ack failed for msg_id={msg_id} on {queue}: {detail}")]
    Ack {
        queue: String,
        msg_id: i64,
        detail: String,
    },

    #[error("nack failed for msg_id={msg_id} on {queue}: {detail}")]
    Nack {
        queue: String,
        msg_id: i64,
        detail: String,
    },

    #[error("visibility extension failed for msg_id={msg_id} on {queue}: {detail}")]
    ExtendVisibility {
        queue: String,
        msg_id: i64,
        detail: String,
    },

    #[error("no such message: {0:?}")]
    NotFound(crate::traits::ReceiptHandle),
}
