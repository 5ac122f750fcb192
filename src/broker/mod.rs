//! Message broker consumption.
//!
//! Every message announces one job: its key and value both carry the job id
//! as a 16-byte GUID in the control plane's byte order. Offsets are committed
//! manually, only after the worker has finished processing a message.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use memory::InMemoryBroker;

#[cfg(feature = "kafka")]
pub use kafka::KafkaJobConsumer;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Consume cancelled")]
    Cancelled,

    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// A pulled message that has not been committed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub job_id: Uuid,
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait JobConsumer: Send + Sync {
    fn subscribe(&self) -> Result<(), BrokerError>;

    /// Blocks until the next message arrives or `cancel` fires.
    async fn consume(&self, cancel: &CancellationToken) -> Result<ConsumedMessage, BrokerError>;

    async fn commit(&self, message: &ConsumedMessage) -> Result<(), BrokerError>;

    /// Leaves the consumer group. Idempotent.
    fn close(&self);
}

/// Encodes a job id the way the control plane publishes it.
pub fn encode_job_id(id: Uuid) -> [u8; 16] {
    id.to_bytes_le()
}

fn decode_guid(bytes: &[u8], part: &str) -> Result<Uuid, BrokerError> {
    Uuid::from_slice_le(bytes).map_err(|e| {
        BrokerError::InvalidMessage(format!("{part} is not a 16-byte GUID: {e}"))
    })
}

/// Validates a raw message and returns the job id it carries.
pub fn decode_job_message(key: Option<&[u8]>, value: Option<&[u8]>) -> Result<Uuid, BrokerError> {
    let key = match key {
        Some(key) if !key.is_empty() => decode_guid(key, "key")?,
        _ => return Err(BrokerError::InvalidMessage("key is missing".to_string())),
    };
    if key.is_nil() {
        return Err(BrokerError::InvalidMessage("key is empty".to_string()));
    }

    let value = match value {
        Some(value) if !value.is_empty() => decode_guid(value, "value")?,
        _ => {
            return Err(BrokerError::InvalidMessage(format!(
                "value of message '{key}' is missing"
            )))
        }
    };

    if key != value {
        return Err(BrokerError::InvalidMessage(format!(
            "inconsistent message: key '{key}' is not equal to value '{value}'"
        )));
    }

    Ok(key)
}
