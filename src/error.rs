use thiserror::Error;
use uuid::Uuid;

use crate::broker::BrokerError;
use crate::runtime::ContainerError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Job {id} is in an invalid state: {reason}")]
    InvalidJobState { id: Uuid, reason: String },

    #[error("Cannot run job {0} with empty script")]
    EmptyScript(Uuid),

    #[error("Script of job {id} is not valid base64: {source}")]
    InvalidScript {
        id: Uuid,
        #[source]
        source: base64::DecodeError,
    },

    #[error("Resource data unavailable: {0}")]
    ResourceData(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    pub fn invalid_state(id: Uuid, reason: impl Into<String>) -> Self {
        WorkerError::InvalidJobState {
            id,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
