//! Job store: the cross-restart source of truth for job status.
//!
//! The store enforces the status transitions New → Running → terminal;
//! workers only observe and request transitions.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::job::{JobDefinition, JobStatus};

pub use memory::{InMemoryJobStore, StoredJob};
pub use postgres::PostgresJobStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Job {0} has already been added")]
    AlreadyExists(Uuid),

    /// The job already reached a terminal status. Expected when two runs race.
    #[error("Job {0} is already finished")]
    AlreadyFinished(Uuid),

    #[error("Status {0} is not a terminal status")]
    InvalidStatus(JobStatus),

    #[error("Results of job {id} are {size} bytes, above the {limit} byte ceiling")]
    ResultsTooLarge { id: Uuid, size: usize, limit: usize },

    #[error("Invalid data for job {id}: {reason}")]
    InvalidData { id: Uuid, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Returns the job only while its status is New.
    async fn fetch_new_job(&self, id: Uuid) -> Result<Option<JobDefinition>, StoreError>;

    /// Moves the job to Running. Fails with `AlreadyFinished` once terminal.
    async fn mark_running(&self, id: Uuid) -> Result<(), StoreError>;

    /// Records a terminal status with its results.
    async fn set_results(
        &self,
        id: Uuid,
        status: JobStatus,
        results: &[u8],
    ) -> Result<(), StoreError>;
}
