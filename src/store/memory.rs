use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{JobStore, StoreError};
use crate::config::DEFAULT_RESULTS_SIZE_LIMIT;
use crate::job::{JobDefinition, JobStatus};

/// A job row.
#[derive(Debug, Clone)]
pub struct StoredJob {
    pub definition: JobDefinition,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Option<Vec<u8>>,
}

/// In-process job table implementing the store's status state machine.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, StoredJob>>,
    results_size_limit: usize,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_results_limit(DEFAULT_RESULTS_SIZE_LIMIT)
    }

    pub fn with_results_limit(results_size_limit: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            results_size_limit,
        }
    }

    /// Adds a job in status New, as the control plane does on submission.
    pub async fn add_new(&self, definition: JobDefinition) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&definition.id) {
            return Err(StoreError::AlreadyExists(definition.id));
        }
        jobs.insert(
            definition.id,
            StoredJob {
                definition,
                status: JobStatus::New,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                results: None,
            },
        );
        Ok(())
    }

    pub async fn get(&self, id: &Uuid) -> Option<StoredJob> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn status(&self, id: &Uuid) -> Option<JobStatus> {
        self.jobs.read().await.get(id).map(|job| job.status)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn fetch_new_job(&self, id: Uuid) -> Result<Option<JobDefinition>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .get(&id)
            .filter(|job| job.status == JobStatus::New)
            .map(|job| job.definition.clone()))
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            tracing::warn!(job_id = %id, "Cannot mark unknown job as running");
            return Ok(());
        };

        match job.status {
            JobStatus::Running => {
                tracing::warn!(job_id = %id, "Job is already running");
                Ok(())
            }
            status if status.is_terminal() => Err(StoreError::AlreadyFinished(id)),
            _ => {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
                Ok(())
            }
        }
    }

    async fn set_results(
        &self,
        id: Uuid,
        status: JobStatus,
        results: &[u8],
    ) -> Result<(), StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidStatus(status));
        }
        if results.len() > self.results_size_limit {
            return Err(StoreError::ResultsTooLarge {
                id,
                size: results.len(),
                limit: self.results_size_limit,
            });
        }

        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if job.status.is_terminal() {
            return Err(StoreError::AlreadyFinished(id));
        }
        if job.status == JobStatus::New {
            tracing::warn!(job_id = %id, "Job is not running, but results are provided");
        }

        job.status = status;
        job.results = Some(results.to_vec());
        job.finished_at = Some(Utc::now());
        Ok(())
    }
}
