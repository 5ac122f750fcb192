use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::archive::ResultsArchiver;
use super::container::ContainerProcessRunner;
use super::sandbox::SandboxEnvironment;
use crate::error::{Result, WorkerError};
use crate::job::{JobDefinition, JobStatus, RunningJob};
use crate::resources::RunningJobs;
use crate::store::JobStore;

/// In-flight job as seen from outside its pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedJob {
    pub id: Uuid,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub started_at: DateTime<Utc>,
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}

struct EngineInner {
    jobs: DashMap<Uuid, TrackedJob>,
    tasks: TaskTracker,
    sandbox: SandboxEnvironment,
    runner: ContainerProcessRunner,
    archiver: ResultsArchiver,
    store: Arc<dyn JobStore>,
}

/// Runs admitted jobs as independent tasks and tracks which are in flight.
///
/// Each job goes through prepare → run → collect → store. Whatever happens,
/// the sandbox is cleared and the job leaves tracking when its task ends.
#[derive(Clone)]
pub struct JobExecutionEngine {
    inner: Arc<EngineInner>,
}

impl JobExecutionEngine {
    pub fn new(
        sandbox: SandboxEnvironment,
        runner: ContainerProcessRunner,
        archiver: ResultsArchiver,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                jobs: DashMap::new(),
                tasks: TaskTracker::new(),
                sandbox,
                runner,
                archiver,
                store,
            }),
        }
    }

    pub fn running_count(&self) -> usize {
        self.inner.jobs.len()
    }

    pub fn is_running(&self, id: &Uuid) -> bool {
        self.inner.jobs.contains_key(id)
    }

    /// Snapshot of the in-flight jobs, oldest first.
    pub fn running_jobs(&self) -> Vec<TrackedJob> {
        let mut jobs: Vec<TrackedJob> = self
            .inner
            .jobs
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by_key(|job| job.started_at);
        jobs
    }

    /// Starts the job pipeline in the background.
    ///
    /// The job is tracked before this returns. Returns `Ok(false)` without
    /// starting anything when a pipeline for the same id is already in flight.
    pub fn run_job(&self, definition: JobDefinition) -> Result<bool> {
        if self.inner.tasks.is_closed() {
            return Err(WorkerError::Internal(format!(
                "engine is draining, cannot start job {}",
                definition.id
            )));
        }

        let id = definition.id;
        match self.inner.jobs.entry(id) {
            Entry::Occupied(_) => {
                tracing::warn!(job_id = %id, "Job is already running, ignoring duplicate");
                return Ok(false);
            }
            Entry::Vacant(entry) => {
                entry.insert(TrackedJob {
                    id,
                    timeout: definition.timeout,
                    started_at: Utc::now(),
                });
            }
        }

        let inner = self.inner.clone();
        self.inner.tasks.spawn(async move {
            EngineInner::execute(inner, definition).await;
        });

        tracing::info!(job_id = %id, "Job started");
        Ok(true)
    }

    /// Stops accepting jobs and waits until every in-flight pipeline has ended.
    pub async fn wait_for_all_jobs(&self) {
        self.inner.tasks.close();
        let pending = self.running_count();
        if pending > 0 {
            tracing::info!(pending, "Waiting for running jobs to finish");
        }
        self.inner.tasks.wait().await;
    }
}

impl RunningJobs for JobExecutionEngine {
    fn running_count(&self) -> usize {
        JobExecutionEngine::running_count(self)
    }
}

/// Removes the job from tracking when the pipeline task ends.
struct TrackingGuard {
    inner: Arc<EngineInner>,
    id: Uuid,
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        self.inner.jobs.remove(&self.id);
    }
}

impl EngineInner {
    async fn execute(inner: Arc<EngineInner>, definition: JobDefinition) {
        let _guard = TrackingGuard {
            inner: inner.clone(),
            id: definition.id,
        };
        let mut job = RunningJob::from(definition);

        let outcome = AssertUnwindSafe(inner.process(&mut job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(WorkerError::Internal(panic_message(panic.as_ref()))));

        match outcome {
            Ok(()) => {
                tracing::info!(job_id = %job.id, status = %job.status, "Job completed");
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Job failed");
                if let Err(e) = inner.store.set_results(job.id, JobStatus::Fault, &[]).await {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to record job fault");
                }
            }
        }

        if let Err(e) = inner.sandbox.clear(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to clear environment");
        }
    }

    async fn process(&self, job: &mut RunningJob) -> Result<()> {
        self.sandbox.prepare(job).await?;
        self.runner.run(job).await?;
        self.archiver.collect(job).await?;

        let results = job
            .results()
            .ok_or_else(|| WorkerError::invalid_state(job.id, "results were not collected"))?;
        self.store.set_results(job.id, job.status, results).await?;
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic");
    format!("job pipeline panicked: {detail}")
}
