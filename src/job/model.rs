use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, WorkerError};

/// Job status as recorded by the store.
///
/// The numeric values are part of the store contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum JobStatus {
    New = 0,
    Running = 1,
    Finished = 2,
    Timeout = 3,
    Fault = 4,
    /// Assigned only by the lost-job sweeper, never by a worker.
    Lost = 5,
}

impl JobStatus {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Finished, Timeout, Fault and Lost are terminal: no transition leaves them.
    pub fn is_terminal(self) -> bool {
        self > JobStatus::Running
    }
}

impl TryFrom<i32> for JobStatus {
    type Error = i32;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(JobStatus::New),
            1 => Ok(JobStatus::Running),
            2 => Ok(JobStatus::Finished),
            3 => Ok(JobStatus::Timeout),
            4 => Ok(JobStatus::Fault),
            5 => Ok(JobStatus::Lost),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::New => write!(f, "new"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Timeout => write!(f, "timeout"),
            JobStatus::Fault => write!(f, "fault"),
            JobStatus::Lost => write!(f, "lost"),
        }
    }
}

/// A job as fetched from the store. Read-only for the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub id: Uuid,
    pub timeout: Duration,
    /// Base64-encoded shell script.
    pub script: String,
}

impl JobDefinition {
    pub fn new(id: Uuid, timeout: Duration, script: impl Into<String>) -> Self {
        Self {
            id,
            timeout,
            script: script.into(),
        }
    }
}

/// Worker-owned state of one pipeline run.
///
/// Owned exclusively by the pipeline task executing it.
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub id: Uuid,
    pub timeout: Duration,
    pub script: String,
    pub status: JobStatus,
    directory: Option<PathBuf>,
    results: Option<Vec<u8>>,
}

impl From<JobDefinition> for RunningJob {
    fn from(definition: JobDefinition) -> Self {
        Self {
            id: definition.id,
            timeout: definition.timeout,
            script: definition.script,
            status: JobStatus::Running,
            directory: None,
            results: None,
        }
    }
}

impl RunningJob {
    /// Sandbox directory, if the environment has been prepared.
    pub fn sandbox_dir(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Assigns the sandbox directory. Can only happen once per run.
    pub fn assign_directory(&mut self, directory: PathBuf) -> Result<()> {
        if let Some(existing) = &self.directory {
            return Err(WorkerError::invalid_state(
                self.id,
                format!("environment already initialized at '{}'", existing.display()),
            ));
        }
        self.directory = Some(directory);
        Ok(())
    }

    pub fn results(&self) -> Option<&[u8]> {
        self.results.as_deref()
    }

    /// Stores the collected results. Can only happen once per run.
    pub fn store_results(&mut self, results: Vec<u8>) -> Result<()> {
        if self.results.is_some() {
            return Err(WorkerError::invalid_state(
                self.id,
                "results have already been collected",
            ));
        }
        self.results = Some(results);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_job() -> RunningJob {
        JobDefinition::new(Uuid::new_v4(), Duration::from_secs(5), "ZWNobyBvaw==").into()
    }

    #[test]
    fn status_numeric_values_match_store() {
        assert_eq!(JobStatus::New.as_i32(), 0);
        assert_eq!(JobStatus::Running.as_i32(), 1);
        assert_eq!(JobStatus::Finished.as_i32(), 2);
        assert_eq!(JobStatus::Timeout.as_i32(), 3);
        assert_eq!(JobStatus::Fault.as_i32(), 4);
        assert_eq!(JobStatus::Lost.as_i32(), 5);
        assert_eq!(JobStatus::try_from(3), Ok(JobStatus::Timeout));
        assert_eq!(JobStatus::try_from(9), Err(9));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::New.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Timeout.is_terminal());
        assert!(JobStatus::Fault.is_terminal());
        assert!(JobStatus::Lost.is_terminal());
    }

    #[test]
    fn new_running_job_starts_without_sandbox() {
        let job = running_job();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.sandbox_dir().is_none());
        assert!(job.results().is_none());
    }

    #[test]
    fn directory_is_assigned_once() {
        let mut job = running_job();
        job.assign_directory(PathBuf::from("/tmp/jobs/a")).unwrap();
        let err = job
            .assign_directory(PathBuf::from("/tmp/jobs/b"))
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidJobState { .. }));
        assert_eq!(job.sandbox_dir(), Some(Path::new("/tmp/jobs/a")));
    }

    #[test]
    fn results_are_stored_once() {
        let mut job = running_job();
        job.store_results(vec![1, 2, 3]).unwrap();
        assert!(job.store_results(vec![4]).is_err());
        assert_eq!(job.results(), Some(&[1u8, 2, 3][..]));
    }
}
