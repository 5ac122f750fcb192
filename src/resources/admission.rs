use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::sampler::{DiskSample, MemorySample, ResourceSampler};
use crate::config::{AdmissionConfig, SandboxConfig};
use crate::error::Result;

/// Source of the number of jobs currently in flight.
pub trait RunningJobs: Send + Sync {
    fn running_count(&self) -> usize;
}

/// Decides whether the worker may start one more job.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    async fn can_admit_new_job(&self) -> bool;
}

/// Outcome of one admission check, carrying the measured value on denial.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdmissionDecision {
    Admit,
    TooManyJobs { running: usize, max: usize },
    CpuBusy { usage: f64 },
    /// `projected` includes the memory budget of the next job
    MemoryLow { usage: f64, projected: f64 },
    DiskFull { usage: f64 },
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admit)
    }
}

/// Full set of measurements together with the decision they lead to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    pub cpu_usage: f64,
    pub memory: MemorySample,
    pub disk: DiskSample,
    pub decision: AdmissionDecision,
}

/// Admission control based on running jobs and local CPU, memory and disk usage.
///
/// Checks short-circuit from the cheapest to the most expensive. The CPU
/// check sleeps for the sample interval, so one call is never instantaneous.
pub struct ResourceAdmissionController {
    jobs: Arc<dyn RunningJobs>,
    sampler: Arc<dyn ResourceSampler>,
    thresholds: AdmissionConfig,
    jobs_directory: PathBuf,
    job_memory_bytes: u64,
}

impl ResourceAdmissionController {
    pub fn new(
        jobs: Arc<dyn RunningJobs>,
        sampler: Arc<dyn ResourceSampler>,
        thresholds: AdmissionConfig,
        sandbox: &SandboxConfig,
    ) -> Self {
        Self {
            jobs,
            sampler,
            thresholds,
            jobs_directory: sandbox.jobs_directory.clone(),
            job_memory_bytes: sandbox.memory_limit_bytes(),
        }
    }

    pub async fn check(&self) -> Result<AdmissionDecision> {
        if let Some(denied) = self.job_limit() {
            return Ok(denied);
        }

        let cpu = self.sample_cpu_usage().await?;
        if let Some(denied) = self.cpu_limit(cpu) {
            return Ok(denied);
        }

        let memory = self.sampler.sample_memory().await?;
        if let Some(denied) = self.memory_limit(&memory) {
            return Ok(denied);
        }

        let disk = self.sampler.sample_disk(&self.jobs_directory).await?;
        Ok(self.disk_limit(&disk).unwrap_or(AdmissionDecision::Admit))
    }

    /// Samples every resource once and decides from those same measurements.
    pub async fn snapshot(&self) -> Result<ResourceSnapshot> {
        let cpu_usage = self.sample_cpu_usage().await?;
        let memory = self.sampler.sample_memory().await?;
        let disk = self.sampler.sample_disk(&self.jobs_directory).await?;

        let decision = self
            .job_limit()
            .or_else(|| self.cpu_limit(cpu_usage))
            .or_else(|| self.memory_limit(&memory))
            .or_else(|| self.disk_limit(&disk))
            .unwrap_or(AdmissionDecision::Admit);

        Ok(ResourceSnapshot {
            cpu_usage,
            memory,
            disk,
            decision,
        })
    }

    async fn sample_cpu_usage(&self) -> Result<f64> {
        let first = self.sampler.sample_cpu().await?;
        tokio::time::sleep(self.thresholds.cpu_sample_interval).await;
        let second = self.sampler.sample_cpu().await?;
        second.usage_since(&first)
    }

    fn job_limit(&self) -> Option<AdmissionDecision> {
        let running = self.jobs.running_count();
        let max = self.thresholds.max_running_jobs;
        (running > max).then_some(AdmissionDecision::TooManyJobs { running, max })
    }

    fn cpu_limit(&self, usage: f64) -> Option<AdmissionDecision> {
        (usage > self.thresholds.max_cpu_usage).then_some(AdmissionDecision::CpuBusy { usage })
    }

    fn memory_limit(&self, memory: &MemorySample) -> Option<AdmissionDecision> {
        let usage = memory.usage_fraction();
        let projected = usage + self.job_memory_bytes as f64 / memory.total_bytes as f64;
        (projected > self.thresholds.max_memory_usage)
            .then_some(AdmissionDecision::MemoryLow { usage, projected })
    }

    fn disk_limit(&self, disk: &DiskSample) -> Option<AdmissionDecision> {
        let usage = disk.usage_fraction();
        (usage > self.thresholds.max_disk_usage).then_some(AdmissionDecision::DiskFull { usage })
    }
}

#[async_trait]
impl AdmissionGate for ResourceAdmissionController {
    async fn can_admit_new_job(&self) -> bool {
        match self.check().await {
            Ok(AdmissionDecision::Admit) => true,
            Ok(AdmissionDecision::TooManyJobs { running, max }) => {
                tracing::info!(running, max, "Too many running jobs, cannot run new job");
                false
            }
            Ok(AdmissionDecision::CpuBusy { usage }) => {
                tracing::warn!(cpu_usage = usage, "CPU usage too high, cannot run new job");
                false
            }
            Ok(AdmissionDecision::MemoryLow { usage, projected }) => {
                tracing::warn!(
                    memory_usage = usage,
                    projected_usage = projected,
                    "Memory usage too high, cannot run new job"
                );
                false
            }
            Ok(AdmissionDecision::DiskFull { usage }) => {
                tracing::warn!(
                    disk_usage = usage,
                    path = %self.jobs_directory.display(),
                    "Disk usage too high, cannot run new job"
                );
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot read resource usage, not admitting new job");
                false
            }
        }
    }
}
