use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use super::sandbox::{SCRIPT_FILE_NAME, STDERR_FILE_NAME, STDOUT_FILE_NAME};
use crate::config::{DockerConfig, SandboxConfig};
use crate::error::{Result, WorkerError};
use crate::job::{JobStatus, RunningJob};
use crate::runtime::{ContainerError, ContainerRuntime, ContainerSpec};

/// Directory the sandbox files are mounted under inside the container.
const CONTAINER_JOB_DIR: &str = "/job";

pub fn container_name(id: Uuid) -> String {
    format!("job_{id}")
}

/// Runs a prepared job script inside a resource-limited container.
///
/// Create, start and wait are bounded by the job timeout. The container is
/// stopped and removed on every exit path.
#[derive(Clone)]
pub struct ContainerProcessRunner {
    runtime: Arc<dyn ContainerRuntime>,
    docker: DockerConfig,
    nano_cpus: i64,
    memory_bytes: i64,
}

impl ContainerProcessRunner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        docker: DockerConfig,
        sandbox: &SandboxConfig,
    ) -> Self {
        Self {
            runtime,
            docker,
            nano_cpus: sandbox.nano_cpus(),
            memory_bytes: sandbox.memory_limit_bytes() as i64,
        }
    }

    pub fn container_spec(&self, id: Uuid, directory: &Path) -> ContainerSpec {
        let mount = |file: &str, mode: &str| {
            format!(
                "{}:{CONTAINER_JOB_DIR}/{file}{mode}",
                directory.join(file).display()
            )
        };

        ContainerSpec {
            name: container_name(id),
            image: self.docker.image.clone(),
            user: self.docker.user.clone(),
            entrypoint: vec!["/bin/sh".to_string()],
            cmd: vec![
                "-c".to_string(),
                format!(
                    "/bin/sh {CONTAINER_JOB_DIR}/{SCRIPT_FILE_NAME} \
                     1>>{CONTAINER_JOB_DIR}/{STDOUT_FILE_NAME} \
                     2>>{CONTAINER_JOB_DIR}/{STDERR_FILE_NAME}"
                ),
            ],
            nano_cpus: self.nano_cpus,
            memory_bytes: self.memory_bytes,
            binds: vec![
                mount(SCRIPT_FILE_NAME, ":ro"),
                mount(STDOUT_FILE_NAME, ""),
                mount(STDERR_FILE_NAME, ""),
            ],
            network_disabled: self.docker.network_disabled,
            read_only_rootfs: true,
            cap_drop: vec!["ALL".to_string()],
            security_opt: vec!["no-new-privileges".to_string()],
        }
    }

    /// Runs the job to a terminal status: Finished, Timeout or Fault.
    pub async fn run(&self, job: &mut RunningJob) -> Result<()> {
        let Some(directory) = job.sandbox_dir() else {
            return Err(WorkerError::invalid_state(
                job.id,
                "cannot run a job without an environment",
            ));
        };
        if job.status.is_terminal() {
            return Err(WorkerError::invalid_state(
                job.id,
                format!("job has already completed with status {}", job.status),
            ));
        }

        let spec = self.container_spec(job.id, directory);
        let mut container_id = None;

        let outcome =
            tokio::time::timeout(job.timeout, self.execute(job.id, &spec, &mut container_id)).await;

        job.status = match outcome {
            Ok(Ok(exit_code)) => {
                tracing::info!(job_id = %job.id, exit_code, "Container exited");
                JobStatus::Finished
            }
            Ok(Err(e)) => {
                tracing::error!(job_id = %job.id, error = %e, "Container run failed");
                JobStatus::Fault
            }
            Err(_) => {
                tracing::warn!(
                    job_id = %job.id,
                    timeout_secs = job.timeout.as_secs_f64(),
                    "Job timed out"
                );
                JobStatus::Timeout
            }
        };

        let target = container_id.as_deref().unwrap_or(&spec.name);
        self.cleanup(job.id, target).await;
        Ok(())
    }

    async fn execute(
        &self,
        job_id: Uuid,
        spec: &ContainerSpec,
        container_id: &mut Option<String>,
    ) -> std::result::Result<i64, ContainerError> {
        let created = self.runtime.create(spec).await?;
        for warning in &created.warnings {
            tracing::warn!(
                job_id = %job_id,
                container_id = %created.id,
                warning = %warning,
                "Container created with warning"
            );
        }
        tracing::info!(job_id = %job_id, container_id = %created.id, "Container created");
        let id = container_id.insert(created.id);

        if !self.runtime.start(id).await? {
            return Err(ContainerError::NotStarted(id.clone()));
        }
        tracing::info!(job_id = %job_id, container_id = %id, "Container started");

        self.runtime.wait(id).await
    }

    async fn cleanup(&self, job_id: Uuid, container: &str) {
        if let Err(e) = self.runtime.stop(container, self.docker.stop_grace).await {
            tracing::error!(
                job_id = %job_id,
                container = %container,
                error = %e,
                "Failed to stop container"
            );
        }
        if let Err(e) = self.runtime.remove(container).await {
            tracing::error!(
                job_id = %job_id,
                container = %container,
                error = %e,
                "Failed to remove container"
            );
        }
        tracing::debug!(job_id = %job_id, container = %container, "Container cleaned up");
    }
}
