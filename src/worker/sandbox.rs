use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::{Result, WorkerError};
use crate::job::RunningJob;

pub const STDOUT_FILE_NAME: &str = "stdout.txt";
pub const STDERR_FILE_NAME: &str = "stderr.txt";
pub const SCRIPT_FILE_NAME: &str = "run.sh";
pub const DEFINITION_FILE_NAME: &str = "docker-compose.yml";

pub const JOB_ID_PLACEHOLDER: &str = "{{JOB_ID}}";
pub const JOB_CPU_LIMIT_PLACEHOLDER: &str = "{{JOB_CPU_LIMIT}}";
pub const JOB_MEMORY_LIMIT_PLACEHOLDER: &str = "{{JOB_MEMORY_LIMIT}}";
pub const JOB_DIRECTORY_PLACEHOLDER: &str = "{{JOB_DIRECTORY}}";

const DEFAULT_DEFINITION_TEMPLATE: &str =
    include_str!("../../assets/docker-compose.template.yml");

/// Owner read/write, others read: the container may read but not modify the script.
#[cfg(unix)]
const SCRIPT_MODE: u32 = 0o604;
/// Owner read/write, others write: the container user appends its output.
#[cfg(unix)]
const LOG_MODE: u32 = 0o602;

/// Per-job filesystem sandbox under the jobs directory.
#[derive(Debug, Clone)]
pub struct SandboxEnvironment {
    config: SandboxConfig,
    template: String,
}

impl SandboxEnvironment {
    /// Uses the embedded container definition template.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_template(config, DEFAULT_DEFINITION_TEMPLATE)
    }

    pub fn with_template(config: SandboxConfig, template: impl Into<String>) -> Self {
        Self {
            config,
            template: template.into(),
        }
    }

    /// Loads the template configured in `definition_template`, if any.
    pub async fn from_config(config: SandboxConfig) -> Result<Self> {
        match &config.definition_template {
            Some(path) => {
                let template = tokio::fs::read_to_string(path).await.map_err(|e| {
                    WorkerError::Config(format!(
                        "cannot read definition template '{}': {e}",
                        path.display()
                    ))
                })?;
                Ok(Self::with_template(config, template))
            }
            None => Ok(Self::new(config)),
        }
    }

    pub fn jobs_directory(&self) -> &Path {
        &self.config.jobs_directory
    }

    pub fn job_directory(&self, id: Uuid) -> PathBuf {
        self.config.jobs_directory.join(id.to_string())
    }

    pub fn render_definition(&self, id: Uuid, directory: &Path) -> String {
        self.template
            .replace(JOB_ID_PLACEHOLDER, &id.to_string())
            .replace(JOB_CPU_LIMIT_PLACEHOLDER, &self.config.cpu_limit.to_string())
            .replace(
                JOB_MEMORY_LIMIT_PLACEHOLDER,
                &self.config.memory_limit_mb.to_string(),
            )
            .replace(JOB_DIRECTORY_PLACEHOLDER, &directory.to_string_lossy())
    }

    /// Creates the job directory with the container definition, empty log
    /// files and the decoded script. A leftover directory from an earlier
    /// run is removed first.
    pub async fn prepare(&self, job: &mut RunningJob) -> Result<()> {
        if let Some(existing) = job.sandbox_dir() {
            return Err(WorkerError::invalid_state(
                job.id,
                format!("environment already initialized at '{}'", existing.display()),
            ));
        }
        if job.script.trim().is_empty() {
            return Err(WorkerError::EmptyScript(job.id));
        }

        let script = STANDARD
            .decode(job.script.trim())
            .map_err(|source| WorkerError::InvalidScript { id: job.id, source })?;

        let directory = self.job_directory(job.id);
        job.assign_directory(directory.clone())?;

        if tokio::fs::try_exists(&directory).await? {
            tracing::warn!(
                job_id = %job.id,
                directory = %directory.display(),
                "Removing stale job environment"
            );
            tokio::fs::remove_dir_all(&directory).await?;
        }
        tokio::fs::create_dir_all(&directory).await?;

        let definition = self.render_definition(job.id, &directory);
        tokio::fs::write(directory.join(DEFINITION_FILE_NAME), definition).await?;

        let stdout = directory.join(STDOUT_FILE_NAME);
        let stderr = directory.join(STDERR_FILE_NAME);
        let script_file = directory.join(SCRIPT_FILE_NAME);
        tokio::fs::write(&stdout, b"").await?;
        tokio::fs::write(&stderr, b"").await?;
        tokio::fs::write(&script_file, script).await?;

        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;

            tokio::fs::set_permissions(&script_file, Permissions::from_mode(SCRIPT_MODE)).await?;
            tokio::fs::set_permissions(&stdout, Permissions::from_mode(LOG_MODE)).await?;
            tokio::fs::set_permissions(&stderr, Permissions::from_mode(LOG_MODE)).await?;
        }

        tracing::info!(job_id = %job.id, directory = %directory.display(), "Environment prepared");
        Ok(())
    }

    /// Deletes the job directory. A directory that is already gone is not an error.
    pub async fn clear(&self, job: &RunningJob) -> Result<()> {
        let Some(directory) = job.sandbox_dir() else {
            return Ok(());
        };

        match tokio::fs::remove_dir_all(directory).await {
            Ok(()) => {
                tracing::info!(job_id = %job.id, directory = %directory.display(), "Environment cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(job_id = %job.id, "Environment already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
