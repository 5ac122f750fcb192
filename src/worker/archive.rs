use std::io::{Cursor, Write};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::sandbox::{STDERR_FILE_NAME, STDOUT_FILE_NAME};
use crate::error::{Result, WorkerError};
use crate::job::RunningJob;

/// Packs the sandbox log files of a finished job into one zip archive.
#[derive(Debug, Clone, Default)]
pub struct ResultsArchiver;

impl ResultsArchiver {
    pub fn new() -> Self {
        Self
    }

    /// Builds the archive in memory and stores it on the job.
    pub async fn collect(&self, job: &mut RunningJob) -> Result<()> {
        let Some(directory) = job.sandbox_dir() else {
            return Err(WorkerError::invalid_state(
                job.id,
                "cannot collect results without an environment",
            ));
        };
        if !job.status.is_terminal() {
            return Err(WorkerError::invalid_state(
                job.id,
                format!("cannot collect results of a {} job", job.status),
            ));
        }

        let stdout = tokio::fs::read(directory.join(STDOUT_FILE_NAME)).await?;
        let stderr = tokio::fs::read(directory.join(STDERR_FILE_NAME)).await?;

        let archive = tokio::task::spawn_blocking(move || {
            build_archive(&[(STDOUT_FILE_NAME, &stdout), (STDERR_FILE_NAME, &stderr)])
        })
        .await
        .map_err(|e| WorkerError::Internal(format!("archive task failed: {e}")))??;

        tracing::info!(
            job_id = %job.id,
            size_mb = archive.len() as f64 / (1024.0 * 1024.0),
            "Results collected"
        );
        job.store_results(archive)
    }
}

fn build_archive(entries: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, content) in entries {
        writer.start_file(*name, options)?;
        writer.write_all(content)?;
    }

    Ok(writer.finish()?.into_inner())
}
