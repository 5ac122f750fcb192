use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use super::{JobStore, StoreError};
use crate::config::StoreConfig;
use crate::job::{JobDefinition, JobStatus};

/// `raise_exception`, the code of a bare `RAISE EXCEPTION` in the job procedures.
const SQLSTATE_RAISE_EXCEPTION: &str = "P0001";
/// `check_violation`, raised by the results size constraint.
const SQLSTATE_CHECK_VIOLATION: &str = "23514";

const MICROS_PER_DAY: i64 = 86_400 * 1_000_000;

/// Postgres-backed store calling the job stored procedures.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    results_size_limit: usize,
}

impl PostgresJobStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;
        tracing::info!(max_connections = config.max_connections, "Connected to job store");

        Ok(Self {
            pool,
            results_size_limit: config.results_size_limit,
        })
    }

    pub fn with_pool(pool: PgPool, results_size_limit: usize) -> Self {
        Self {
            pool,
            results_size_limit,
        }
    }
}

/// Converts a Postgres interval to a duration. Months count as 30 days;
/// negative intervals become zero and overflowing ones saturate.
pub fn interval_to_duration(interval: &PgInterval) -> Duration {
    let micros = i128::from(interval.months) * 30 * i128::from(MICROS_PER_DAY)
        + i128::from(interval.days) * i128::from(MICROS_PER_DAY)
        + i128::from(interval.microseconds);
    let micros = u64::try_from(micros.max(0)).unwrap_or(u64::MAX);
    Duration::from_micros(micros)
}

/// Procedure a database error came from.
#[derive(Debug, Clone, Copy)]
enum Call {
    FetchNew,
    MarkRunning,
    SetResults { size: usize },
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}

/// Maps a procedure failure to a store error.
///
/// The procedures raise plain exceptions, so `P0001` is read by call:
/// `p_jobs_set_running` raises only for a finished job, and
/// `p_jobs_set_results` only for a finished job once the status was
/// validated locally.
fn classify_error(err: sqlx::Error, id: Uuid, call: Call, limit: usize) -> StoreError {
    match (sqlstate(&err).as_deref(), call) {
        (Some(SQLSTATE_RAISE_EXCEPTION), Call::MarkRunning | Call::SetResults { .. }) => {
            StoreError::AlreadyFinished(id)
        }
        (Some(SQLSTATE_CHECK_VIOLATION), Call::SetResults { size }) => {
            StoreError::ResultsTooLarge { id, size, limit }
        }
        _ => match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            other => StoreError::Database(other),
        },
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn fetch_new_job(&self, id: Uuid) -> Result<Option<JobDefinition>, StoreError> {
        let row: Option<(Uuid, PgInterval, String)> = sqlx::query_as(
            r#"SELECT "Id", "Timeout", "Script" FROM pgdbo.f_jobs_get_new($1)"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify_error(e, id, Call::FetchNew, self.results_size_limit))?;

        Ok(row.map(|(id, timeout, script)| JobDefinition {
            id,
            timeout: interval_to_duration(&timeout),
            script,
        }))
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("CALL pgdbo.p_jobs_set_running($1)")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_error(e, id, Call::MarkRunning, self.results_size_limit))?;
        tracing::debug!(job_id = %id, "Job marked as running");
        Ok(())
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

        sqlx::query("CALL pgdbo.p_jobs_set_results($1, $2, $3)")
            .bind(id)
            .bind(status.as_i32())
            .bind(results)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                let call = Call::SetResults {
                    size: results.len(),
                };
                classify_error(e, id, call, self.results_size_limit)
            })?;
        tracing::debug!(job_id = %id, status = %status, size = results.len(), "Job results stored");
        Ok(())
    }
}
