//! PostgreSQL-backed [`Datastore`] for `pub-scheduler-core`.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id                       TEXT PRIMARY KEY,
//!     runtime_version          TEXT NOT NULL,
//!     service                  TEXT NOT NULL,
//!     package_name             TEXT NOT NULL,
//!     package_version          TEXT NOT NULL,
//!     is_latest_stable         BOOLEAN NOT NULL,
//!     package_version_updated  TIMESTAMPTZ NOT NULL,
//!     state                    TEXT NOT NULL,
//!     locked_until             TIMESTAMPTZ,
//!     processing_key           TEXT,
//!     last_status              TEXT NOT NULL,
//!     error_count              INTEGER NOT NULL,
//!     priority                 INTEGER NOT NULL
//! );
//!
//! CREATE INDEX idx_jobs_available
//!     ON jobs (runtime_version, service, priority)
//!     WHERE state = 'available';
//! CREATE INDEX idx_jobs_stale_processing
//!     ON jobs (locked_until)
//!     WHERE state = 'processing';
//! CREATE INDEX idx_jobs_idle_expired
//!     ON jobs (runtime_version, locked_until)
//!     WHERE state = 'idle';
//! CREATE INDEX idx_jobs_service
//!     ON jobs (runtime_version, service);
//! CREATE INDEX idx_jobs_runtime_version
//!     ON jobs (runtime_version);
//! ```
//!
//! # Transactions
//!
//! [`transact_job`](Datastore::transact_job) opens a `SERIALIZABLE`
//! transaction, reads the row by id, applies the caller's mutate closure
//! in-process, and upserts the result (or rolls back untouched on `None`).
//! Postgres reports a write-write conflict under `SERIALIZABLE` as SQLSTATE
//! `40001` (`serialization_failure`) or `40P01` (`deadlock_detected`); both
//! map to [`DatastoreError::Conflict`] so `retry_tx` retries them. Any other
//! `sqlx::Error` maps to [`DatastoreError::Fatal`].
//!
//! # Usage
//!
//! ```ignore
//! use pub_scheduler_postgres::PgDatastore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/scheduler").await?;
//! let store = PgDatastore::new(pool);
//! let scheduler = Scheduler::new(Arc::new(store), packages, popularity, SchedulerConfig::default(), "2024.07.01");
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pub_scheduler_core::datastore::Datastore;
use pub_scheduler_core::error::DatastoreError;
use pub_scheduler_core::job::{Job, JobId, JobState, LastStatus, Service};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;

/// PostgreSQL [`Datastore`] implementation, one `PgPool` per process.
#[derive(Clone)]
pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    pub fn new(pool: PgPool) -> Self {
        PgDatastore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, DatastoreError> {
    let id_str: String = row.try_get("id").map_err(fatal)?;
    let runtime_version: String = row.try_get("runtime_version").map_err(fatal)?;
    let service_str: String = row.try_get("service").map_err(fatal)?;
    let service = Service::from_str(&service_str)
        .map_err(|e| DatastoreError::Fatal(anyhow::anyhow!("decoding job {id_str}: {e}")))?;
    let package_name: String = row.try_get("package_name").map_err(fatal)?;
    let package_version: String = row.try_get("package_version").map_err(fatal)?;
    let is_latest_stable: bool = row.try_get("is_latest_stable").map_err(fatal)?;
    let package_version_updated: DateTime<Utc> = row.try_get("package_version_updated").map_err(fatal)?;
    let state_str: String = row.try_get("state").map_err(fatal)?;
    let state = decode_state(&state_str)
        .ok_or_else(|| DatastoreError::Fatal(anyhow::anyhow!("decoding job {id_str}: unknown state {state_str}")))?;
    let locked_until: Option<DateTime<Utc>> = row.try_get("locked_until").map_err(fatal)?;
    let processing_key: Option<String> = row.try_get("processing_key").map_err(fatal)?;
    let last_status_str: String = row.try_get("last_status").map_err(fatal)?;
    let last_status = decode_last_status(&last_status_str).ok_or_else(|| {
        DatastoreError::Fatal(anyhow::anyhow!("decoding job {id_str}: unknown last_status {last_status_str}"))
    })?;
    let error_count: i32 = row.try_get("error_count").map_err(fatal)?;
    let priority: i32 = row.try_get("priority").map_err(fatal)?;

    Ok(Job {
        id: JobId::new(&runtime_version, service, &package_name, &package_version),
        runtime_version,
        service,
        package_name,
        package_version,
        is_latest_stable,
        package_version_updated,
        state,
        locked_until,
        processing_key,
        last_status,
        error_count: error_count.max(0) as u32,
        priority,
    })
}

fn encode_state(s: JobState) -> &'static str {
    match s {
        JobState::Available => "available",
        JobState::Processing => "processing",
        JobState::Idle => "idle",
    }
}

fn decode_state(s: &str) -> Option<JobState> {
    match s {
        "available" => Some(JobState::Available),
        "processing" => Some(JobState::Processing),
        "idle" => Some(JobState::Idle),
        _ => None,
    }
}

fn encode_last_status(s: LastStatus) -> &'static str {
    match s {
        LastStatus::None => "none",
        LastStatus::Success => "success",
        LastStatus::Failed => "failed",
        LastStatus::Aborted => "aborted",
    }
}

fn decode_last_status(s: &str) -> Option<LastStatus> {
    match s {
        "none" => Some(LastStatus::None),
        "success" => Some(LastStatus::Success),
        "failed" => Some(LastStatus::Failed),
        "aborted" => Some(LastStatus::Aborted),
        _ => None,
    }
}

fn fatal(e: sqlx::Error) -> DatastoreError {
    DatastoreError::Fatal(e.into())
}

/// Maps a `sqlx::Error` surfaced from inside a `SERIALIZABLE` transaction to
/// `Conflict` for the two SQLSTATEs Postgres uses to report a lost race,
/// `Fatal` for everything else (spec §4.1, §6).
fn map_tx_error(e: sqlx::Error) -> DatastoreError {
    if let sqlx::Error::Database(db_err) = &e {
        if let Some(code) = db_err.code() {
            if code == "40001" || code == "40P01" {
                tracing::debug!(sqlstate = %code, "transact_job: serialization conflict");
                return DatastoreError::Conflict;
            }
        }
    }
    tracing::error!(error = %e, "transact_job: non-retryable datastore error");
    DatastoreError::Fatal(e.into())
}

async fn upsert_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, runtime_version, service, package_name, package_version,
            is_latest_stable, package_version_updated, state, locked_until,
            processing_key, last_status, error_count, priority
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (id) DO UPDATE SET
            is_latest_stable = EXCLUDED.is_latest_stable,
            package_version_updated = EXCLUDED.package_version_updated,
            state = EXCLUDED.state,
            locked_until = EXCLUDED.locked_until,
            processing_key = EXCLUDED.processing_key,
            last_status = EXCLUDED.last_status,
            error_count = EXCLUDED.error_count,
            priority = EXCLUDED.priority
        "#,
    )
    .bind(job.id.as_str())
    .bind(&job.runtime_version)
    .bind(job.service.as_str())
    .bind(&job.package_name)
    .bind(&job.package_version)
    .bind(job.is_latest_stable)
    .bind(job.package_version_updated)
    .bind(encode_state(job.state))
    .bind(job.locked_until)
    .bind(&job.processing_key)
    .bind(encode_last_status(job.last_status))
    .bind(job.error_count as i32)
    .bind(job.priority)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Datastore for PgDatastore {
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, DatastoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(fatal)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn query_available(
        &self,
        runtime_version: &str,
        service: Service,
        limit: usize,
    ) -> Result<Vec<Job>, DatastoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE runtime_version = $1 AND service = $2 AND state = 'available'
            ORDER BY priority ASC
            LIMIT $3
            "#,
        )
        .bind(runtime_version)
        .bind(service.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(fatal)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn query_stale_processing(&self, now: DateTime<Utc>) -> Result<Vec<Job>, DatastoreError> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE state = 'processing' AND locked_until < $1")
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(fatal)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn query_idle_expired(
        &self,
        runtime_version: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatastoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE runtime_version = $1 AND state = 'idle' AND locked_until < $2",
        )
        .bind(runtime_version)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(fatal)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn query_by_service(
        &self,
        runtime_version: &str,
        service: Service,
    ) -> Result<Vec<Job>, DatastoreError> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE runtime_version = $1 AND service = $2")
            .bind(runtime_version)
            .bind(service.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(fatal)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn query_gc_candidates(
        &self,
        before_runtime_version: &str,
        limit: usize,
    ) -> Result<Vec<JobId>, DatastoreError> {
        let rows = sqlx::query("SELECT id FROM jobs WHERE runtime_version < $1 ORDER BY id LIMIT $2")
            .bind(before_runtime_version)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(fatal)?;
        Ok(rows
            .into_iter()
            .map(|r| JobId::from_raw(r.get::<String, _>("id")))
            .collect())
    }

    async fn transact_job(
        &self,
        id: &JobId,
        mutate: Box<dyn FnOnce(Option<Job>) -> Option<Job> + Send>,
    ) -> Result<Option<Job>, DatastoreError> {
        let mut tx = self.pool.begin().await.map_err(fatal)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_tx_error)?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_tx_error)?;
        let existing = row.as_ref().map(job_from_row).transpose()?;

        let result = mutate(existing);
        match &result {
            None => {
                tx.rollback().await.map_err(map_tx_error)?;
            }
            Some(job) => {
                upsert_job(&mut tx, job).await.map_err(map_tx_error)?;
                tx.commit().await.map_err(map_tx_error)?;
            }
        }
        Ok(result)
    }

    async fn delete_jobs(&self, ids: &[JobId]) -> Result<u64, DatastoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let id_strs: Vec<&str> = ids.iter().map(|i| i.as_str()).collect();
        let result = sqlx::query("DELETE FROM jobs WHERE id = ANY($1)")
            .bind(&id_strs as &[&str])
            .execute(&self.pool)
            .await
            .map_err(fatal)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_encoding() {
        for s in [JobState::Available, JobState::Processing, JobState::Idle] {
            assert_eq!(decode_state(encode_state(s)), Some(s));
        }
    }

    #[test]
    fn last_status_round_trips_through_encoding() {
        for s in [
            LastStatus::None,
            LastStatus::Success,
            LastStatus::Failed,
            LastStatus::Aborted,
        ] {
            assert_eq!(decode_last_status(encode_last_status(s)), Some(s));
        }
    }

    #[test]
    fn unknown_state_string_decodes_to_none() {
        assert_eq!(decode_state("bogus"), None);
    }
}
