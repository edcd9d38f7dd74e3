//! The datastore abstraction (spec §4.12 / §6): ordered, indexed entity
//! store with keyed lookup, range/equality queries, and optimistic
//! multi-entity transactions.
//!
//! Mirrors the shape of the teacher's `JobStore` trait (fulfilled by
//! `PgJobStore` over sqlx in the Postgres crate, and by an in-memory fake in
//! `scheduler-testing`): one method per transactional operation rather than a
//! generic transaction-closure, so the trait stays object-safe and callable
//! through `Arc<dyn Datastore>`. Each method is a single optimistic
//! transaction attempt; `retry_tx` (see `crate::retry`) wraps the call site
//! and retries on `DatastoreError::Conflict`.

use crate::job::{Job, JobId, Service};
use crate::error::DatastoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Read-only lookups and range/equality queries (spec §6).
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, DatastoreError>;

    /// Equality query on `(runtimeVersion, service, state=available)`,
    /// ordered by `priority` ascending, capped at `limit` (spec §4.5 step 1).
    async fn query_available(
        &self,
        runtime_version: &str,
        service: Service,
        limit: usize,
    ) -> Result<Vec<Job>, DatastoreError>;

    /// `state = processing ∧ lockedUntil < now` (spec §4.6).
    async fn query_stale_processing(&self, now: DateTime<Utc>) -> Result<Vec<Job>, DatastoreError>;

    /// `state = idle ∧ lockedUntil < now ∧ runtimeVersion = current` (spec §4.7).
    async fn query_idle_expired(
        &self,
        runtime_version: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatastoreError>;

    /// All jobs for a service at the current runtime version (spec §4.11).
    async fn query_by_service(
        &self,
        runtime_version: &str,
        service: Service,
    ) -> Result<Vec<Job>, DatastoreError>;

    /// Ids whose `runtimeVersion` sorts before `before_runtime_version`,
    /// capped at `limit` for batched deletion (spec §4.10).
    async fn query_gc_candidates(
        &self,
        before_runtime_version: &str,
        limit: usize,
    ) -> Result<Vec<JobId>, DatastoreError>;

    /// Insert-or-overwrite `job` within one optimistic transaction, re-reading
    /// the stored row by id first and applying `mutate` to it (or to `None`
    /// if absent). `mutate` returns `Some(new_job)` to write, or `None` to
    /// no-op the transaction. Reports `DatastoreError::Conflict` if the row
    /// changed between the internal re-read and the commit attempt.
    ///
    /// This is `createOrUpdate`'s single entity-level primitive (spec §4.3);
    /// the absent/present branching and freshness comparison live in
    /// `crate::scheduler`, which calls this once per `retry_tx` attempt.
    async fn transact_job(
        &self,
        id: &JobId,
        mutate: Box<dyn FnOnce(Option<Job>) -> Option<Job> + Send>,
    ) -> Result<Option<Job>, DatastoreError>;

    /// Delete a batch of ids as one transaction (spec §4.10).
    async fn delete_jobs(&self, ids: &[JobId]) -> Result<u64, DatastoreError>;
}
