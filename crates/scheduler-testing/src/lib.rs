//! In-memory [`Datastore`] fake and fixture builders for `pub-scheduler-core`.
//!
//! [`InMemoryDatastore`] reproduces the datastore contract's conflict
//! semantics (each row carries an internal version counter bumped on every
//! write; [`transact_job`](Datastore::transact_job) aborts with
//! `DatastoreError::Conflict` if the row changed between its internal read
//! and the write) without a live Postgres instance, mirroring the role the
//! teacher's `MockJobStore` plays for `JobStore` in its own test suite.
//!
//! Fault injection (`fail_next_conflicts`) lets a test exercise `retry_tx`'s
//! backoff loop deterministically instead of relying on real concurrency.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pub_scheduler_core::datastore::Datastore;
use pub_scheduler_core::error::DatastoreError;
use pub_scheduler_core::job::{Job, JobId, JobState, Service};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Install a `tracing-subscriber` `EnvFilter` subscriber for test output.
/// Idempotent: safe to call from every test, only the first call takes effect.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

struct Row {
    job: Job,
    version: u64,
}

/// An in-process [`Datastore`] backed by a `Mutex<HashMap<JobId, Row>>`.
///
/// Safe to share across tasks via `Arc`; every method takes `&self`.
#[derive(Default)]
pub struct InMemoryDatastore {
    rows: Mutex<HashMap<JobId, Row>>,
    forced_conflicts: AtomicU32,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        InMemoryDatastore::default()
    }

    /// Insert or overwrite a job directly, bypassing `transact_job`. Useful
    /// for seeding fixtures in tests that don't care about the version counter.
    pub fn seed(&self, job: Job) {
        let mut rows = self.rows.lock().unwrap();
        let version = rows.get(&job.id).map(|r| r.version + 1).unwrap_or(0);
        rows.insert(job.id.clone(), Row { job, version });
    }

    /// Snapshot every stored job, in no particular order.
    pub fn all(&self) -> Vec<Job> {
        self.rows.lock().unwrap().values().map(|r| r.job.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force the next `n` calls to `transact_job` to report `Conflict`
    /// instead of touching the map, regardless of actual contention.
    pub fn fail_next_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    fn take_forced_conflict(&self) -> bool {
        loop {
            let current = self.forced_conflicts.load(Ordering::SeqCst);
            if current == 0 {
                return false;
            }
            if self
                .forced_conflicts
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, DatastoreError> {
        Ok(self.rows.lock().unwrap().get(id).map(|r| r.job.clone()))
    }

    async fn query_available(
        &self,
        runtime_version: &str,
        service: Service,
        limit: usize,
    ) -> Result<Vec<Job>, DatastoreError> {
        let rows = self.rows.lock().unwrap();
        let mut matches: Vec<Job> = rows
            .values()
            .map(|r| &r.job)
            .filter(|j| j.runtime_version == runtime_version && j.service == service && j.state == JobState::Available)
            .cloned()
            .collect();
        matches.sort_by_key(|j| j.priority);
        matches.truncate(limit);
        Ok(matches)
    }

    async fn query_stale_processing(&self, now: DateTime<Utc>) -> Result<Vec<Job>, DatastoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .map(|r| &r.job)
            .filter(|j| j.state == JobState::Processing && j.locked_until.map_or(false, |lu| lu < now))
            .cloned()
            .collect())
    }

    async fn query_idle_expired(
        &self,
        runtime_version: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatastoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .map(|r| &r.job)
            .filter(|j| {
                j.runtime_version == runtime_version
                    && j.state == JobState::Idle
                    && j.locked_until.map_or(false, |lu| lu < now)
            })
            .cloned()
            .collect())
    }

    async fn query_by_service(
        &self,
        runtime_version: &str,
        service: Service,
    ) -> Result<Vec<Job>, DatastoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .map(|r| &r.job)
            .filter(|j| j.runtime_version == runtime_version && j.service == service)
            .cloned()
            .collect())
    }

    async fn query_gc_candidates(
        &self,
        before_runtime_version: &str,
        limit: usize,
    ) -> Result<Vec<JobId>, DatastoreError> {
        let rows = self.rows.lock().unwrap();
        let mut ids: Vec<JobId> = rows
            .values()
            .map(|r| &r.job)
            .filter(|j| j.runtime_version.as_str() < before_runtime_version)
            .map(|j| j.id.clone())
            .collect();
        ids.sort();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn transact_job(
        &self,
        id: &JobId,
        mutate: Box<dyn FnOnce(Option<Job>) -> Option<Job> + Send>,
    ) -> Result<Option<Job>, DatastoreError> {
        if self.take_forced_conflict() {
            return Err(DatastoreError::Conflict);
        }
        let mut rows = self.rows.lock().unwrap();
        let existing = rows.get(id).map(|r| r.job.clone());
        let next_version = rows.get(id).map(|r| r.version + 1).unwrap_or(0);
        match mutate(existing) {
            None => Ok(None),
            Some(job) => {
                rows.insert(
                    id.clone(),
                    Row {
                        job: job.clone(),
                        version: next_version,
                    },
                );
                Ok(Some(job))
            }
        }
    }

    async fn delete_jobs(&self, ids: &[JobId]) -> Result<u64, DatastoreError> {
        let mut rows = self.rows.lock().unwrap();
        let mut deleted = 0u64;
        for id in ids {
            if rows.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Builds [`Job`] fixtures for tests, matching the teacher's `seed_job`-style
/// helpers rather than forcing every test to call `Job::new` with every field.
pub struct JobFixture {
    job: Job,
}

impl JobFixture {
    pub fn new(runtime_version: &str, service: Service, package_name: &str, package_version: &str) -> Self {
        let job = Job::new(
            runtime_version.to_string(),
            service,
            package_name.to_string(),
            package_version.to_string(),
            false,
            Utc::now(),
            true,
            Utc::now(),
            chrono::Duration::hours(12),
        );
        JobFixture { job }
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.job.state = state;
        self
    }

    pub fn locked_until(mut self, locked_until: Option<DateTime<Utc>>) -> Self {
        self.job.locked_until = locked_until;
        self
    }

    pub fn processing_key(mut self, key: Option<&str>) -> Self {
        self.job.processing_key = key.map(|s| s.to_string());
        self
    }

    pub fn error_count(mut self, error_count: u32) -> Self {
        self.job.error_count = error_count;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.job.priority = priority;
        self
    }

    pub fn is_latest_stable(mut self, is_latest_stable: bool) -> Self {
        self.job.is_latest_stable = is_latest_stable;
        self
    }

    pub fn package_version_updated(mut self, updated: DateTime<Utc>) -> Self {
        self.job.package_version_updated = updated;
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

/// A [`PopularityOracle`](pub_scheduler_core::collaborators::PopularityOracle)
/// fake returning a fixed value for every package, or 0.0 for any package not
/// explicitly seeded.
#[derive(Default)]
pub struct FixedPopularityOracle {
    values: Mutex<HashMap<String, f64>>,
}

impl FixedPopularityOracle {
    pub fn new() -> Self {
        FixedPopularityOracle::default()
    }

    pub fn set(&self, package_name: &str, popularity: f64) {
        self.values.lock().unwrap().insert(package_name.to_string(), popularity);
    }
}

#[async_trait]
impl pub_scheduler_core::collaborators::PopularityOracle for FixedPopularityOracle {
    async fn popularity(&self, package_name: &str) -> f64 {
        self.values.lock().unwrap().get(package_name).copied().unwrap_or(0.0)
    }
}

/// A [`PackageStore`](pub_scheduler_core::collaborators::PackageStore) fake
/// backed by an in-process map, for `trigger` tests that need a package and
/// package-version record to exist without a real metadata service.
#[derive(Default)]
pub struct FakePackageStore {
    packages: Mutex<HashMap<String, pub_scheduler_core::collaborators::PackageRecord>>,
    versions: Mutex<HashMap<(String, String), pub_scheduler_core::collaborators::PackageVersionRecord>>,
}

impl FakePackageStore {
    pub fn new() -> Self {
        FakePackageStore::default()
    }

    pub fn add_package(&self, name: &str, latest_version: &str, is_not_visible: bool) {
        self.packages.lock().unwrap().insert(
            name.to_string(),
            pub_scheduler_core::collaborators::PackageRecord {
                latest_version: latest_version.to_string(),
                is_not_visible,
            },
        );
    }

    pub fn add_version(&self, name: &str, version: &str, created: DateTime<Utc>) {
        self.versions
            .lock()
            .unwrap()
            .insert((name.to_string(), version.to_string()), pub_scheduler_core::collaborators::PackageVersionRecord { created });
    }
}

#[async_trait]
impl pub_scheduler_core::collaborators::PackageStore for FakePackageStore {
    async fn get_package(&self, name: &str) -> anyhow::Result<Option<pub_scheduler_core::collaborators::PackageRecord>> {
        Ok(self.packages.lock().unwrap().get(name).cloned())
    }

    async fn get_package_version(
        &self,
        name: &str,
        version: &str,
    ) -> anyhow::Result<Option<pub_scheduler_core::collaborators::PackageVersionRecord>> {
        Ok(self
            .versions
            .lock()
            .unwrap()
            .get(&(name.to_string(), version.to_string()))
            .copied())
    }
}

/// An [`IdlePredicate`](pub_scheduler_core::collaborators::IdlePredicate) that
/// always returns a fixed answer, for `check_idle` tests.
pub struct FixedIdlePredicate(pub bool);

#[async_trait]
impl pub_scheduler_core::collaborators::IdlePredicate for FixedIdlePredicate {
    async fn should_process(&self, _package_name: &str, _package_version: &str, _updated: DateTime<Utc>) -> anyhow::Result<bool> {
        Ok(self.0)
    }
}

/// An `IdlePredicate` that always fails, for exercising the per-job error
/// isolation `check_idle` must provide (spec §7).
pub struct FailingIdlePredicate;

#[async_trait]
impl pub_scheduler_core::collaborators::IdlePredicate for FailingIdlePredicate {
    async fn should_process(&self, _package_name: &str, _package_version: &str, _updated: DateTime<Utc>) -> anyhow::Result<bool> {
        Err(anyhow::anyhow!("predicate backend unavailable"))
    }
}
