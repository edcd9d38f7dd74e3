//! The five lifecycle operations plus garbage collection (spec §4): the
//! orchestration layer atop `Datastore`. Mirrors the teacher's convention of
//! a thin struct wrapping `Arc<dyn Trait>` collaborators (cf. `PgJobStore`
//! wrapping a `PgPool`) and returning `anyhow::Result` at the call boundary.

use crate::collaborators::{IdlePredicate, PackageStore, PopularityOracle};
use crate::config::SchedulerConfig;
use crate::datastore::Datastore;
use crate::job::{compute_priority, extend_lock, CompletionStatus, Job, JobId, JobState, LastStatus, Service};
use crate::retry::retry_tx;
use crate::stats::{self, StatsAggregator, StatsReport};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Coordinates triggers, worker pickup, maintenance sweeps, and completion
/// against a `Datastore` and the external collaborators named in spec §6.
pub struct Scheduler {
    store: Arc<dyn Datastore>,
    packages: Arc<dyn PackageStore>,
    popularity: Arc<dyn PopularityOracle>,
    cfg: SchedulerConfig,
    runtime_version: String,
    stats: StatsAggregator,
}

/// Summary of one `check_idle` sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckIdleReport {
    pub promoted: usize,
    pub extended: usize,
    pub predicate_failures: usize,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Datastore>,
        packages: Arc<dyn PackageStore>,
        popularity: Arc<dyn PopularityOracle>,
        cfg: SchedulerConfig,
        runtime_version: impl Into<String>,
    ) -> Self {
        Scheduler {
            store,
            packages,
            popularity,
            cfg,
            runtime_version: runtime_version.into(),
            stats: StatsAggregator::default(),
        }
    }

    pub fn runtime_version(&self) -> &str {
        &self.runtime_version
    }

    /// `stats(service)` (spec §4.11): scan, bucket, record in the rolling
    /// ring, and derive an ETA from the prior snapshot if one exists.
    pub async fn stats(&self, service: Service) -> anyhow::Result<StatsReport> {
        let jobs = self
            .store
            .query_by_service(&self.runtime_version, service)
            .await?;
        let snap = stats::snapshot(&jobs, Utc::now());
        Ok(self.stats.record(service, snap).await)
    }

    /// `trigger(service, package, version?, updated?, highPriority?)` (spec §4.2).
    pub async fn trigger(
        &self,
        service: Service,
        package_name: &str,
        version: Option<&str>,
        updated: Option<DateTime<Utc>>,
        high_priority: bool,
    ) -> anyhow::Result<()> {
        let Some(pkg) = self.packages.get_package(package_name).await? else {
            tracing::info!(package_name, "trigger: package not found, no-op");
            return Ok(());
        };
        if pkg.is_not_visible {
            tracing::info!(package_name, "trigger: package not visible, no-op");
            return Ok(());
        }
        let version = version.unwrap_or(pkg.latest_version.as_str()).to_string();
        let Some(pv) = self
            .packages
            .get_package_version(package_name, &version)
            .await?
        else {
            tracing::info!(package_name, version, "trigger: version not found, no-op");
            return Ok(());
        };

        let is_latest_stable = pkg.latest_version == version;
        let should_process =
            high_priority || updated.is_none() || updated.unwrap() > pv.created;
        let fixed_priority = if high_priority { Some(0) } else { None };

        self.create_or_update(
            service,
            package_name,
            &version,
            is_latest_stable,
            pv.created,
            should_process,
            fixed_priority,
        )
        .await
    }

    /// `createOrUpdate` (spec §4.3).
    pub async fn create_or_update(
        &self,
        service: Service,
        package_name: &str,
        version: &str,
        is_latest_stable: bool,
        package_version_updated: DateTime<Utc>,
        should_process: bool,
        fixed_priority: Option<i32>,
    ) -> anyhow::Result<()> {
        let id = JobId::new(&self.runtime_version, service, package_name, version);
        let popularity = self.popularity.popularity(package_name).await;
        let computed_priority = compute_priority(popularity, &self.cfg);
        let runtime_version = self.runtime_version.clone();
        let package_name = package_name.to_string();
        let version = version.to_string();
        let cfg = self.cfg.clone();

        retry_tx(&self.cfg, || {
            let id = id.clone();
            let runtime_version = runtime_version.clone();
            let package_name = package_name.clone();
            let version = version.clone();
            let cfg = cfg.clone();
            async move {
                let now = Utc::now();
                self.store
                    .transact_job(
                        &id,
                        Box::new(move |existing| {
                            create_or_update_mutate(
                                existing,
                                &runtime_version,
                                service,
                                package_name,
                                version,
                                is_latest_stable,
                                package_version_updated,
                                should_process,
                                fixed_priority,
                                computed_priority,
                                now,
                                &cfg,
                            )
                        }),
                    )
                    .await
            }
        })
        .await?;
        Ok(())
    }

    /// `lockAvailable(service)` (spec §4.5).
    pub async fn lock_available(&self, service: Service) -> anyhow::Result<Option<Job>> {
        let candidates = self
            .store
            .query_available(&self.runtime_version, service, self.cfg.pickup_query_limit)
            .await?;
        let candidates: Vec<Job> = candidates
            .into_iter()
            .filter(|j| {
                j.runtime_version == self.runtime_version
                    && j.service == service
                    && j.state == JobState::Available
            })
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }
        let idx = pick_biased_index(candidates.len(), &self.cfg);
        let id = candidates[idx].id.clone();
        let cfg = self.cfg.clone();
        let runtime_version = self.runtime_version.clone();

        let result = retry_tx(&self.cfg, || {
            let id = id.clone();
            let cfg = cfg.clone();
            let runtime_version = runtime_version.clone();
            async move {
                let now = Utc::now();
                self.store
                    .transact_job(
                        &id,
                        Box::new(move |existing| {
                            lock_available_mutate(existing, &runtime_version, service, now, &cfg)
                        }),
                    )
                    .await
            }
        })
        .await?;
        Ok(result)
    }

    /// `unlockStaleProcessing` (spec §4.6).
    pub async fn unlock_stale_processing(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let stale = self.store.query_stale_processing(now).await?;
        let mut recovered = 0usize;
        for job in stale {
            let popularity = self.popularity.popularity(&job.package_name).await;
            let computed_priority = compute_priority(popularity, &self.cfg);
            let id = job.id.clone();
            let expected_locked_until = job.locked_until;
            let cfg = self.cfg.clone();

            let outcome = retry_tx(&self.cfg, || {
                let id = id.clone();
                let cfg = cfg.clone();
                async move {
                    self.store
                        .transact_job(
                            &id,
                            Box::new(move |existing| {
                                unlock_stale_mutate(
                                    existing,
                                    expected_locked_until,
                                    Utc::now(),
                                    &cfg,
                                    computed_priority,
                                )
                            }),
                        )
                        .await
                }
            })
            .await;

            match outcome {
                Ok(Some(_)) => recovered += 1,
                Ok(None) => { /* fenced: a concurrent transition already moved this job */ }
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "unlock_stale_processing: datastore error, skipping job");
                }
            }
        }
        Ok(recovered)
    }

    /// `checkIdle` (spec §4.7).
    pub async fn check_idle(&self, predicate: &dyn IdlePredicate) -> anyhow::Result<CheckIdleReport> {
        let now = Utc::now();
        let candidates = self
            .store
            .query_idle_expired(&self.runtime_version, now)
            .await?;
        let mut report = CheckIdleReport::default();

        for job in candidates {
            let should_process = match predicate
                .should_process(&job.package_name, &job.package_version, job.package_version_updated)
                .await
            {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "check_idle: predicate failed, skipping job");
                    report.predicate_failures += 1;
                    continue;
                }
            };

            // Promotion is a write like any other (spec §3): priority is
            // recomputed. Extension is the one write spec §4.7 exempts.
            let computed_priority = if should_process {
                let popularity = self.popularity.popularity(&job.package_name).await;
                Some(compute_priority(popularity, &self.cfg))
            } else {
                None
            };

            let id = job.id.clone();
            let expected_locked_until = job.locked_until;
            let cfg = self.cfg.clone();

            let outcome = retry_tx(&self.cfg, || {
                let id = id.clone();
                let cfg = cfg.clone();
                async move {
                    self.store
                        .transact_job(
                            &id,
                            Box::new(move |existing| {
                                check_idle_mutate(
                                    existing,
                                    expected_locked_until,
                                    should_process,
                                    computed_priority,
                                    Utc::now(),
                                    &cfg,
                                )
                            }),
                        )
                        .await
                }
            })
            .await;

            match outcome {
                Ok(Some(_)) if should_process => report.promoted += 1,
                Ok(Some(_)) => report.extended += 1,
                Ok(None) => { /* fenced */ }
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "check_idle: datastore error, skipping job");
                }
            }
        }
        Ok(report)
    }

    /// `complete(job, status)` (spec §4.8). Returns whether the completion
    /// was accepted (vs. dropped by fencing).
    pub async fn complete(
        &self,
        id: &JobId,
        processing_key: Option<&str>,
        status: CompletionStatus,
    ) -> anyhow::Result<bool> {
        let Some(current) = self.store.get_job(id).await? else {
            tracing::warn!(job_id = %id, "complete: job not found, dropping");
            return Ok(false);
        };
        let precheck_ok =
            current.processing_key.as_deref() == processing_key || matches!(status, CompletionStatus::Success);
        if !precheck_ok {
            tracing::warn!(job_id = %id, "complete: processing key mismatch, dropping");
            return Ok(false);
        }

        let popularity = self.popularity.popularity(&current.package_name).await;
        let computed_priority = compute_priority(popularity, &self.cfg);
        let cfg = self.cfg.clone();
        let id = id.clone();
        let processing_key = processing_key.map(|s| s.to_string());

        let result = retry_tx(&self.cfg, || {
            let id = id.clone();
            let cfg = cfg.clone();
            let processing_key = processing_key.clone();
            async move {
                self.store
                    .transact_job(
                        &id,
                        Box::new(move |existing| {
                            complete_mutate(
                                existing,
                                processing_key.as_deref(),
                                status,
                                Utc::now(),
                                &cfg,
                                computed_priority,
                            )
                        }),
                    )
                    .await
            }
        })
        .await?;
        Ok(result.is_some())
    }

    /// `deleteOldEntries` (spec §4.10): batches of `cfg.gc_batch_size` commits.
    pub async fn delete_old_entries(&self) -> anyhow::Result<u64> {
        let mut total = 0u64;
        loop {
            let ids = self
                .store
                .query_gc_candidates(&self.cfg.gc_before_runtime_version, self.cfg.gc_batch_size)
                .await?;
            if ids.is_empty() {
                break;
            }
            let batch_len = ids.len();
            total += self.store.delete_jobs(&ids).await?;
            if batch_len < self.cfg.gc_batch_size {
                break;
            }
        }
        Ok(total)
    }
}

#[allow(clippy::too_many_arguments)]
fn create_or_update_mutate(
    existing: Option<Job>,
    runtime_version: &str,
    service: Service,
    package_name: String,
    version: String,
    is_latest_stable: bool,
    package_version_updated: DateTime<Utc>,
    should_process: bool,
    fixed_priority: Option<i32>,
    computed_priority: i32,
    now: DateTime<Utc>,
    cfg: &SchedulerConfig,
) -> Option<Job> {
    match existing {
        None => {
            let mut job = Job::new(
                runtime_version.to_string(),
                service,
                package_name,
                version,
                is_latest_stable,
                package_version_updated,
                should_process,
                now,
                cfg.short_extend,
            );
            job.priority = computed_priority;
            if let Some(fp) = fixed_priority {
                job.fix_priority(fp);
            }
            Some(job)
        }
        Some(mut stored) => {
            // Open question (spec §9): equal `packageVersionUpdated` counts as
            // "not changed", preserved literally from the original behavior.
            let has_not_changed = stored.is_latest_stable == is_latest_stable
                && stored.package_version_updated >= package_version_updated
                && fixed_priority.map_or(true, |p| stored.priority <= p);

            if has_not_changed && !should_process {
                return None;
            }
            if has_not_changed
                && should_process
                && stored.state == JobState::Available
                && stored.locked_until.is_none()
            {
                return None;
            }

            stored.is_latest_stable = is_latest_stable;
            stored.package_version_updated = package_version_updated;
            stored.state = if should_process {
                JobState::Available
            } else {
                JobState::Idle
            };
            stored.locked_until = if should_process {
                None
            } else {
                Some(now + cfg.short_extend)
            };
            // Abandon any in-flight lease: the original worker's `complete`
            // will be fenced out by the cleared key (spec §4.3).
            stored.processing_key = None;
            stored.priority = computed_priority;
            if let Some(fp) = fixed_priority {
                stored.fix_priority(fp);
            }
            Some(stored)
        }
    }
}

fn lock_available_mutate(
    existing: Option<Job>,
    runtime_version: &str,
    service: Service,
    now: DateTime<Utc>,
    cfg: &SchedulerConfig,
) -> Option<Job> {
    let mut job = existing?;
    if job.runtime_version != runtime_version || job.service != service || job.state != JobState::Available {
        return None;
    }
    job.state = JobState::Processing;
    job.processing_key = Some(Uuid::new_v4().to_string());
    job.locked_until = Some(now + cfg.default_lock);
    Some(job)
}

fn unlock_stale_mutate(
    existing: Option<Job>,
    expected_locked_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cfg: &SchedulerConfig,
    computed_priority: i32,
) -> Option<Job> {
    let mut job = existing?;
    if job.state != JobState::Processing || job.locked_until != expected_locked_until {
        return None;
    }
    job.error_count = job.error_count.saturating_add(1);
    job.state = JobState::Idle;
    job.last_status = LastStatus::Aborted;
    job.processing_key = None;
    job.locked_until = Some(extend_lock(job.error_count, now, cfg));
    job.priority = computed_priority;
    Some(job)
}

fn check_idle_mutate(
    existing: Option<Job>,
    expected_locked_until: Option<DateTime<Utc>>,
    should_process: bool,
    computed_priority: Option<i32>,
    now: DateTime<Utc>,
    cfg: &SchedulerConfig,
) -> Option<Job> {
    let mut job = existing?;
    if job.state != JobState::Idle || job.locked_until != expected_locked_until {
        return None;
    }
    if should_process {
        job.state = JobState::Available;
        job.processing_key = None;
        job.locked_until = None;
        if let Some(p) = computed_priority {
            job.priority = p;
        }
    } else {
        // Priority is not recomputed on extension (spec §4.7).
        job.locked_until = Some(now + cfg.short_extend);
    }
    Some(job)
}

fn complete_mutate(
    existing: Option<Job>,
    processing_key: Option<&str>,
    status: CompletionStatus,
    now: DateTime<Utc>,
    cfg: &SchedulerConfig,
    computed_priority: i32,
) -> Option<Job> {
    let mut job = existing?;
    let accepted =
        job.processing_key.as_deref() == processing_key || matches!(status, CompletionStatus::Success);
    if !accepted {
        return None;
    }
    job.apply_completion(status, now, cfg);
    job.priority = computed_priority;
    Some(job)
}

/// Two-draw pickup bias (spec §4.5 step 4, §9): draw `r1` uniformly; if it
/// lands in the biased head, use it directly, else draw again. Concentrates
/// extra mass on the first `pickup_bias_threshold` candidates without
/// collapsing to strict priority order (which would thunder-herd the head).
fn pick_biased_index(n: usize, cfg: &SchedulerConfig) -> usize {
    let r1 = fastrand::usize(0..n);
    if r1 < cfg.pickup_bias_threshold.min(n) {
        r1
    } else {
        fastrand::usize(0..n)
    }
}
