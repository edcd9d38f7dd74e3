//! Exercises the concrete scenarios of spec §8 against `InMemoryDatastore`.

use crate::config::SchedulerConfig;
use crate::datastore::Datastore;
use crate::job::{CompletionStatus, JobState, LastStatus, Service};
use crate::scheduler::Scheduler;
use chrono::{Duration, Utc};
use pub_scheduler_testing::{FakePackageStore, FixedIdlePredicate, FixedPopularityOracle, InMemoryDatastore};
use std::sync::Arc;

fn scheduler(store: Arc<InMemoryDatastore>) -> Scheduler {
    Scheduler::new(
        store,
        Arc::new(FakePackageStore::new()),
        Arc::new(FixedPopularityOracle::new()),
        SchedulerConfig::default(),
        "v1",
    )
}

/// Scenario 1: fresh trigger on stale data creates an `available` job.
#[tokio::test]
async fn fresh_trigger_on_stale_data_creates_available_job() {
    let store = Arc::new(InMemoryDatastore::new());
    let packages = Arc::new(FakePackageStore::new());
    packages.add_package("p", "1.0.0", false);
    let created = Utc::now() - Duration::days(1);
    packages.add_version("p", "1.0.0", created);

    let sched = Scheduler::new(
        store.clone(),
        packages,
        Arc::new(FixedPopularityOracle::new()),
        SchedulerConfig::default(),
        "v1",
    );

    let updated = created + Duration::days(1);
    sched
        .trigger(Service::Analyzer, "p", Some("1.0.0"), Some(updated), false)
        .await
        .unwrap();

    let jobs = store.all();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.state, JobState::Available);
    assert_eq!(job.locked_until, None);
    assert_eq!(job.last_status, LastStatus::None);
    assert_eq!(job.error_count, 0);
}

/// `trigger` against a package that doesn't exist is an idempotent no-op.
#[tokio::test]
async fn trigger_on_missing_package_is_noop() {
    let store = Arc::new(InMemoryDatastore::new());
    let sched = scheduler(store.clone());
    sched
        .trigger(Service::Analyzer, "ghost", None, None, false)
        .await
        .unwrap();
    assert!(store.is_empty());
}

/// `trigger` re-invoked with unchanged inputs produces no mutation (spec §8,
/// "idempotent trigger").
#[tokio::test]
async fn repeated_trigger_with_unchanged_inputs_is_noop() {
    let store = Arc::new(InMemoryDatastore::new());
    let packages = Arc::new(FakePackageStore::new());
    packages.add_package("p", "1.0.0", false);
    let created = Utc::now() - Duration::days(1);
    packages.add_version("p", "1.0.0", created);

    let sched = Scheduler::new(
        store.clone(),
        packages,
        Arc::new(FixedPopularityOracle::new()),
        SchedulerConfig::default(),
        "v1",
    );

    let updated = created + Duration::days(1);
    sched
        .trigger(Service::Analyzer, "p", Some("1.0.0"), Some(updated), false)
        .await
        .unwrap();
    let after_first = store.all();

    sched
        .trigger(Service::Analyzer, "p", Some("1.0.0"), Some(updated), false)
        .await
        .unwrap();
    let after_second = store.all();

    assert_eq!(after_first, after_second);
}

/// Scenario 2: lock then complete(success).
#[tokio::test]
async fn lock_then_complete_success() {
    let store = Arc::new(InMemoryDatastore::new());
    let sched = scheduler(store.clone());

    sched
        .create_or_update(Service::Analyzer, "p", "1.0.0", false, Utc::now(), true, None)
        .await
        .unwrap();

    let job = sched.lock_available(Service::Analyzer).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Processing);
    assert!(job.processing_key.is_some());

    let accepted = sched
        .complete(&job.id, job.processing_key.as_deref(), CompletionStatus::Success)
        .await
        .unwrap();
    assert!(accepted);

    let final_job = store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(final_job.state, JobState::Idle);
    assert_eq!(final_job.last_status, LastStatus::Success);
    assert_eq!(final_job.error_count, 0);
    let expected = Utc::now() + Duration::days(3);
    assert!((final_job.locked_until.unwrap() - expected).num_seconds().abs() < 5);
}

/// Scenario 3: a stolen lease still lets `complete(success)` through, but the
/// original worker's `processing_key` no longer matches the live job.
#[tokio::test]
async fn stolen_lease_success_still_recorded() {
    let store = Arc::new(InMemoryDatastore::new());
    let sched = scheduler(store.clone());

    sched
        .create_or_update(Service::Analyzer, "p", "1.0.0", false, Utc::now(), true, None)
        .await
        .unwrap();
    let worker_a_job = sched.lock_available(Service::Analyzer).await.unwrap().unwrap();

    // Admin re-triggers, clearing the processing key and returning the job to available.
    sched
        .create_or_update(Service::Analyzer, "p", "1.0.0", false, Utc::now(), true, None)
        .await
        .unwrap();

    let worker_b_job = sched.lock_available(Service::Analyzer).await.unwrap().unwrap();
    assert_ne!(worker_a_job.processing_key, worker_b_job.processing_key);

    let accepted = sched
        .complete(&worker_a_job.id, worker_a_job.processing_key.as_deref(), CompletionStatus::Success)
        .await
        .unwrap();
    assert!(accepted);

    let final_job = store.get_job(&worker_a_job.id).await.unwrap().unwrap();
    assert_eq!(final_job.last_status, LastStatus::Success);

    // Worker B's subsequent failed completion is fenced out: its key no
    // longer matches what's stored (worker A's success cleared it).
    let worker_b_accepted = sched
        .complete(&worker_b_job.id, worker_b_job.processing_key.as_deref(), CompletionStatus::Failed)
        .await
        .unwrap();
    assert!(!worker_b_accepted);
}

/// Scenario 4: stale lease recovery.
#[tokio::test]
async fn stale_lease_recovery() {
    let store = Arc::new(InMemoryDatastore::new());
    let sched = scheduler(store.clone());

    let job = pub_scheduler_testing::JobFixture::new("v1", Service::Analyzer, "p", "1.0.0")
        .state(JobState::Processing)
        .locked_until(Some(Utc::now() - Duration::minutes(1)))
        .processing_key(Some("k1"))
        .build();
    let id = job.id.clone();
    store.seed(job);

    let recovered = sched.unlock_stale_processing().await.unwrap();
    assert_eq!(recovered, 1);

    let after = store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(after.state, JobState::Idle);
    assert_eq!(after.last_status, LastStatus::Aborted);
    assert_eq!(after.error_count, 1);
    assert!(after.processing_key.is_none());
    let expected = Utc::now() + Duration::hours(12) + Duration::hours(1);
    assert!((after.locked_until.unwrap() - expected).num_seconds().abs() < 5);
}

/// Scenario 5: checkIdle false then true.
#[tokio::test]
async fn check_idle_false_then_true() {
    let store = Arc::new(InMemoryDatastore::new());
    let sched = scheduler(store.clone());

    let job = pub_scheduler_testing::JobFixture::new("v1", Service::Analyzer, "p", "1.0.0")
        .state(JobState::Idle)
        .locked_until(Some(Utc::now() - Duration::seconds(1)))
        .build();
    let id = job.id.clone();
    store.seed(job);

    let report = sched.check_idle(&FixedIdlePredicate(false)).await.unwrap();
    assert_eq!(report.extended, 1);
    assert_eq!(report.promoted, 0);

    let after_false = store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(after_false.state, JobState::Idle);
    let expected = Utc::now() + Duration::hours(12);
    assert!((after_false.locked_until.unwrap() - expected).num_seconds().abs() < 5);

    // Force the lease to have expired again so the second sweep picks it up.
    store.seed(
        pub_scheduler_testing::JobFixture::new("v1", Service::Analyzer, "p", "1.0.0")
            .state(JobState::Idle)
            .locked_until(Some(Utc::now() - Duration::seconds(1)))
            .build(),
    );

    let report2 = sched.check_idle(&FixedIdlePredicate(true)).await.unwrap();
    assert_eq!(report2.promoted, 1);

    let after_true = store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(after_true.state, JobState::Available);
    assert_eq!(after_true.locked_until, None);
    assert!(after_true.processing_key.is_none());
}

/// Promotion recomputes priority the same way every other write does (spec
/// §3); only the extend branch is exempt (spec §4.7).
#[tokio::test]
async fn check_idle_promotion_recomputes_priority() {
    let store = Arc::new(InMemoryDatastore::new());
    let popularity = Arc::new(FixedPopularityOracle::new());
    popularity.set("p", 0.9);
    let cfg = SchedulerConfig::default();
    let expected_priority = crate::job::compute_priority(0.9, &cfg);

    let sched = Scheduler::new(
        store.clone(),
        Arc::new(FakePackageStore::new()),
        popularity,
        cfg,
        "v1",
    );

    let job = pub_scheduler_testing::JobFixture::new("v1", Service::Analyzer, "p", "1.0.0")
        .state(JobState::Idle)
        .locked_until(Some(Utc::now() - Duration::seconds(1)))
        .priority(100)
        .build();
    let id = job.id.clone();
    store.seed(job);
    assert_ne!(expected_priority, 100);

    let report = sched.check_idle(&FixedIdlePredicate(true)).await.unwrap();
    assert_eq!(report.promoted, 1);

    let after = store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(after.state, JobState::Available);
    assert_eq!(after.priority, expected_priority);
}

/// `checkIdle`'s predicate failures are isolated per-job (spec §7).
#[tokio::test]
async fn check_idle_predicate_failure_is_isolated() {
    let store = Arc::new(InMemoryDatastore::new());
    let sched = scheduler(store.clone());

    let job = pub_scheduler_testing::JobFixture::new("v1", Service::Analyzer, "p", "1.0.0")
        .state(JobState::Idle)
        .locked_until(Some(Utc::now() - Duration::seconds(1)))
        .build();
    let id = job.id.clone();
    store.seed(job);

    let report = sched
        .check_idle(&pub_scheduler_testing::FailingIdlePredicate)
        .await
        .unwrap();
    assert_eq!(report.predicate_failures, 1);
    assert_eq!(report.promoted, 0);
    assert_eq!(report.extended, 0);

    // The job is untouched: no transition happened.
    let after = store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(after.state, JobState::Idle);
}

/// Query returning empty leaves `lockAvailable` returning `None` without mutation.
#[tokio::test]
async fn lock_available_on_empty_queue_returns_none() {
    let store = Arc::new(InMemoryDatastore::new());
    let sched = scheduler(store.clone());
    let result = sched.lock_available(Service::Analyzer).await.unwrap();
    assert!(result.is_none());
    assert!(store.is_empty());
}

/// `errorCount` beyond the cap clamps the hourly backoff bump.
#[tokio::test]
async fn backoff_clamps_error_count_bump() {
    let store = Arc::new(InMemoryDatastore::new());
    let sched = scheduler(store.clone());

    let job = pub_scheduler_testing::JobFixture::new("v1", Service::Analyzer, "p", "1.0.0")
        .state(JobState::Processing)
        .locked_until(Some(Utc::now() - Duration::minutes(1)))
        .processing_key(Some("k1"))
        .error_count(500)
        .build();
    let id = job.id.clone();
    store.seed(job);

    sched.unlock_stale_processing().await.unwrap();

    let after = store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(after.error_count, 501);
    // Chronic failure: long_extend base, bump clamped at 168 hours.
    let expected = Utc::now() + Duration::days(3) + Duration::hours(168);
    assert!((after.locked_until.unwrap() - expected).num_seconds().abs() < 5);
}

/// `deleteOldEntries` removes jobs whose `runtimeVersion` sorts before the
/// configured cutoff, leaving current-version jobs untouched.
#[tokio::test]
async fn delete_old_entries_garbage_collects_old_runtime_versions() {
    let store = Arc::new(InMemoryDatastore::new());
    let mut cfg = SchedulerConfig::default();
    cfg.gc_before_runtime_version = "v2".to_string();
    cfg.gc_batch_size = 1;

    let sched = Scheduler::new(
        store.clone(),
        Arc::new(FakePackageStore::new()),
        Arc::new(FixedPopularityOracle::new()),
        cfg,
        "v2",
    );

    store.seed(pub_scheduler_testing::JobFixture::new("v1", Service::Analyzer, "p1", "1.0.0").build());
    store.seed(pub_scheduler_testing::JobFixture::new("v1", Service::Analyzer, "p2", "1.0.0").build());
    store.seed(pub_scheduler_testing::JobFixture::new("v2", Service::Analyzer, "p3", "1.0.0").build());

    let deleted = sched.delete_old_entries().await.unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(store.len(), 1);
    assert_eq!(store.all()[0].runtime_version, "v2");
}

/// `fixPriority`'s "lower wins" override survives a `createOrUpdate` overwrite.
#[tokio::test]
async fn create_or_update_respects_fixed_priority_floor() {
    let store = Arc::new(InMemoryDatastore::new());
    let sched = scheduler(store.clone());

    sched
        .create_or_update(Service::Analyzer, "p", "1.0.0", false, Utc::now(), true, Some(5))
        .await
        .unwrap();
    let job = store.all().into_iter().next().unwrap();
    assert_eq!(job.priority, 5);

    // A later call with a looser fixed priority never regresses the floor:
    // `fix_priority` always takes `min(existing, fixed)`.
    sched
        .create_or_update(Service::Analyzer, "p", "1.0.0", false, Utc::now(), true, Some(50))
        .await
        .unwrap();
    let job_after = store.all().into_iter().next().unwrap();
    assert!(job_after.priority <= 50);
}
