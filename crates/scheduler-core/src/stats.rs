//! Statistics aggregator (spec §4.11): a rolling per-service snapshot over
//! the job table, bucketed `all` / `latest` / `last90`, plus an ETA derived
//! from consecutive snapshots.
//!
//! The per-service ring is the one piece of in-process mutable shared state
//! the core owns (spec §5, §9); it is guarded the way the teacher guards its
//! own shared maps: a `DashMap` keyed by service, each entry behind a
//! `tokio::sync::Mutex` so concurrent `stats` calls for different services
//! never contend and calls for the same service serialize cleanly.

use crate::job::{Job, JobState, LastStatus, Service};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// Counts bucketed by lifecycle state and by last-completion status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCounts {
    pub total: u64,
    pub available: u64,
    pub processing: u64,
    pub idle: u64,
    pub status_none: u64,
    pub status_success: u64,
    pub status_failed: u64,
    pub status_aborted: u64,
}

impl BucketCounts {
    fn add(&mut self, job: &Job) {
        self.total += 1;
        match job.state {
            JobState::Available => self.available += 1,
            JobState::Processing => self.processing += 1,
            JobState::Idle => self.idle += 1,
        }
        match job.last_status {
            LastStatus::None => self.status_none += 1,
            LastStatus::Success => self.status_success += 1,
            LastStatus::Failed => self.status_failed += 1,
            LastStatus::Aborted => self.status_aborted += 1,
        }
    }
}

/// One snapshot of `_AllStats` (spec §3, §4.11) for a single service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllStats {
    pub taken_at: DateTime<Utc>,
    pub all: BucketCounts,
    pub latest: BucketCounts,
    pub last90: BucketCounts,
    pub last90_failing_packages: HashSet<String>,
}

/// Scan every job for `service` at `runtime_version` and bucket it.
pub fn snapshot(jobs: &[Job], now: DateTime<Utc>) -> AllStats {
    let mut all = BucketCounts::default();
    let mut latest = BucketCounts::default();
    let mut last90 = BucketCounts::default();
    let mut last90_failing_packages = HashSet::new();
    let ninety_days_ago = now - Duration::days(90);

    for job in jobs {
        all.add(job);
        if job.is_latest_stable {
            latest.add(job);
        }
        if job.package_version_updated >= ninety_days_ago {
            last90.add(job);
            if matches!(job.last_status, LastStatus::Failed | LastStatus::Aborted) {
                last90_failing_packages.insert(job.package_name.clone());
            }
        }
    }

    AllStats {
        taken_at: now,
        all,
        latest,
        last90,
        last90_failing_packages,
    }
}

/// ETA derived from two consecutive snapshots (spec §4.11, §8 scenario 6).
#[derive(Debug, Clone, PartialEq)]
pub enum Eta {
    /// `doneCount < 0`: the available count grew since the last snapshot.
    Increasing,
    /// `doneCount == 0`: no jobs drained between snapshots.
    NoChange,
    /// `doneCount > 0`: a completion rate and a human-readable remaining time.
    Remaining {
        jobs_per_minute: f64,
        remaining: Duration,
    },
}

impl Eta {
    pub fn describe(&self) -> String {
        match self {
            Eta::Increasing => "increasing".to_string(),
            Eta::NoChange => "no change".to_string(),
            Eta::Remaining {
                jobs_per_minute,
                remaining,
            } => format!(
                "{jobs_per_minute:.2} jobs/min, ~{} remaining",
                format_duration(*remaining)
            ),
        }
    }
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.num_seconds().max(0);
    if total_secs < 60 {
        format!("{total_secs}s")
    } else if total_secs < 3600 {
        format!("{}m", total_secs / 60)
    } else {
        format!("{}h{}m", total_secs / 3600, (total_secs % 3600) / 60)
    }
}

/// Compute the ETA between `prev` and `current` (spec §4.11).
pub fn eta(prev: &AllStats, current: &AllStats) -> Eta {
    let done_count = prev.all.available as i64 - current.all.available as i64;
    if done_count < 0 {
        return Eta::Increasing;
    }
    if done_count == 0 {
        return Eta::NoChange;
    }
    let elapsed_secs = (current.taken_at - prev.taken_at).num_seconds().max(1) as f64;
    let jobs_per_minute = 60.0 * done_count as f64 / elapsed_secs;
    let time_per_job_secs = elapsed_secs / done_count as f64;
    let remaining = Duration::seconds((time_per_job_secs * current.all.available as f64).round() as i64);
    Eta::Remaining {
        jobs_per_minute,
        remaining,
    }
}

/// Snapshot report returned to callers: the snapshot itself plus the ETA
/// relative to the previous one, if any exists yet.
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub snapshot: AllStats,
    pub eta: Option<Eta>,
}

/// Per-service history of the last ~90 minutes of snapshots (spec §9, glossary).
#[derive(Default)]
pub struct StatsRing {
    window: Duration,
    snapshots: VecDeque<AllStats>,
}

impl StatsRing {
    pub fn new(window: Duration) -> Self {
        StatsRing {
            window,
            snapshots: VecDeque::new(),
        }
    }

    /// Record `new_snapshot`, evict anything older than the window, and
    /// return the ETA relative to the snapshot immediately prior.
    pub fn push(&mut self, new_snapshot: AllStats) -> Option<Eta> {
        let prev_eta = self.snapshots.back().map(|prev| self::eta(prev, &new_snapshot));
        let cutoff = new_snapshot.taken_at - self.window;
        self.snapshots.push_back(new_snapshot);
        while matches!(self.snapshots.front(), Some(s) if s.taken_at < cutoff) {
            self.snapshots.pop_front();
        }
        prev_eta
    }
}

/// Guards one `StatsRing` per service behind its own async mutex, keyed in a
/// `DashMap` so unrelated services never block each other.
pub struct StatsAggregator {
    rings: dashmap::DashMap<Service, tokio::sync::Mutex<StatsRing>>,
    window: Duration,
}

impl StatsAggregator {
    pub fn new(window: Duration) -> Self {
        StatsAggregator {
            rings: dashmap::DashMap::new(),
            window,
        }
    }

    pub async fn record(&self, service: Service, snapshot: AllStats) -> StatsReport {
        let ring = self
            .rings
            .entry(service)
            .or_insert_with(|| tokio::sync::Mutex::new(StatsRing::new(self.window)));
        let mut guard = ring.value().lock().await;
        let eta = guard.push(snapshot.clone());
        StatsReport { snapshot, eta }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        // Spec §9/glossary: "the last 60-90 minutes" of history.
        StatsAggregator::new(Duration::minutes(90))
    }
}
