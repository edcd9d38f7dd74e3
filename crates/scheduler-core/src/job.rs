//! The `Job` entity: the sole persistent record of the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of background work a job performs.
///
/// Closed over the services this deployment actually runs; new services are
/// added here rather than carried as an open string, so a typo in a caller
/// can't silently create an orphaned partition of the job table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Analyzer,
    Dartdoc,
    Reindex,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Analyzer => "analyzer",
            Service::Dartdoc => "dartdoc",
            Service::Reindex => "reindex",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Service {
    type Err = ParseServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyzer" => Ok(Service::Analyzer),
            "dartdoc" => Ok(Service::Dartdoc),
            "reindex" => Ok(Service::Reindex),
            other => Err(ParseServiceError(other.to_owned())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0} is not a known Service")]
pub struct ParseServiceError(pub String);

/// Lifecycle state of a job. See spec §4.4 for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Available,
    Processing,
    Idle,
}

/// Outcome of the most recent terminal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastStatus {
    None,
    Success,
    Failed,
    Aborted,
}

/// Status reported by a worker to `complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Failed,
    Aborted,
}

impl CompletionStatus {
    fn is_error(self) -> bool {
        !matches!(self, CompletionStatus::Success)
    }

    fn into_last_status(self) -> LastStatus {
        match self {
            CompletionStatus::Success => LastStatus::Success,
            CompletionStatus::Failed => LastStatus::Failed,
            CompletionStatus::Aborted => LastStatus::Aborted,
        }
    }
}

/// Derived, URI-structured job id: `runtimeVersion/service/package/version`.
///
/// Uniqueness invariant: two jobs with the same tuple are the same row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new(runtime_version: &str, service: Service, package: &str, version: &str) -> Self {
        JobId(format!("{runtime_version}/{service}/{package}/{version}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an already-derived id string read back from storage, without
    /// re-deriving it from its parts. Used where a datastore query returns
    /// only the `id` column (e.g. garbage-collection candidate scans).
    pub fn from_raw(id: String) -> Self {
        JobId(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The persistent record backing the lifecycle state machine (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub runtime_version: String,
    pub service: Service,
    pub package_name: String,
    pub package_version: String,
    pub is_latest_stable: bool,
    pub package_version_updated: DateTime<Utc>,
    pub state: JobState,
    pub locked_until: Option<DateTime<Utc>>,
    pub processing_key: Option<String>,
    pub last_status: LastStatus,
    pub error_count: u32,
    pub priority: i32,
}

impl Job {
    /// Construct a brand-new job for `createOrUpdate`'s "absent" branch.
    ///
    /// `should_process` selects between entering `available` (stale work)
    /// or `idle` (freshly current, cooling down for `short_extend`).
    pub fn new(
        runtime_version: String,
        service: Service,
        package_name: String,
        package_version: String,
        is_latest_stable: bool,
        package_version_updated: DateTime<Utc>,
        should_process: bool,
        now: DateTime<Utc>,
        short_extend: chrono::Duration,
    ) -> Self {
        let id = JobId::new(&runtime_version, service, &package_name, &package_version);
        Job {
            id,
            runtime_version,
            service,
            package_name,
            package_version,
            is_latest_stable,
            package_version_updated,
            state: if should_process {
                JobState::Available
            } else {
                JobState::Idle
            },
            locked_until: if should_process {
                None
            } else {
                Some(now + short_extend)
            },
            processing_key: None,
            last_status: LastStatus::None,
            error_count: 0,
            priority: 0,
        }
    }

    /// Apply a completion report (`complete`, spec §4.8).
    ///
    /// Caller is responsible for the `processingKey`/`status=success` fence
    /// check (spec §4.8 step 2) before calling this.
    pub fn apply_completion(
        &mut self,
        status: CompletionStatus,
        now: DateTime<Utc>,
        cfg: &crate::config::SchedulerConfig,
    ) {
        self.error_count = if status.is_error() {
            self.error_count.saturating_add(1)
        } else {
            0
        };
        self.state = JobState::Idle;
        self.last_status = status.into_last_status();
        self.processing_key = None;
        self.locked_until = Some(extend_lock(self.error_count, now, cfg));
    }

    /// Override the stored priority with a caller-provided value: lower wins.
    pub fn fix_priority(&mut self, fixed: i32) {
        self.priority = self.priority.min(fixed);
    }
}

/// `priority ← round(basePriority − α·popularity)` (spec §3).
pub fn compute_priority(popularity: f64, cfg: &crate::config::SchedulerConfig) -> i32 {
    let raw = cfg.base_priority as f64 - cfg.popularity_weight * popularity;
    raw.round() as i32
}

/// `extendLock(errorCount) = now + baseExtend + min(errorCount, 168) hours` (spec §4.9).
///
/// `baseExtend` is `long_extend` when healthy (`errorCount = 0`) or chronically
/// failing (`errorCount > chronic_error_threshold`), otherwise `short_extend`.
pub fn extend_lock(
    error_count: u32,
    now: DateTime<Utc>,
    cfg: &crate::config::SchedulerConfig,
) -> DateTime<Utc> {
    let base = if error_count == 0 || error_count > cfg.chronic_error_threshold {
        cfg.long_extend
    } else {
        cfg.short_extend
    };
    let bump = chrono::Duration::hours(error_count.min(cfg.error_count_cap) as i64);
    now + base + bump
}
