//! # pub-scheduler-core
//!
//! The job lifecycle state machine for a persistent, popularity-weighted
//! background scheduler. This crate is datastore-agnostic: it defines the
//! [`Job`](job::Job) entity, the priority function, the transaction-retry
//! harness, the five lifecycle operations, and the rolling statistics
//! aggregator. A concrete [`Datastore`](datastore::Datastore) implementation
//! (PostgreSQL via `pub-scheduler-postgres`, or an in-memory fake via
//! `pub-scheduler-testing`) supplies the actual storage.
//!
//! ## Why a state machine, not a queue
//!
//! A naive "pick oldest pending row" queue cannot express this system's
//! requirements: re-triggering on upstream data changes without duplicating
//! in-flight work, backing off jobs that fail repeatedly, and waking idle
//! jobs only when an external freshness predicate says so. [`Scheduler`]
//! encodes all of that as explicit transitions between [`JobState::Available`],
//! [`JobState::Processing`], and [`JobState::Idle`], each one fenced by a
//! re-read inside an optimistic transaction so concurrent workers can never
//! clobber each other's progress.
//!
//! ```text
//!            trigger(stale)        lockAvailable
//!    (∅) ──────────────────▶ available ─────────────▶ processing
//!           │  trigger(fresh)            │
//!           └──────────▶ idle            │  complete(success|failed|aborted)
//!                        ▲               ▼
//!                        └── idle ◀── (state=idle, backoff lockedUntil)
//!                        ▲   │
//!                        │   │ checkIdle: shouldProcess=true
//!                        │   ▼
//!                        │  available
//!                        │
//!                        │ checkIdle: shouldProcess=false  (extend lockedUntil)
//!                        │
//!                  unlockStaleProcessing (lease expired)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use pub_scheduler_core::{Scheduler, SchedulerConfig};
//! use pub_scheduler_core::job::{CompletionStatus, Service};
//! use std::sync::Arc;
//!
//! let scheduler = Scheduler::new(store, packages, popularity, SchedulerConfig::default(), "2024.07.01");
//!
//! // Upstream trigger: a package's latest version changed.
//! scheduler.trigger(Service::Analyzer, "some_package", None, Some(chrono::Utc::now()), false).await?;
//!
//! // Worker loop.
//! if let Some(job) = scheduler.lock_available(Service::Analyzer).await? {
//!     // ... do the work ...
//!     scheduler.complete(&job.id, job.processing_key.as_deref(), CompletionStatus::Success).await?;
//! }
//!
//! // Maintenance loops, driven by an external interval timer.
//! scheduler.unlock_stale_processing().await?;
//! scheduler.delete_old_entries().await?;
//! ```
//!
//! ## What this crate is not
//!
//! `pub-scheduler-core` is **not**:
//! - A queue with FIFO ordering or exactly-once delivery.
//! - A package metadata store, popularity oracle, or search index. Those
//!   are external collaborators, modeled here only as traits ([`collaborators`]).
//! - A CLI, a deployment, or anything that owns a `main` loop. Maintenance
//!   and worker loops are driven by the embedding application.

pub mod collaborators;
pub mod config;
pub mod datastore;
pub mod error;
pub mod job;
pub mod retry;
pub mod scheduler;
pub mod stats;

#[cfg(test)]
mod scheduler_tests;

// Re-export the collaborator traits callers must implement at the boundary.
pub use collaborators::{IdlePredicate, PackageRecord, PackageStore, PackageVersionRecord, PopularityOracle, ScoreCardClient};

// Re-export configuration.
pub use config::SchedulerConfig;

// Re-export the datastore abstraction.
pub use datastore::Datastore;

// Re-export error types.
pub use error::{DatastoreError, SchedulerError};

// Re-export the Job entity and its supporting types.
pub use job::{CompletionStatus, Job, JobId, JobState, LastStatus, Service};

// Re-export the retry harness.
pub use retry::retry_tx;

// Re-export the scheduler, the primary entry point.
pub use scheduler::{CheckIdleReport, Scheduler};

// Re-export statistics types.
pub use stats::{AllStats, BucketCounts, Eta, StatsAggregator, StatsReport};

// Re-export commonly used external types.
pub use async_trait::async_trait;
