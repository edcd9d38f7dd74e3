//! Error taxonomy (spec §7).
//!
//! Datastore calls report a narrow, matchable error so `retry_tx` can tell a
//! transient conflict from a fatal failure; everything above the datastore
//! seam collapses into `anyhow::Result` the way the teacher's `Effect::execute`
//! does.

use thiserror::Error;

/// Errors a `Datastore` implementation may report.
#[derive(Debug, Error)]
pub enum DatastoreError {
    /// Optimistic transaction lost a race; `retry_tx` retries on this.
    #[error("transaction conflict")]
    Conflict,

    /// Anything else: connection loss, constraint violation, decode failure.
    /// Retries are exhausted or inapplicable; surfaced to the caller.
    #[error("datastore error: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl DatastoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, DatastoreError::Conflict)
    }
}

/// Top-level scheduler errors, for the handful of call sites that need to
/// distinguish failure modes rather than just propagate via `anyhow::Result`.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    /// `retryTx` exhausted its attempt budget against repeated conflicts.
    #[error("transaction retry budget exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
}
