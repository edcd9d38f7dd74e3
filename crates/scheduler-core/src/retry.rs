//! Transaction-retry harness (spec §4.1).
//!
//! Wraps a transactional call in bounded exponential backoff against
//! `DatastoreError::Conflict`; any other error propagates immediately.

use crate::config::SchedulerConfig;
use crate::error::DatastoreError;
use std::future::Future;

/// Retry `op` with exponential backoff capped at `cfg.tx_retry_cap`, giving up
/// after `cfg.tx_retry_max_attempts` conflicts.
pub async fn retry_tx<T, F, Fut>(cfg: &SchedulerConfig, mut op: F) -> Result<T, DatastoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DatastoreError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_conflict() => {
                attempt += 1;
                if attempt >= cfg.tx_retry_max_attempts {
                    tracing::warn!(attempt, "retry_tx giving up after repeated conflicts");
                    return Err(e);
                }
                let backoff = backoff_for(attempt, cfg);
                tracing::debug!(attempt, ?backoff, "retry_tx backing off after conflict");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn backoff_for(attempt: u32, cfg: &SchedulerConfig) -> std::time::Duration {
    let cap_ms = cfg.tx_retry_cap.num_milliseconds().max(1) as u64;
    let raw_ms = 10u64.saturating_mul(1u64 << attempt.min(20));
    std::time::Duration::from_millis(raw_ms.min(cap_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let cfg = SchedulerConfig::default();
        let attempts = AtomicU32::new(0);
        let result = retry_tx(&cfg, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(DatastoreError::Conflict)
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_propagate_immediately() {
        let cfg = SchedulerConfig::default();
        let attempts = AtomicU32::new(0);
        let result: Result<(), DatastoreError> = retry_tx(&cfg, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(DatastoreError::Fatal(anyhow::anyhow!("boom"))) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let mut cfg = SchedulerConfig::default();
        cfg.tx_retry_max_attempts = 3;
        let attempts = AtomicU32::new(0);
        let result: Result<(), DatastoreError> = retry_tx(&cfg, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(DatastoreError::Conflict) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
