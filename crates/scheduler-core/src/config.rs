//! Tunables for the scheduler, with defaults matching spec.md's literal constants.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// (De)serializes `chrono::Duration` as whole seconds; chrono does not derive
/// serde impls for `Duration` itself, only for `DateTime`.
mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.num_seconds().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(d)?;
        Ok(Duration::seconds(secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Lease length granted by `lockAvailable` (spec §4.5): 1 hour.
    #[serde(with = "duration_secs")]
    pub default_lock: Duration,
    /// Cooldown after a healthy completion or stale-lease recovery baseline: 12 hours.
    #[serde(with = "duration_secs")]
    pub short_extend: Duration,
    /// Cooldown for success or chronic failure: 3 days.
    #[serde(with = "duration_secs")]
    pub long_extend: Duration,
    /// `errorCount` above which a job is "chronically broken" (spec §4.9).
    pub chronic_error_threshold: u32,
    /// Clamp on the hourly backoff bump (spec §4.9, §8).
    pub error_count_cap: u32,
    /// Base term of the priority function before the popularity term.
    pub base_priority: i32,
    /// α in `priority ← round(basePriority − α·popularity)`.
    pub popularity_weight: f64,
    /// Jobs whose `runtimeVersion` sorts before this are GC-eligible.
    pub gc_before_runtime_version: String,
    /// Batch size for `deleteOldEntries` (spec §4.10).
    pub gc_batch_size: usize,
    /// Candidate pool size for `lockAvailable`'s query (spec §4.5 step 1).
    pub pickup_query_limit: usize,
    /// Draws below this favor the first index directly (spec §4.5 step 4, §9).
    pub pickup_bias_threshold: usize,
    /// Cap on `retryTx`'s exponential backoff (spec §4.1).
    #[serde(with = "duration_secs")]
    pub tx_retry_cap: Duration,
    /// Cap on the number of `retryTx` attempts before giving up.
    pub tx_retry_max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            default_lock: Duration::hours(1),
            short_extend: Duration::hours(12),
            long_extend: Duration::days(3),
            chronic_error_threshold: 3,
            error_count_cap: 168,
            base_priority: 100,
            popularity_weight: 100.0,
            gc_before_runtime_version: String::new(),
            gc_batch_size: 20,
            pickup_query_limit: 100,
            pickup_bias_threshold: 20,
            tx_retry_cap: Duration::seconds(2),
            tx_retry_max_attempts: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.default_lock, Duration::hours(1));
        assert_eq!(cfg.short_extend, Duration::hours(12));
        assert_eq!(cfg.long_extend, Duration::days(3));
        assert_eq!(cfg.error_count_cap, 168);
        assert_eq!(cfg.pickup_query_limit, 100);
        assert_eq!(cfg.pickup_bias_threshold, 20);
    }
}
