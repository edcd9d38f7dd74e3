//! External collaborators (spec §6), modeled as traits only. No concrete
//! implementation ships here; the package metadata store, popularity oracle,
//! score-card backend, and search service are out of scope per spec §1.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// `getPackage(name) -> {latestVersion, isNotVisible} | None`.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageRecord {
    pub latest_version: String,
    pub is_not_visible: bool,
}

/// `getPackageVersion(name, version) -> {created} | None`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackageVersionRecord {
    pub created: DateTime<Utc>,
}

#[async_trait]
pub trait PackageStore: Send + Sync {
    async fn get_package(&self, name: &str) -> anyhow::Result<Option<PackageRecord>>;

    async fn get_package_version(
        &self,
        name: &str,
        version: &str,
    ) -> anyhow::Result<Option<PackageVersionRecord>>;
}

/// `popularity(name) -> float in [0,1]`. Never throws; missing maps to 0.
#[async_trait]
pub trait PopularityOracle: Send + Sync {
    async fn popularity(&self, package_name: &str) -> f64;
}

/// `shouldProcess(package, version, updated) -> bool` (spec §4.7), the
/// predicate injected into `checkIdle`. May perform I/O and may fail; a
/// failure is caught per-job by the caller (spec §7) and treated as "not yet".
#[async_trait]
pub trait IdlePredicate: Send + Sync {
    async fn should_process(
        &self,
        package_name: &str,
        package_version: &str,
        package_version_updated: DateTime<Utc>,
    ) -> anyhow::Result<bool>;
}

/// `updateScoreCard(package, version)`, invoked by reindex triggers outside
/// the core (spec §6); kept here only as the seam a `Reindex`-service
/// completion would call into, not as a thing this crate drives itself.
#[async_trait]
pub trait ScoreCardClient: Send + Sync {
    async fn update_score_card(&self, package_name: &str, package_version: &str) -> anyhow::Result<()>;
}
