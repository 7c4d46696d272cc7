//! Storage interfaces consumed by the probe engine and the analyzer.
//!
//! The engine and analyzer never see a concrete database; they are handed
//! these traits. [`super::Store`] implements both over SQLite.

use std::collections::BTreeMap;

use super::models::*;
use super::store::StoreError;

/// Read-only view of the configured services.
pub trait ServiceRegistry: Send + Sync {
    /// All services with `enabled = true`, ordered by id.
    fn list_enabled(&self) -> Result<Vec<Service>, StoreError>;

    fn get(&self, id: i64) -> Result<Service, StoreError>;
}

/// Append-only sink for probe results and digests.
///
/// Every append is a single atomic row write. Readers only ever observe
/// fully written rows.
pub trait ResultStore: Send + Sync {
    /// Append one probe result. `checked_at` is moved forward if needed so
    /// results of one service have strictly increasing timestamps.
    fn append_result(&self, result: NewProbeResult) -> Result<ProbeResult, StoreError>;

    fn append_digest(&self, digest: NewDigest) -> Result<Digest, StoreError>;

    /// Results matching `filter`, newest first.
    fn list_results(&self, filter: &ResultFilter) -> Result<Vec<ProbeResult>, StoreError>;

    fn latest_result_per_service(&self) -> Result<BTreeMap<i64, ProbeResult>, StoreError>;

    /// Most recent digest of one service, or the most recent system-wide
    /// digest when `service_id` is `None`.
    fn latest_digest(&self, service_id: Option<i64>) -> Result<Option<Digest>, StoreError>;
}
