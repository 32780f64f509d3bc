//! Storage abstraction for scan persistence.
//!
//! Defines the [`ScanStore`] contract implemented by both backends, the
//! closed set of known backends, and the factory that picks one from
//! configuration. This module is the only place backend choice is decided.

pub mod neo4j;
pub mod normalize;
pub mod postgres;
pub mod record;

use crate::config::StorageSettings;
use crate::error::{StoreError, StoreResult};
use crate::types::{ScanId, ScanState, SiteId};
use async_trait::async_trait;
use record::{GradeCount, HistoryEntry, ScanOutcome, ScanRecord, TestResultRecord};
use std::fmt;
use std::str::FromStr;

/// The closed set of storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Tabular engine (PostgreSQL).
    Relational,
    /// Node/relationship engine (Neo4j).
    Graph,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relational => write!(f, "relational"),
            Self::Graph => write!(f, "graph"),
        }
    }
}

impl FromStr for Backend {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relational" => Ok(Self::Relational),
            "graph" => Ok(Self::Graph),
            other => Err(StoreError::Configuration(format!(
                "unknown storage backend: {other:?} (expected \"relational\" or \"graph\")"
            ))),
        }
    }
}

/// The shared storage contract, implemented identically in spirit by both
/// backends.
///
/// Every method may suspend on network I/O. No ordering is guaranteed across
/// different scans or sites; within one scan's terminal transition, test
/// results are fully written before the scan's terminal state becomes
/// visible. This layer adds no retries and no locking of its own — it relies
/// on the engine's native transactional guarantees.
#[async_trait]
pub trait ScanStore: Send + Sync {
    /// Which backend this store talks to.
    fn backend(&self) -> Backend;

    /// Return the site id for a domain, creating the site if absent.
    ///
    /// Concurrency-safe through the engine's uniqueness constraint on the
    /// domain: the loser of a create race gets a retryable
    /// [`StoreError::ConstraintViolation`] and re-reads.
    async fn ensure_site(&self, domain: &str) -> StoreResult<SiteId>;

    /// Create a new scan in RUNNING state with zero counts and the current
    /// timestamp. Fails with [`StoreError::NotFound`] if the site does not
    /// exist.
    async fn insert_scan(&self, site_id: SiteId) -> StoreResult<ScanRecord>;

    /// The terminal transition: create one test result per entry in the
    /// outcome, then set the scan's terminal fields — FINISHED when the
    /// outcome carries a score, FAILED otherwise.
    ///
    /// The test-result writes always precede the terminal scan update, so a
    /// crash mid-operation leaves the scan visibly stuck in RUNNING
    /// (detectable and retryable) rather than FINISHED with missing results.
    async fn insert_test_results(
        &self,
        site_id: SiteId,
        scan_id: ScanId,
        outcome: &ScanOutcome,
    ) -> StoreResult<ScanRecord>;

    /// Fetch a scan in any state, or `None` if absent.
    async fn select_scan(&self, scan_id: ScanId) -> StoreResult<Option<ScanRecord>>;

    /// Fetch a scan only if it is FINISHED, or `None`. Used for user-facing
    /// retrieval so partial results never leak.
    async fn select_finished_scan(&self, scan_id: ScanId) -> StoreResult<Option<ScanRecord>>;

    /// The most recent FINISHED scan for a site started within
    /// `window_secs` of now, or `None`. Backs the write-cooldown cache.
    async fn select_recent_scan(
        &self,
        site_id: SiteId,
        window_secs: i64,
    ) -> StoreResult<Option<ScanRecord>>;

    /// Same as [`ScanStore::select_recent_scan`] but keyed by domain name,
    /// for read-cache lookups.
    async fn select_latest_scan_by_host(
        &self,
        host: &str,
        max_age_secs: i64,
    ) -> StoreResult<Option<ScanRecord>>;

    /// Chronological score history for a site, change-point compressed:
    /// adjacent FINISHED scans with an equal score collapse to the first,
    /// and the earliest scan is always included.
    async fn select_scan_host_history(&self, site_id: SiteId) -> StoreResult<Vec<HistoryEntry>>;

    /// Force a scan into ABORTED or FAILED outside the normal terminal path
    /// (external timeout or cancellation), recording the end time. Forcing
    /// FAILED requires an error message; a FAILED scan always carries one.
    async fn update_scan_state(
        &self,
        scan_id: ScanId,
        state: ScanState,
        error: Option<&str>,
    ) -> StoreResult<ScanRecord>;

    /// All test results for a scan, ordered by check name.
    async fn select_test_results(&self, scan_id: ScanId) -> StoreResult<Vec<TestResultRecord>>;

    /// Counts of FINISHED scans per grade, ordered by the fixed best-to-worst
    /// ranking.
    async fn select_grade_distribution(&self) -> StoreResult<Vec<GradeCount>>;

    /// Recompute any precomputed aggregate behind
    /// [`ScanStore::select_grade_distribution`]. A no-op for a backend that
    /// computes the aggregate on demand.
    async fn refresh_materialized_views(&self) -> StoreResult<()>;

    /// Idempotently (re)apply schema constraints and indexes. Safe to call
    /// on an already-initialized store; expected "already exists" conditions
    /// are logged and ignored.
    async fn migrate(&self) -> StoreResult<()>;

    /// Release all held connections. Calling other operations afterwards is
    /// caller error.
    async fn close(&self) -> StoreResult<()>;
}

/// A boxed store for dynamic dispatch.
pub type BoxedStore = Box<dyn ScanStore>;

/// Select a backend from configuration and establish its connection pool.
///
/// This is the single `createPool` step of the process lifetime: calling it
/// twice creates two independent pools, which is the caller's to track.
/// An unrecognized backend name fails with [`StoreError::Configuration`]
/// before any connection is attempted.
pub async fn connect(settings: &StorageSettings) -> StoreResult<BoxedStore> {
    let backend: Backend = settings.backend.parse()?;
    tracing::info!(%backend, "connecting scan store");

    match backend {
        Backend::Relational => {
            let store = postgres::PgStore::connect(&settings.relational).await?;
            Ok(Box::new(store))
        }
        Backend::Graph => {
            let store = neo4j::GraphStore::connect(&settings.graph).await?;
            Ok(Box::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("relational".parse::<Backend>().unwrap(), Backend::Relational);
        assert_eq!("graph".parse::<Backend>().unwrap(), Backend::Graph);
    }

    #[test]
    fn test_unknown_backend_is_configuration_error() {
        let err = "mongodb".parse::<Backend>().unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_backend_display_roundtrip() {
        for backend in [Backend::Relational, Backend::Graph] {
            let parsed: Backend = backend.to_string().parse().unwrap();
            assert_eq!(parsed, backend);
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_backend_before_dialing() {
        let settings = StorageSettings {
            backend: "tabular".to_string(),
            ..Default::default()
        };
        match connect(&settings).await {
            Err(StoreError::Configuration(_)) => {}
            Err(other) => panic!("expected a configuration error, got: {other}"),
            Ok(_) => panic!("connect accepted an unknown backend"),
        }
    }
}
