//! Graph storage adapter backed by Neo4j over Bolt.
//!
//! Ownership is modeled as relationships: `(Site)-[:HAS_SCAN]->(Scan)` and
//! `(Scan)-[:HAS_RESULT]->(TestResult)`. Timestamps are stored as the
//! engine's millisecond counters and converted to instants at this boundary.
//! Every logical operation acquires its own connection from the driver pool;
//! no session object is shared across concurrent calls.
//!
//! The terminal transition is two independent writes, test results strictly
//! first. Unlike the relational path there is no multi-statement atomicity:
//! a crash between the writes leaves the scan visibly RUNNING, which is the
//! documented weaker guarantee of this backend.

use crate::config::GraphSettings;
use crate::error::{StoreError, StoreResult};
use crate::lifecycle;
use crate::storage::normalize;
use crate::storage::record::{
    GradeCount, HistoryEntry, ScanOutcome, ScanRecord, TestResultRecord, ALGORITHM_VERSION,
};
use crate::storage::{Backend, ScanStore};
use crate::types::{ScanId, ScanState, SiteId};
use async_trait::async_trait;
use neo4rs::{query, ConfigBuilder, Graph, Node, Query};

/// Idempotent constraint and index statements (`IF NOT EXISTS` syntax).
const SCHEMA: &[&str] = &[
    "CREATE CONSTRAINT site_domain_unique IF NOT EXISTS \
     FOR (site:Site) REQUIRE site.domain IS UNIQUE",
    "CREATE INDEX scan_state_idx IF NOT EXISTS FOR (scan:Scan) ON (scan.state)",
    "CREATE INDEX test_name_idx IF NOT EXISTS FOR (test:TestResult) ON (test.name)",
];

const MATCH_SCAN: &str = "MATCH (site:Site)-[:HAS_SCAN]->(scan:Scan)";

/// Neo4j-backed scan store.
pub struct GraphStore {
    graph: Graph,
}

impl GraphStore {
    /// Establish the driver pool. One pool per process lifetime; calling
    /// this twice creates two independent pools.
    pub async fn connect(settings: &GraphSettings) -> StoreResult<Self> {
        let config = ConfigBuilder::default()
            .uri(&settings.uri)
            .user(&settings.username)
            .password(&settings.password)
            .db(settings.database.as_str())
            .max_connections(settings.max_connections as usize)
            .build()
            .map_err(|e| StoreError::Configuration(e.to_string()))?;

        let graph = Graph::connect(config)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        tracing::debug!(
            uri = %settings.uri,
            database = %settings.database,
            max_connections = settings.max_connections,
            "graph driver pool established"
        );
        Ok(Self { graph })
    }

    /// Run a query expected to return at most one scan row and normalize it.
    async fn fetch_scan(&self, q: Query) -> StoreResult<Option<ScanRecord>> {
        let mut stream = self.graph.execute(q).await?;
        match stream.next().await? {
            Some(row) => {
                let node: Node = row.get("scan").map_err(|e| row_error("scan", e))?;
                let site_id: i64 = row.get("site_id").map_err(|e| row_error("site_id", e))?;
                Ok(Some(normalize::scan_from_node(&node, site_id)?))
            }
            None => Ok(None),
        }
    }

    async fn current_scan_state(&self, site_id: SiteId, scan_id: ScanId) -> StoreResult<ScanState> {
        let q = query(&format!(
            "{MATCH_SCAN} WHERE id(site) = $site_id AND id(scan) = $scan_id \
             RETURN scan.state AS state"
        ))
        .param("site_id", site_id.raw())
        .param("scan_id", scan_id.raw());

        let mut stream = self.graph.execute(q).await?;
        let row = stream
            .next()
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("scan {scan_id} for site {site_id}")))?;
        let state: String = row.get("state").map_err(|e| row_error("state", e))?;
        state
            .parse()
            .map_err(|e: crate::types::StateError| StoreError::Serialization(e.to_string()))
    }
}

/// A result column the query guarantees but the row cannot decode.
fn row_error(key: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization(format!("row value {key}: {err}"))
}

/// Whether a driver error is the server rejecting a duplicate under a
/// uniqueness constraint. The driver surfaces server failures as text, so
/// classification goes by the server's failure wording.
fn is_constraint_violation(err: &neo4rs::Error) -> bool {
    constraint_violation_text(&format!("{err:?}"))
}

fn constraint_violation_text(text: &str) -> bool {
    text.contains("ConstraintValidation") || text.contains("already exists with")
}

/// Whether a schema statement failed because an equivalent rule already
/// exists. Expected during a re-run of `migrate`; logged and ignored there.
fn is_already_exists(err: &neo4rs::Error) -> bool {
    already_exists_text(&format!("{err:?}"))
}

fn already_exists_text(text: &str) -> bool {
    text.contains("EquivalentSchemaRule") || text.contains("already exists")
}

#[async_trait]
impl ScanStore for GraphStore {
    fn backend(&self) -> Backend {
        Backend::Graph
    }

    async fn ensure_site(&self, domain: &str) -> StoreResult<SiteId> {
        if domain.is_empty() {
            return Err(StoreError::Validation("empty domain".to_string()));
        }

        let existing = query("MATCH (site:Site {domain: $domain}) RETURN id(site) AS id")
            .param("domain", domain.to_string());
        let mut stream = self.graph.execute(existing).await?;
        if let Some(row) = stream.next().await? {
            let id: i64 = row.get("id").map_err(|e| row_error("id", e))?;
            return Ok(SiteId::new(id));
        }

        let create = query(
            "CREATE (site:Site {domain: $domain, creation_time: timestamp()}) \
             RETURN id(site) AS id",
        )
        .param("domain", domain.to_string());
        let mut stream = match self.graph.execute(create).await {
            Ok(stream) => stream,
            Err(e) if is_constraint_violation(&e) => {
                return Err(StoreError::ConstraintViolation(format!(
                    "site {domain} was created concurrently"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let row = match stream.next().await {
            Ok(Some(row)) => row,
            Ok(None) => {
                return Err(StoreError::Serialization(
                    "create returned no row".to_string(),
                ))
            }
            Err(e) if is_constraint_violation(&e) => {
                return Err(StoreError::ConstraintViolation(format!(
                    "site {domain} was created concurrently"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let id: i64 = row.get("id").map_err(|e| row_error("id", e))?;
        Ok(SiteId::new(id))
    }

    async fn insert_scan(&self, site_id: SiteId) -> StoreResult<ScanRecord> {
        let q = query(
            "MATCH (site:Site) WHERE id(site) = $site_id \
             CREATE (site)-[:HAS_SCAN]->(scan:Scan { \
                 state: $state, start_time: timestamp(), \
                 tests_failed: 0, tests_passed: 0, tests_quantity: 0, \
                 algorithm_version: $version \
             }) \
             RETURN scan, id(site) AS site_id",
        )
        .param("site_id", site_id.raw())
        .param("state", ScanState::Running.as_str().to_string())
        .param("version", ALGORITHM_VERSION as i64);

        self.fetch_scan(q)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("site {site_id}")))
    }

    async fn insert_test_results(
        &self,
        site_id: SiteId,
        scan_id: ScanId,
        outcome: &ScanOutcome,
    ) -> StoreResult<ScanRecord> {
        lifecycle::validate_outcome(outcome)?;
        let terminal = lifecycle::terminal_state_for(outcome);
        let current = self.current_scan_state(site_id, scan_id).await?;
        lifecycle::check_transition(current, terminal)?;

        // First write: all test results. The scan stays RUNNING until every
        // result node exists, so an interrupted operation is detectable.
        for (name, test) in &outcome.results {
            let output = serde_json::to_string(&normalize::tag_blob(test.output.clone()))?;
            let q = query(
                "MATCH (scan:Scan) WHERE id(scan) = $scan_id \
                 CREATE (scan)-[:HAS_RESULT]->(test:TestResult { \
                     name: $name, expectation: $expectation, result: $result, \
                     pass: $pass, output: $output, score_modifier: $score_modifier \
                 })",
            )
            .param("scan_id", scan_id.raw())
            .param("name", name.to_string())
            .param("expectation", test.expectation.clone())
            .param("result", test.result.clone())
            .param("pass", test.pass)
            .param("output", output)
            .param("score_modifier", test.score_modifier as i64);
            self.graph.run(q).await?;
        }

        // Second write: the terminal state update, last. Optional fields are
        // spliced into the SET clause only when present so no null
        // properties are written.
        let mut set_clauses = vec![
            "scan.state = $state",
            "scan.end_time = timestamp()",
            "scan.tests_passed = $tests_passed",
            "scan.tests_failed = $tests_failed",
            "scan.tests_quantity = $tests_quantity",
            "scan.response_headers = $response_headers",
        ];
        if outcome.grade.is_some() {
            set_clauses.push("scan.grade = $grade");
        }
        if outcome.score.is_some() {
            set_clauses.push("scan.score = $score");
        }
        if outcome.error.is_some() {
            set_clauses.push("scan.error = $error");
        }
        if outcome.status_code.is_some() {
            set_clauses.push("scan.status_code = $status_code");
        }

        let text = format!(
            "{MATCH_SCAN} WHERE id(site) = $site_id AND id(scan) = $scan_id \
             SET {} RETURN scan, id(site) AS site_id",
            set_clauses.join(", ")
        );
        let headers = serde_json::to_string(&normalize::tag_blob(outcome.response_headers.clone()))?;
        let mut q = query(&text)
            .param("site_id", site_id.raw())
            .param("scan_id", scan_id.raw())
            .param("state", terminal.as_str().to_string())
            .param("tests_passed", outcome.tests_passed as i64)
            .param("tests_failed", outcome.tests_failed as i64)
            .param("tests_quantity", outcome.tests_quantity as i64)
            .param("response_headers", headers);
        if let Some(grade) = &outcome.grade {
            q = q.param("grade", grade.clone());
        }
        if let Some(score) = outcome.score {
            q = q.param("score", score as i64);
        }
        if let Some(error) = &outcome.error {
            q = q.param("error", error.clone());
        }
        if let Some(status_code) = outcome.status_code {
            q = q.param("status_code", status_code as i64);
        }

        self.fetch_scan(q)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("scan {scan_id} for site {site_id}")))
    }

    async fn select_scan(&self, scan_id: ScanId) -> StoreResult<Option<ScanRecord>> {
        let q = query(&format!(
            "{MATCH_SCAN} WHERE id(scan) = $scan_id RETURN scan, id(site) AS site_id"
        ))
        .param("scan_id", scan_id.raw());
        self.fetch_scan(q).await
    }

    async fn select_finished_scan(&self, scan_id: ScanId) -> StoreResult<Option<ScanRecord>> {
        let q = query(&format!(
            "{MATCH_SCAN} WHERE id(scan) = $scan_id AND scan.state = 'FINISHED' \
             RETURN scan, id(site) AS site_id"
        ))
        .param("scan_id", scan_id.raw());
        self.fetch_scan(q).await
    }

    async fn select_recent_scan(
        &self,
        site_id: SiteId,
        window_secs: i64,
    ) -> StoreResult<Option<ScanRecord>> {
        let q = query(&format!(
            "{MATCH_SCAN} WHERE id(site) = $site_id AND scan.state = 'FINISHED' \
               AND scan.start_time >= timestamp() - $window_ms \
             RETURN scan, id(site) AS site_id \
             ORDER BY scan.start_time DESC LIMIT 1"
        ))
        .param("site_id", site_id.raw())
        .param("window_ms", window_secs * 1000);
        self.fetch_scan(q).await
    }

    async fn select_latest_scan_by_host(
        &self,
        host: &str,
        max_age_secs: i64,
    ) -> StoreResult<Option<ScanRecord>> {
        let q = query(&format!(
            "{MATCH_SCAN} WHERE site.domain = $host AND scan.state = 'FINISHED' \
               AND scan.start_time >= timestamp() - $window_ms \
             RETURN scan, id(site) AS site_id \
             ORDER BY scan.start_time DESC LIMIT 1"
        ))
        .param("host", host.to_string())
        .param("window_ms", max_age_secs * 1000);
        self.fetch_scan(q).await
    }

    async fn select_scan_host_history(&self, site_id: SiteId) -> StoreResult<Vec<HistoryEntry>> {
        // The graph engine has no window functions; fetch the chronological
        // series and compress the change points in Rust.
        let q = query(&format!(
            "{MATCH_SCAN} WHERE id(site) = $site_id AND scan.state = 'FINISHED' \
             RETURN scan ORDER BY scan.start_time"
        ))
        .param("site_id", site_id.raw());

        let mut stream = self.graph.execute(q).await?;
        let mut entries = Vec::new();
        while let Some(row) = stream.next().await? {
            let node: Node = row.get("scan").map_err(|e| row_error("scan", e))?;
            // A FINISHED scan always carries these three.
            let grade: String = node.get("grade").map_err(|e| row_error("grade", e))?;
            let score: i64 = node.get("score").map_err(|e| row_error("score", e))?;
            let end_millis: i64 = node.get("end_time").map_err(|e| row_error("end_time", e))?;
            entries.push(HistoryEntry {
                scan_id: ScanId::new(node.id()),
                grade,
                score: score as i32,
                timestamp: normalize::instant_from_millis(end_millis)?,
            });
        }

        Ok(normalize::compress_history(entries))
    }

    async fn update_scan_state(
        &self,
        scan_id: ScanId,
        state: ScanState,
        error: Option<&str>,
    ) -> StoreResult<ScanRecord> {
        lifecycle::check_forced_state(state, error)?;

        let current = {
            let q = query("MATCH (scan:Scan) WHERE id(scan) = $scan_id RETURN scan.state AS state")
                .param("scan_id", scan_id.raw());
            let mut stream = self.graph.execute(q).await?;
            let row = stream
                .next()
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("scan {scan_id}")))?;
            let raw: String = row.get("state").map_err(|e| row_error("state", e))?;
            raw.parse()
                .map_err(|e: crate::types::StateError| StoreError::Serialization(e.to_string()))?
        };
        lifecycle::check_transition(current, state)?;

        let set = if error.is_some() {
            "scan.state = $state, scan.end_time = timestamp(), scan.error = $error"
        } else {
            "scan.state = $state, scan.end_time = timestamp()"
        };
        let text = format!(
            "{MATCH_SCAN} WHERE id(scan) = $scan_id SET {set} \
             RETURN scan, id(site) AS site_id"
        );
        let mut q = query(&text)
            .param("scan_id", scan_id.raw())
            .param("state", state.as_str().to_string());
        if let Some(error) = error {
            q = q.param("error", error.to_string());
        }

        self.fetch_scan(q)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("scan {scan_id}")))
    }

    async fn select_test_results(&self, scan_id: ScanId) -> StoreResult<Vec<TestResultRecord>> {
        let q = query(
            "MATCH (scan:Scan)-[:HAS_RESULT]->(test:TestResult) \
             WHERE id(scan) = $scan_id \
             RETURN test ORDER BY test.name",
        )
        .param("scan_id", scan_id.raw());

        let mut stream = self.graph.execute(q).await?;
        let mut results = Vec::new();
        while let Some(row) = stream.next().await? {
            let node: Node = row.get("test").map_err(|e| row_error("test", e))?;
            results.push(normalize::test_result_from_node(&node, scan_id.raw())?);
        }
        Ok(results)
    }

    async fn select_grade_distribution(&self) -> StoreResult<Vec<GradeCount>> {
        // No materialized-view support here; the aggregate is computed on
        // demand and ordered by the canonical ranking in Rust.
        let q = query(
            "MATCH (scan:Scan) \
             WHERE scan.state = 'FINISHED' AND scan.grade IS NOT NULL \
             RETURN scan.grade AS grade, count(*) AS count",
        );

        let mut stream = self.graph.execute(q).await?;
        let mut counts = Vec::new();
        while let Some(row) = stream.next().await? {
            let grade: String = row.get("grade").map_err(|e| row_error("grade", e))?;
            let count: i64 = row.get("count").map_err(|e| row_error("count", e))?;
            counts.push(GradeCount { grade, count });
        }
        Ok(normalize::sort_grade_counts(counts))
    }

    async fn refresh_materialized_views(&self) -> StoreResult<()> {
        // Nothing precomputed on this backend.
        tracing::debug!("graph backend has no materialized views to refresh");
        Ok(())
    }

    async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            match self.graph.run(query(statement)).await {
                Ok(()) => {}
                Err(e) if is_already_exists(&e) => {
                    tracing::debug!(error = ?e, "schema rule already exists, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!("graph schema is up to date");
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        // The driver pool releases its connections when the last Graph
        // handle is dropped; there is no explicit close in the driver.
        tracing::debug!("graph store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_are_idempotent_by_construction() {
        for statement in SCHEMA {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "statement must be re-runnable: {statement}"
            );
        }
    }

    #[test]
    fn test_constraint_violation_detection() {
        let duplicate = "Node(7) already exists with label `Site` and property `domain`";
        assert!(constraint_violation_text(duplicate));
        assert!(already_exists_text(duplicate));

        assert!(already_exists_text(
            "An equivalent constraint already exists, 'EquivalentSchemaRuleAlreadyExists'"
        ));
        assert!(!constraint_violation_text("syntax error at offset 12"));
    }
}
