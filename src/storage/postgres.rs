//! Relational storage adapter backed by PostgreSQL.
//!
//! Uses a `sqlx` connection pool shared by all calls. The terminal scan
//! transition runs in a single SQL transaction, so the relational path gets
//! full atomicity: either every test result and the terminal update land, or
//! none do. The grade aggregate is precomputed in a materialized view.

use crate::config::RelationalSettings;
use crate::error::{StoreError, StoreResult};
use crate::lifecycle;
use crate::storage::normalize;
use crate::storage::record::{
    GradeCount, HistoryEntry, ScanOutcome, ScanRecord, TestResultRecord, ALGORITHM_VERSION,
};
use crate::storage::{Backend, ScanStore};
use crate::types::{ScanId, ScanState, SiteId};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;

const SCAN_COLUMNS: &str = "id, site_id, state, start_time, end_time, tests_failed, \
     tests_passed, tests_quantity, grade, score, error, algorithm_version";

/// Idempotent schema statements. `IF NOT EXISTS` everywhere, so re-running
/// them against an initialized store is safe.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sites (
        id BIGSERIAL PRIMARY KEY,
        domain TEXT NOT NULL,
        creation_time TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS sites_domain_idx ON sites (domain)",
    "CREATE TABLE IF NOT EXISTS scans (
        id BIGSERIAL PRIMARY KEY,
        site_id BIGINT NOT NULL REFERENCES sites (id),
        state TEXT NOT NULL,
        start_time TIMESTAMPTZ NOT NULL DEFAULT now(),
        end_time TIMESTAMPTZ,
        tests_failed INTEGER NOT NULL DEFAULT 0,
        tests_passed INTEGER NOT NULL DEFAULT 0,
        tests_quantity INTEGER NOT NULL DEFAULT 0,
        grade TEXT,
        score INTEGER,
        error TEXT,
        algorithm_version INTEGER NOT NULL,
        status_code INTEGER,
        response_headers JSONB
    )",
    "CREATE INDEX IF NOT EXISTS scans_site_idx ON scans (site_id, start_time)",
    "CREATE INDEX IF NOT EXISTS scans_state_idx ON scans (state)",
    "CREATE TABLE IF NOT EXISTS tests (
        id BIGSERIAL PRIMARY KEY,
        scan_id BIGINT NOT NULL REFERENCES scans (id),
        name TEXT NOT NULL,
        expectation TEXT NOT NULL,
        result TEXT NOT NULL,
        pass BOOLEAN NOT NULL,
        output JSONB,
        score_modifier INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS tests_scan_idx ON tests (scan_id)",
    "CREATE MATERIALIZED VIEW IF NOT EXISTS grade_distribution AS
        SELECT grade, count(*) AS count
        FROM scans
        WHERE state = 'FINISHED'
        GROUP BY grade",
];

/// Change-point history query. The window and the final ordering use the
/// same chronological key (start_time); scans that finish out of start order
/// would otherwise let equal scores slip past the adjacency filter.
const HISTORY_SQL: &str = "SELECT id, grade, score, end_time FROM ( \
         SELECT id, grade, score, end_time, start_time, \
                LAG(score) OVER (ORDER BY start_time) AS previous_score \
         FROM scans \
         WHERE site_id = $1 AND state = 'FINISHED' \
     ) history \
     WHERE previous_score IS NULL OR previous_score IS DISTINCT FROM score \
     ORDER BY start_time";

/// PostgreSQL-backed scan store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Establish the connection pool. One pool per process lifetime; calling
    /// this twice creates two independent pools.
    pub async fn connect(settings: &RelationalSettings) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .idle_timeout(Duration::from_secs(settings.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(settings.max_lifetime_secs))
            .connect(&settings.url())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        tracing::debug!(
            host = %settings.host,
            database = %settings.database,
            max_connections = settings.max_connections,
            "relational pool established"
        );
        Ok(Self { pool })
    }

    async fn fetch_scan_where(
        &self,
        clause: &str,
        scan_id: ScanId,
    ) -> StoreResult<Option<ScanRecord>> {
        let sql = format!("SELECT {SCAN_COLUMNS} FROM scans WHERE {clause}");
        let row = sqlx::query(&sql)
            .bind(scan_id.raw())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| normalize::scan_from_pg_row(&r)).transpose()
    }
}

/// Whether a driver error is the engine rejecting a duplicate under a
/// uniqueness constraint.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Whether a driver error is a foreign-key violation, i.e. a write that
/// referenced a missing parent row.
fn is_fk_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23503"))
}

/// Whether a DDL error means the object already exists. Expected during a
/// re-run of `migrate`; logged and ignored there.
fn is_already_exists(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db)
            if matches!(db.code().as_deref(), Some("42P07") | Some("42710") | Some("42701"))
    )
}

#[async_trait]
impl ScanStore for PgStore {
    fn backend(&self) -> Backend {
        Backend::Relational
    }

    async fn ensure_site(&self, domain: &str) -> StoreResult<SiteId> {
        if domain.is_empty() {
            return Err(StoreError::Validation("empty domain".to_string()));
        }

        if let Some(row) = sqlx::query("SELECT id FROM sites WHERE domain = $1")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(SiteId::new(row.try_get("id")?));
        }

        let inserted = sqlx::query("INSERT INTO sites (domain) VALUES ($1) RETURNING id")
            .bind(domain)
            .fetch_one(&self.pool)
            .await;

        match inserted {
            Ok(row) => Ok(SiteId::new(row.try_get("id")?)),
            Err(e) if is_unique_violation(&e) => Err(StoreError::ConstraintViolation(format!(
                "site {domain} was created concurrently"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_scan(&self, site_id: SiteId) -> StoreResult<ScanRecord> {
        let sql = format!(
            "INSERT INTO scans (site_id, state, algorithm_version) \
             VALUES ($1, $2, $3) RETURNING {SCAN_COLUMNS}"
        );
        let inserted = sqlx::query(&sql)
            .bind(site_id.raw())
            .bind(ScanState::Running.as_str())
            .bind(ALGORITHM_VERSION)
            .fetch_one(&self.pool)
            .await;

        match inserted {
            Ok(row) => normalize::scan_from_pg_row(&row),
            Err(e) if is_fk_violation(&e) => {
                Err(StoreError::NotFound(format!("site {site_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_test_results(
        &self,
        site_id: SiteId,
        scan_id: ScanId,
        outcome: &ScanOutcome,
    ) -> StoreResult<ScanRecord> {
        lifecycle::validate_outcome(outcome)?;
        let terminal = lifecycle::terminal_state_for(outcome);

        let mut tx = self.pool.begin().await?;

        let current = sqlx::query("SELECT state FROM scans WHERE id = $1 AND site_id = $2 FOR UPDATE")
            .bind(scan_id.raw())
            .bind(site_id.raw())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("scan {scan_id} for site {site_id}")))?;
        let current_state: ScanState = current
            .try_get::<String, _>("state")?
            .parse()
            .map_err(|e: crate::types::StateError| StoreError::Serialization(e.to_string()))?;
        lifecycle::check_transition(current_state, terminal)?;

        // Test results first; the terminal state write is the last statement
        // of the transaction.
        for (name, test) in &outcome.results {
            sqlx::query(
                "INSERT INTO tests (scan_id, name, expectation, result, pass, output, score_modifier) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(scan_id.raw())
            .bind(name)
            .bind(&test.expectation)
            .bind(&test.result)
            .bind(test.pass)
            .bind(normalize::tag_blob(test.output.clone()))
            .bind(test.score_modifier)
            .execute(&mut *tx)
            .await?;
        }

        let sql = format!(
            "UPDATE scans SET state = $2, end_time = now(), tests_passed = $3, \
             tests_failed = $4, tests_quantity = $5, grade = $6, score = $7, error = $8, \
             status_code = $9, response_headers = $10 \
             WHERE id = $1 RETURNING {SCAN_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(scan_id.raw())
            .bind(terminal.as_str())
            .bind(outcome.tests_passed)
            .bind(outcome.tests_failed)
            .bind(outcome.tests_quantity)
            .bind(outcome.grade.as_deref())
            .bind(outcome.score)
            .bind(outcome.error.as_deref())
            .bind(outcome.status_code)
            .bind(normalize::tag_blob(outcome.response_headers.clone()))
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        normalize::scan_from_pg_row(&row)
    }

    async fn select_scan(&self, scan_id: ScanId) -> StoreResult<Option<ScanRecord>> {
        self.fetch_scan_where("id = $1", scan_id).await
    }

    async fn select_finished_scan(&self, scan_id: ScanId) -> StoreResult<Option<ScanRecord>> {
        self.fetch_scan_where("id = $1 AND state = 'FINISHED'", scan_id)
            .await
    }

    async fn select_recent_scan(
        &self,
        site_id: SiteId,
        window_secs: i64,
    ) -> StoreResult<Option<ScanRecord>> {
        let sql = format!(
            "SELECT {SCAN_COLUMNS} FROM scans \
             WHERE site_id = $1 AND state = 'FINISHED' \
               AND start_time >= now() - $2 * interval '1 second' \
             ORDER BY start_time DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(site_id.raw())
            .bind(window_secs)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| normalize::scan_from_pg_row(&r)).transpose()
    }

    async fn select_latest_scan_by_host(
        &self,
        host: &str,
        max_age_secs: i64,
    ) -> StoreResult<Option<ScanRecord>> {
        let sql = format!(
            "SELECT {} FROM scans \
             JOIN sites ON sites.id = scans.site_id \
             WHERE sites.domain = $1 AND scans.state = 'FINISHED' \
               AND scans.start_time >= now() - $2 * interval '1 second' \
             ORDER BY scans.start_time DESC LIMIT 1",
            SCAN_COLUMNS
                .split(", ")
                .map(|c| format!("scans.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let row = sqlx::query(&sql)
            .bind(host)
            .bind(max_age_secs)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| normalize::scan_from_pg_row(&r)).transpose()
    }

    async fn select_scan_host_history(&self, site_id: SiteId) -> StoreResult<Vec<HistoryEntry>> {
        // Change points computed in SQL: the first row always survives the
        // filter because its lagged score is null.
        let rows = sqlx::query(HISTORY_SQL)
            .bind(site_id.raw())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(normalize::history_from_pg_row).collect()
    }

    async fn update_scan_state(
        &self,
        scan_id: ScanId,
        state: ScanState,
        error: Option<&str>,
    ) -> StoreResult<ScanRecord> {
        lifecycle::check_forced_state(state, error)?;

        let mut tx = self.pool.begin().await?;

        let current = sqlx::query("SELECT state FROM scans WHERE id = $1 FOR UPDATE")
            .bind(scan_id.raw())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("scan {scan_id}")))?;
        let current_state: ScanState = current
            .try_get::<String, _>("state")?
            .parse()
            .map_err(|e: crate::types::StateError| StoreError::Serialization(e.to_string()))?;
        lifecycle::check_transition(current_state, state)?;

        let sql = format!(
            "UPDATE scans SET state = $2, error = $3, end_time = now() \
             WHERE id = $1 RETURNING {SCAN_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(scan_id.raw())
            .bind(state.as_str())
            .bind(error)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        normalize::scan_from_pg_row(&row)
    }

    async fn select_test_results(&self, scan_id: ScanId) -> StoreResult<Vec<TestResultRecord>> {
        let rows = sqlx::query(
            "SELECT id, scan_id, name, expectation, result, pass, output, score_modifier \
             FROM tests WHERE scan_id = $1 ORDER BY name",
        )
        .bind(scan_id.raw())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(normalize::test_result_from_pg_row).collect()
    }

    async fn select_grade_distribution(&self) -> StoreResult<Vec<GradeCount>> {
        let rows = sqlx::query("SELECT grade, count FROM grade_distribution WHERE grade IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;

        let counts = rows
            .iter()
            .map(|row| {
                Ok(GradeCount {
                    grade: row.try_get("grade")?,
                    count: row.try_get("count")?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(normalize::sort_grade_counts(counts))
    }

    async fn refresh_materialized_views(&self) -> StoreResult<()> {
        sqlx::query("REFRESH MATERIALIZED VIEW grade_distribution")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            match sqlx::query(statement).execute(&self.pool).await {
                Ok(_) => {}
                Err(e) if is_already_exists(&e) => {
                    tracing::debug!(error = %e, "schema object already exists, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!("relational schema is up to date");
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent_by_construction() {
        for statement in SCHEMA {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "statement must be re-runnable: {statement}"
            );
        }
    }

    #[test]
    fn test_history_window_and_output_share_one_chronological_key() {
        // Overlapping scans can finish out of start order; compressing over
        // one key and emitting over another would let equal scores sit
        // adjacent in the output.
        let window_key = HISTORY_SQL
            .split("OVER (ORDER BY ")
            .nth(1)
            .and_then(|rest| rest.split(')').next())
            .unwrap();
        let output_key = HISTORY_SQL.rsplit("ORDER BY ").next().unwrap();
        assert_eq!(window_key, "start_time");
        assert_eq!(output_key, window_key);
    }

    #[test]
    fn test_scan_columns_match_normalized_shape() {
        let columns: Vec<&str> = SCAN_COLUMNS.split(", ").collect();
        assert_eq!(
            columns,
            vec![
                "id",
                "site_id",
                "state",
                "start_time",
                "end_time",
                "tests_failed",
                "tests_passed",
                "tests_quantity",
                "grade",
                "score",
                "error",
                "algorithm_version",
            ]
        );
    }
}
