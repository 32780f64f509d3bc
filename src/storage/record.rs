//! Normalized record shapes returned by every storage backend.
//!
//! Field names in these shapes are part of the boundary contract with
//! callers and must not change. Both backends, whatever their native row or
//! node layout, normalize into these structs before returning.

use crate::types::{ScanId, ScanState, SiteId, TestResultId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the external scoring algorithm stamped onto newly created
/// scans. Recorded so historical scans remain comparable after the scoring
/// rules change.
pub const ALGORITHM_VERSION: i32 = 2;

/// One audit execution against a site, in its normalized caller-facing shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    /// Unique identifier for this scan.
    pub id: ScanId,
    /// The site this scan belongs to.
    pub site_id: SiteId,
    /// Lifecycle state.
    pub state: ScanState,
    /// When the scan was started.
    pub start_time: DateTime<Utc>,
    /// When the scan reached a terminal state. Null while running.
    pub end_time: Option<DateTime<Utc>>,
    /// Number of security checks that failed.
    pub tests_failed: i32,
    /// Number of security checks that passed.
    pub tests_passed: i32,
    /// Total number of security checks executed.
    pub tests_quantity: i32,
    /// Final letter grade. Null until the scan finishes successfully.
    pub grade: Option<String>,
    /// Final numeric score. Null until the scan finishes successfully.
    pub score: Option<i32>,
    /// Error message. Null unless the scan failed.
    pub error: Option<String>,
    /// Scoring algorithm version in effect when the scan started.
    pub algorithm_version: i32,
}

impl ScanRecord {
    /// Check the cross-field invariant: `end_time`, `grade`, and `score` are
    /// simultaneously null or simultaneously set for a finished scan, and a
    /// failed scan carries an error.
    pub fn is_consistent(&self) -> bool {
        match self.state {
            ScanState::Finished => {
                self.end_time.is_some() && self.grade.is_some() && self.score.is_some()
            }
            ScanState::Failed => self.error.is_some(),
            _ => self.grade.is_none() && self.score.is_none(),
        }
    }
}

/// The outcome of one named security check, in its normalized shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResultRecord {
    /// Unique identifier for this result.
    pub id: TestResultId,
    /// The scan this result belongs to.
    pub scan_id: ScanId,
    /// Name of the security check (e.g. `content-security-policy`).
    pub name: String,
    /// Outcome label the check was expected to produce.
    pub expectation: String,
    /// Outcome label the check actually produced.
    pub result: String,
    /// Whether the check passed.
    pub pass: bool,
    /// Auxiliary detail blob captured by the check, version-tagged.
    pub output: serde_json::Value,
    /// Score delta this check contributed.
    pub score_modifier: i32,
}

/// One point in a site's compressed score history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The scan that produced this point.
    pub scan_id: ScanId,
    /// Grade at this point.
    pub grade: String,
    /// Score at this point.
    pub score: i32,
    /// When the scan reached FINISHED.
    pub timestamp: DateTime<Utc>,
}

/// Count of finished scans holding one grade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeCount {
    /// The letter grade.
    pub grade: String,
    /// Number of finished scans with that grade.
    pub count: i64,
}

/// The outcome of one security check as delivered by the external pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOutcome {
    /// Outcome label the check was expected to produce.
    pub expectation: String,
    /// Outcome label the check actually produced.
    pub result: String,
    /// Whether the check passed.
    pub pass: bool,
    /// Score delta contributed by this check.
    pub score_modifier: i32,
    /// Auxiliary detail captured by the check.
    #[serde(default)]
    pub output: serde_json::Value,
}

/// A completed scan result handed over by the external analysis pipeline.
///
/// This is the input to the terminal transition: a null `score` marks the
/// scan failed, a present `score` marks it finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOutcome {
    /// Final numeric score, or null if the scan failed.
    pub score: Option<i32>,
    /// Final letter grade, or null if the scan failed.
    pub grade: Option<String>,
    /// Number of checks that passed.
    pub tests_passed: i32,
    /// Number of checks that failed.
    pub tests_failed: i32,
    /// Total number of checks executed.
    pub tests_quantity: i32,
    /// Error message; required when `score` is null.
    pub error: Option<String>,
    /// HTTP status code observed on the scanned site.
    pub status_code: Option<i32>,
    /// Response-header snapshot observed on the scanned site.
    #[serde(default)]
    pub response_headers: serde_json::Value,
    /// Per-check outcomes keyed by check name. A BTreeMap keeps insertion
    /// order stable across backends.
    pub results: BTreeMap<String, TestOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn running_record() -> ScanRecord {
        ScanRecord {
            id: ScanId::new(1),
            site_id: SiteId::new(1),
            state: ScanState::Running,
            start_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            end_time: None,
            tests_failed: 0,
            tests_passed: 0,
            tests_quantity: 0,
            grade: None,
            score: None,
            error: None,
            algorithm_version: ALGORITHM_VERSION,
        }
    }

    #[test]
    fn test_running_record_is_consistent() {
        assert!(running_record().is_consistent());
    }

    #[test]
    fn test_finished_record_requires_grade_score_end_time() {
        let mut record = running_record();
        record.state = ScanState::Finished;
        assert!(!record.is_consistent());

        record.end_time = Some(record.start_time);
        record.grade = Some("A+".to_string());
        record.score = Some(105);
        assert!(record.is_consistent());
    }

    #[test]
    fn test_failed_record_requires_error() {
        let mut record = running_record();
        record.state = ScanState::Failed;
        assert!(!record.is_consistent());

        record.error = Some("site unreachable".to_string());
        assert!(record.is_consistent());
    }

    #[test]
    fn test_normalized_field_names_are_stable() {
        let mut record = running_record();
        record.state = ScanState::Finished;
        record.end_time = Some(record.start_time);
        record.grade = Some("B".to_string());
        record.score = Some(70);

        let json = serde_json::to_value(&record).unwrap();
        let object = json.as_object().unwrap();
        for field in [
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
        ] {
            assert!(object.contains_key(field), "missing field {field}");
        }
    }

    #[test]
    fn test_outcome_fields_survive_serialization_unchanged() {
        let outcome = ScanOutcome {
            score: Some(105),
            grade: Some("A+".to_string()),
            tests_passed: 2,
            tests_failed: 0,
            tests_quantity: 2,
            error: None,
            status_code: Some(200),
            response_headers: serde_json::json!({"strict-transport-security": "max-age=63072000"}),
            results: BTreeMap::from([(
                "content-security-policy".to_string(),
                TestOutcome {
                    expectation: "csp-implemented-with-no-unsafe".to_string(),
                    result: "csp-implemented-with-no-unsafe".to_string(),
                    pass: true,
                    score_modifier: 5,
                    output: serde_json::json!({"policy": "default-src 'none'"}),
                },
            )]),
        };

        let json = serde_json::to_string(&outcome).unwrap();
        let back: ScanOutcome = serde_json::from_str(&json).unwrap();
        let test = &back.results["content-security-policy"];
        assert_eq!(test.expectation, "csp-implemented-with-no-unsafe");
        assert_eq!(test.result, "csp-implemented-with-no-unsafe");
        assert!(test.pass);
        assert_eq!(test.score_modifier, 5);
        assert_eq!(back.score, Some(105));
        assert_eq!(back.grade.as_deref(), Some("A+"));
    }

    #[test]
    fn test_test_result_field_names_are_stable() {
        let result = TestResultRecord {
            id: TestResultId::new(1),
            scan_id: ScanId::new(1),
            name: "x-frame-options".to_string(),
            expectation: "deny".to_string(),
            result: "deny".to_string(),
            pass: true,
            output: serde_json::json!({}),
            score_modifier: 0,
        };
        let json = serde_json::to_value(&result).unwrap();
        let object = json.as_object().unwrap();
        for field in [
            "id",
            "scan_id",
            "name",
            "expectation",
            "result",
            "pass",
            "output",
            "score_modifier",
        ] {
            assert!(object.contains_key(field), "missing field {field}");
        }
    }
}
