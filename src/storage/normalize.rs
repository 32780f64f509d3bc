//! Row normalization: backend-native records into the caller-facing shape.
//!
//! The relational backend returns typed rows with TIMESTAMPTZ columns; the
//! graph backend returns nodes whose timestamps are millisecond counters and
//! whose blobs are string properties. Everything funnels through here so the
//! rest of the crate only ever sees [`ScanRecord`] and friends.

use crate::error::{StoreError, StoreResult};
use crate::storage::record::{GradeCount, HistoryEntry, ScanRecord, TestResultRecord};
use crate::types::{Grade, ScanId, ScanState, SiteId, TestResultId};
use chrono::{DateTime, TimeZone, Utc};
use neo4rs::Node;
use sqlx::postgres::PgRow;
use sqlx::Row;

/// Format version stamped onto serialized blobs (response-header snapshots,
/// test output). Bump when the body layout changes so readers never have to
/// blind-parse untyped text.
pub const BLOB_FORMAT_VERSION: u16 = 1;

/// Wrap a blob body in the version-tagged envelope stored in the backend.
pub fn tag_blob(body: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "v": BLOB_FORMAT_VERSION, "body": body })
}

/// Unwrap a version-tagged blob read back from a backend.
///
/// Tolerates untagged values (treated as a bare version-0 body) so stores
/// written before the envelope existed still read cleanly.
pub fn untag_blob(stored: serde_json::Value) -> serde_json::Value {
    match stored {
        serde_json::Value::Object(mut map) if map.contains_key("v") && map.contains_key("body") => {
            map.remove("body").unwrap_or(serde_json::Value::Null)
        }
        other => other,
    }
}

/// Convert a graph-side millisecond counter into the boundary instant type.
///
/// Raw integers never leak upward; a counter outside the representable range
/// is a serialization error, not a panic.
pub fn instant_from_millis(millis: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {millis} ms")))
}

/// Convert a boundary instant into the graph-side millisecond counter.
pub fn millis_from_instant(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

/// Change-point compression over a chronologically ordered history.
///
/// The earliest entry is always kept; each later entry is kept only when its
/// score differs from the previously kept one, so a flat score segment
/// collapses to its first occurrence and no two adjacent output entries
/// share a score.
pub fn compress_history(entries: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
    let mut compressed: Vec<HistoryEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match compressed.last() {
            Some(previous) if previous.score == entry.score => {}
            _ => compressed.push(entry),
        }
    }
    compressed
}

/// Order grade counts by the fixed best-to-worst ranking.
///
/// Counts whose label is not a known grade sort after `F`, alphabetically,
/// rather than being dropped.
pub fn sort_grade_counts(mut counts: Vec<GradeCount>) -> Vec<GradeCount> {
    counts.sort_by(|a, b| {
        let rank_a = a.grade.parse::<Grade>().map(|g| g.rank()).unwrap_or(usize::MAX);
        let rank_b = b.grade.parse::<Grade>().map(|g| g.rank()).unwrap_or(usize::MAX);
        rank_a.cmp(&rank_b).then_with(|| a.grade.cmp(&b.grade))
    });
    counts
}

fn parse_state(raw: &str) -> StoreResult<ScanState> {
    raw.parse::<ScanState>()
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Normalize one relational scan row.
pub fn scan_from_pg_row(row: &PgRow) -> StoreResult<ScanRecord> {
    let state: String = row.try_get("state")?;
    Ok(ScanRecord {
        id: ScanId::new(row.try_get("id")?),
        site_id: SiteId::new(row.try_get("site_id")?),
        state: parse_state(&state)?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        tests_failed: row.try_get("tests_failed")?,
        tests_passed: row.try_get("tests_passed")?,
        tests_quantity: row.try_get("tests_quantity")?,
        grade: row.try_get("grade")?,
        score: row.try_get("score")?,
        error: row.try_get("error")?,
        algorithm_version: row.try_get("algorithm_version")?,
    })
}

/// Normalize one relational test-result row.
pub fn test_result_from_pg_row(row: &PgRow) -> StoreResult<TestResultRecord> {
    let output: serde_json::Value = row.try_get("output")?;
    Ok(TestResultRecord {
        id: TestResultId::new(row.try_get("id")?),
        scan_id: ScanId::new(row.try_get("scan_id")?),
        name: row.try_get("name")?,
        expectation: row.try_get("expectation")?,
        result: row.try_get("result")?,
        pass: row.try_get("pass")?,
        output: untag_blob(output),
        score_modifier: row.try_get("score_modifier")?,
    })
}

/// Normalize one relational history row.
pub fn history_from_pg_row(row: &PgRow) -> StoreResult<HistoryEntry> {
    Ok(HistoryEntry {
        scan_id: ScanId::new(row.try_get("id")?),
        grade: row.try_get("grade")?,
        score: row.try_get("score")?,
        timestamp: row.try_get("end_time")?,
    })
}

/// Fetch a property a well-formed node must carry. The driver reports
/// missing or mistyped properties as a decode error.
macro_rules! required {
    ($node:expr, $ty:ty, $key:literal) => {
        $node
            .get::<$ty>($key)
            .map_err(|e| StoreError::Serialization(format!("node property {}: {e}", $key)))?
    };
}

/// Normalize a graph scan node. The owning site's id travels alongside the
/// node because ownership is a relationship, not a property.
pub fn scan_from_node(node: &Node, site_id: i64) -> StoreResult<ScanRecord> {
    let state: String = required!(node, String, "state");
    let start_millis: i64 = required!(node, i64, "start_time");
    // Nullable properties are simply absent on the node.
    let end_millis = node.get::<i64>("end_time").ok();
    let end_time = end_millis.map(instant_from_millis).transpose()?;

    Ok(ScanRecord {
        id: ScanId::new(node.id()),
        site_id: SiteId::new(site_id),
        state: parse_state(&state)?,
        start_time: instant_from_millis(start_millis)?,
        end_time,
        tests_failed: required!(node, i64, "tests_failed") as i32,
        tests_passed: required!(node, i64, "tests_passed") as i32,
        tests_quantity: required!(node, i64, "tests_quantity") as i32,
        grade: node.get::<String>("grade").ok(),
        score: node.get::<i64>("score").ok().map(|s| s as i32),
        error: node.get::<String>("error").ok(),
        algorithm_version: required!(node, i64, "algorithm_version") as i32,
    })
}

/// Normalize a graph test-result node.
pub fn test_result_from_node(node: &Node, scan_id: i64) -> StoreResult<TestResultRecord> {
    let raw_output = node
        .get::<String>("output")
        .unwrap_or_else(|_| "null".to_string());
    let output: serde_json::Value = serde_json::from_str(&raw_output)?;

    Ok(TestResultRecord {
        id: TestResultId::new(node.id()),
        scan_id: ScanId::new(scan_id),
        name: required!(node, String, "name"),
        expectation: required!(node, String, "expectation"),
        result: required!(node, String, "result"),
        pass: required!(node, bool, "pass"),
        output: untag_blob(output),
        score_modifier: required!(node, i64, "score_modifier") as i32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(scan_id: i64, score: i32, at: i64) -> HistoryEntry {
        HistoryEntry {
            scan_id: ScanId::new(scan_id),
            grade: "B".to_string(),
            score,
            timestamp: Utc.timestamp_opt(at, 0).unwrap(),
        }
    }

    #[test]
    fn test_compress_drops_flat_segments() {
        let history = vec![entry(1, 100, 10), entry(2, 100, 20), entry(3, 90, 30)];
        let compressed = compress_history(history);
        assert_eq!(compressed.len(), 2);
        assert_eq!(compressed[0].score, 100);
        assert_eq!(compressed[0].scan_id, ScanId::new(1));
        assert_eq!(compressed[1].score, 90);
    }

    #[test]
    fn test_compress_always_keeps_earliest_entry() {
        let history = vec![entry(1, 50, 10)];
        assert_eq!(compress_history(history).len(), 1);
        assert!(compress_history(Vec::new()).is_empty());
    }

    #[test]
    fn test_compress_keeps_score_reappearances() {
        // A score that returns after a change is a new change point.
        let history = vec![entry(1, 100, 10), entry(2, 90, 20), entry(3, 100, 30)];
        let compressed = compress_history(history);
        assert_eq!(compressed.len(), 3);
    }

    #[test]
    fn test_compressed_history_has_no_adjacent_equal_scores() {
        let scores = [100, 100, 100, 90, 90, 100, 85, 85];
        let history: Vec<_> = scores
            .iter()
            .enumerate()
            .map(|(i, &s)| entry(i as i64, s, i as i64 * 10))
            .collect();
        let compressed = compress_history(history);
        for pair in compressed.windows(2) {
            assert_ne!(pair[0].score, pair[1].score);
        }
    }

    #[test]
    fn test_grade_counts_sorted_by_ranking_not_alphabet() {
        let counts = vec![
            GradeCount { grade: "F".into(), count: 4 },
            GradeCount { grade: "A-".into(), count: 2 },
            GradeCount { grade: "B+".into(), count: 9 },
            GradeCount { grade: "A+".into(), count: 1 },
        ];
        let sorted = sort_grade_counts(counts);
        let order: Vec<&str> = sorted.iter().map(|c| c.grade.as_str()).collect();
        assert_eq!(order, vec!["A+", "A-", "B+", "F"]);
    }

    #[test]
    fn test_unknown_grade_labels_sort_last() {
        let counts = vec![
            GradeCount { grade: "?".into(), count: 1 },
            GradeCount { grade: "F".into(), count: 2 },
        ];
        let sorted = sort_grade_counts(counts);
        assert_eq!(sorted[0].grade, "F");
        assert_eq!(sorted[1].grade, "?");
    }

    #[test]
    fn test_millis_conversion_roundtrip() {
        let instant = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let millis = millis_from_instant(instant);
        assert_eq!(instant_from_millis(millis).unwrap(), instant);
    }

    #[test]
    fn test_millis_out_of_range_is_an_error() {
        assert!(instant_from_millis(i64::MAX).is_err());
    }

    #[test]
    fn test_blob_tag_roundtrip() {
        let body = serde_json::json!({"hsts": {"max-age": 31536000}});
        let stored = tag_blob(body.clone());
        assert_eq!(stored["v"], BLOB_FORMAT_VERSION);
        assert_eq!(untag_blob(stored), body);
    }

    #[test]
    fn test_untag_tolerates_legacy_bare_blobs() {
        let legacy = serde_json::json!({"content-type": "text/html"});
        assert_eq!(untag_blob(legacy.clone()), legacy);
    }
}
