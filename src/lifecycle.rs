//! Scan lifecycle state machine.
//!
//! Encodes which transitions a stored scan may take and validates terminal
//! outcomes before any backend write happens. Both storage adapters route
//! every state change through this module, so the two backends cannot drift
//! in what they consider a legal lifecycle.

use crate::error::{StoreError, StoreResult};
use crate::storage::record::ScanOutcome;
use crate::types::ScanState;

/// Check that a transition between two states is legal.
///
/// The only legal transitions in this layer are `RUNNING` into one of the
/// three terminal states. Terminal states never transition out; a stale
/// `RUNNING` scan is never auto-transitioned.
pub fn check_transition(from: ScanState, to: ScanState) -> StoreResult<()> {
    let legal = matches!(
        (from, to),
        (ScanState::Running, ScanState::Finished)
            | (ScanState::Running, ScanState::Failed)
            | (ScanState::Running, ScanState::Aborted)
    );

    if legal {
        Ok(())
    } else {
        Err(StoreError::Validation(format!(
            "illegal scan state transition: {from} -> {to}"
        )))
    }
}

/// Check that a forced transition (outside the normal terminal path) targets
/// an allowed state. Only `ABORTED` and `FAILED` may be forced, and forcing
/// `FAILED` requires an error message — a FAILED scan always carries one.
pub fn check_forced_state(to: ScanState, error: Option<&str>) -> StoreResult<()> {
    match to {
        ScanState::Aborted => Ok(()),
        ScanState::Failed if error.is_none() => Err(StoreError::Validation(
            "forcing a scan to FAILED requires an error message".to_string(),
        )),
        ScanState::Failed => Ok(()),
        other => Err(StoreError::Validation(format!(
            "scan state {other} cannot be forced; only ABORTED or FAILED"
        ))),
    }
}

/// Derive the terminal state a completed outcome puts the scan into:
/// `FINISHED` when a score is present, `FAILED` otherwise.
pub fn terminal_state_for(outcome: &ScanOutcome) -> ScanState {
    if outcome.score.is_some() {
        ScanState::Finished
    } else {
        ScanState::Failed
    }
}

/// Validate a completed outcome before it is written.
///
/// Rejects negative counts, a finished outcome without a grade, and a failed
/// outcome without an error message (a FAILED scan always carries one).
pub fn validate_outcome(outcome: &ScanOutcome) -> StoreResult<()> {
    if outcome.tests_passed < 0 || outcome.tests_failed < 0 || outcome.tests_quantity < 0 {
        return Err(StoreError::Validation(format!(
            "negative test counts: passed={} failed={} quantity={}",
            outcome.tests_passed, outcome.tests_failed, outcome.tests_quantity
        )));
    }

    match outcome.score {
        Some(_) if outcome.grade.is_none() => Err(StoreError::Validation(
            "scored outcome is missing a grade".to_string(),
        )),
        None if outcome.error.is_none() => Err(StoreError::Validation(
            "failed outcome is missing an error message".to_string(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn finished_outcome() -> ScanOutcome {
        ScanOutcome {
            score: Some(105),
            grade: Some("A+".to_string()),
            tests_passed: 2,
            tests_failed: 0,
            tests_quantity: 2,
            error: None,
            status_code: Some(200),
            response_headers: serde_json::json!({}),
            results: BTreeMap::new(),
        }
    }

    #[test]
    fn test_running_reaches_every_terminal_state() {
        for to in [ScanState::Finished, ScanState::Failed, ScanState::Aborted] {
            assert!(check_transition(ScanState::Running, to).is_ok());
        }
    }

    #[test]
    fn test_terminal_states_never_transition_out() {
        for from in [ScanState::Finished, ScanState::Failed, ScanState::Aborted] {
            for to in [
                ScanState::Running,
                ScanState::Finished,
                ScanState::Failed,
                ScanState::Aborted,
            ] {
                assert!(check_transition(from, to).is_err());
            }
        }
    }

    #[test]
    fn test_orchestrator_states_are_not_set_here() {
        assert!(check_transition(ScanState::Pending, ScanState::Running).is_err());
        assert!(check_transition(ScanState::Running, ScanState::Pending).is_err());
        assert!(check_transition(ScanState::Starting, ScanState::Finished).is_err());
    }

    #[test]
    fn test_forced_state_allows_only_aborted_and_failed() {
        assert!(check_forced_state(ScanState::Aborted, None).is_ok());
        assert!(check_forced_state(ScanState::Failed, Some("timed out")).is_ok());
        assert!(check_forced_state(ScanState::Finished, None).is_err());
        assert!(check_forced_state(ScanState::Running, None).is_err());
    }

    #[test]
    fn test_forcing_failed_requires_an_error_message() {
        let err = check_forced_state(ScanState::Failed, None).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        // ABORTED stays legal without one.
        assert!(check_forced_state(ScanState::Aborted, None).is_ok());
    }

    #[test]
    fn test_terminal_state_follows_score_presence() {
        let finished = finished_outcome();
        assert_eq!(terminal_state_for(&finished), ScanState::Finished);

        let mut failed = finished_outcome();
        failed.score = None;
        failed.grade = None;
        failed.error = Some("timeout".to_string());
        assert_eq!(terminal_state_for(&failed), ScanState::Failed);
    }

    #[test]
    fn test_validate_rejects_negative_counts() {
        let mut outcome = finished_outcome();
        outcome.tests_failed = -1;
        assert!(validate_outcome(&outcome).is_err());
    }

    #[test]
    fn test_validate_rejects_failure_without_error() {
        let mut outcome = finished_outcome();
        outcome.score = None;
        outcome.grade = None;
        assert!(validate_outcome(&outcome).is_err());

        outcome.error = Some("connection reset".to_string());
        assert!(validate_outcome(&outcome).is_ok());
    }

    #[test]
    fn test_validate_rejects_score_without_grade() {
        let mut outcome = finished_outcome();
        outcome.grade = None;
        assert!(validate_outcome(&outcome).is_err());
    }
}
