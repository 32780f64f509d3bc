//! Scan lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// State of a scan in its lifecycle.
///
/// This layer creates scans in [`ScanState::Running`] and moves them exactly
/// once into a terminal state. `Pending` and `Starting` exist as vocabulary
/// for an external orchestrator and are never set here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanState {
    /// Queued by an orchestrator, not yet started.
    Pending,
    /// Being prepared by an orchestrator.
    Starting,
    /// In progress; counts are zero, grade and score null.
    Running,
    /// Completed successfully; grade, score, and end time are set.
    Finished,
    /// Completed unsuccessfully; an error message is set.
    Failed,
    /// Cancelled from outside the normal terminal path.
    Aborted,
}

impl ScanState {
    /// Whether no further transition out of this state is legal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanState {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "STARTING" => Ok(Self::Starting),
            "RUNNING" => Ok(Self::Running),
            "FINISHED" => Ok(Self::Finished),
            "FAILED" => Ok(Self::Failed),
            "ABORTED" => Ok(Self::Aborted),
            _ => Err(StateError::Unknown(s.to_string())),
        }
    }
}

/// Error type for state parsing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateError {
    #[error("unknown scan state: {0}")]
    Unknown(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            ScanState::Pending,
            ScanState::Starting,
            ScanState::Running,
            ScanState::Finished,
            ScanState::Failed,
            ScanState::Aborted,
        ] {
            let parsed: ScanState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ScanState::Running.is_terminal());
        assert!(!ScanState::Pending.is_terminal());
        assert!(ScanState::Finished.is_terminal());
        assert!(ScanState::Failed.is_terminal());
        assert!(ScanState::Aborted.is_terminal());
    }

    #[test]
    fn test_state_parse_rejects_unknown() {
        assert!("running".parse::<ScanState>().is_err());
        assert!("DONE".parse::<ScanState>().is_err());
    }
}
