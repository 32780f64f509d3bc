//! Letter grades and their fixed best-to-worst ranking.
//!
//! Grade *computation* happens in the external scoring pipeline; this crate
//! only stores grade labels and orders aggregates by the canonical ranking.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A letter grade assigned to a finished scan.
///
/// Variants are declared in ranking order, best first, so that the derived
/// `Ord` matches the canonical `A+ .. F` ordering used by grade aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "A-")]
    AMinus,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "B-")]
    BMinus,
    #[serde(rename = "C+")]
    CPlus,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "C-")]
    CMinus,
    #[serde(rename = "D+")]
    DPlus,
    #[serde(rename = "D")]
    D,
    #[serde(rename = "D-")]
    DMinus,
    #[serde(rename = "F")]
    F,
}

/// Every grade in ranking order, best to worst.
pub const GRADE_ORDER: [Grade; 13] = [
    Grade::APlus,
    Grade::A,
    Grade::AMinus,
    Grade::BPlus,
    Grade::B,
    Grade::BMinus,
    Grade::CPlus,
    Grade::C,
    Grade::CMinus,
    Grade::DPlus,
    Grade::D,
    Grade::DMinus,
    Grade::F,
];

impl Grade {
    /// Position in the canonical ranking, 0 being best (`A+`).
    pub fn rank(&self) -> usize {
        GRADE_ORDER.iter().position(|g| g == self).unwrap_or(GRADE_ORDER.len())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::APlus => "A+",
            Self::A => "A",
            Self::AMinus => "A-",
            Self::BPlus => "B+",
            Self::B => "B",
            Self::BMinus => "B-",
            Self::CPlus => "C+",
            Self::C => "C",
            Self::CMinus => "C-",
            Self::DPlus => "D+",
            Self::D => "D",
            Self::DMinus => "D-",
            Self::F => "F",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grade {
    type Err = GradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GRADE_ORDER
            .iter()
            .copied()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| GradeError::Unknown(s.to_string()))
    }
}

/// Error type for grade parsing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GradeError {
    #[error("unknown grade: {0}")]
    Unknown(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grade_roundtrip_all() {
        for grade in GRADE_ORDER {
            let parsed: Grade = grade.as_str().parse().unwrap();
            assert_eq!(parsed, grade);
        }
    }

    #[test]
    fn test_grade_rank_order() {
        assert_eq!(Grade::APlus.rank(), 0);
        assert_eq!(Grade::F.rank(), 12);
        assert!(Grade::APlus < Grade::A);
        assert!(Grade::BMinus < Grade::CPlus);
        assert!(Grade::DMinus < Grade::F);
    }

    #[test]
    fn test_grade_parse_rejects_unknown() {
        assert!("E".parse::<Grade>().is_err());
        assert!("a+".parse::<Grade>().is_err());
    }

    #[test]
    fn test_grade_serde_uses_labels() {
        assert_eq!(serde_json::to_string(&Grade::APlus).unwrap(), "\"A+\"");
        let back: Grade = serde_json::from_str("\"B-\"").unwrap();
        assert_eq!(back, Grade::BMinus);
    }
}
