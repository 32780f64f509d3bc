//! Core type definitions using newtype patterns for type safety.
//!
//! These types prevent common logic errors by making invalid states
//! unrepresentable at compile time.

mod grade;
mod ids;
mod state;

pub use grade::{Grade, GradeError, GRADE_ORDER};
pub use ids::{IdError, ScanId, SiteId, TestResultId};
pub use state::{ScanState, StateError};
