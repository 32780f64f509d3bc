//! Unique identifiers for stored entities.
//!
//! Newtypes over the storage-assigned integer keys, preventing accidental
//! misuse of a site id where a scan id is expected (and vice versa).
//!
//! The relational backend assigns these from BIGSERIAL sequences; the graph
//! backend exposes the engine's native node id. Both normalize to the same
//! caller-facing `i64`-backed types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw storage-assigned key.
            pub fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Get the raw integer key.
            pub fn raw(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<i64>()
                    .map(Self)
                    .map_err(|_| IdError::InvalidFormat(s.to_string()))
            }
        }
    };
}

entity_id! {
    /// A unique identifier for a scanned site.
    SiteId
}

entity_id! {
    /// A unique identifier for one scan of a site.
    ScanId
}

entity_id! {
    /// A unique identifier for one test result within a scan.
    TestResultId
}

/// Error type for identifier parsing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdError {
    #[error("invalid identifier: {0}")]
    InvalidFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        let id = ScanId::new(42);
        assert_eq!(id.raw(), 42);
        assert_eq!(id.to_string(), "42");
        let parsed: ScanId = "42".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_id_parse_rejects_garbage() {
        assert!("not-a-number".parse::<SiteId>().is_err());
    }

    #[test]
    fn test_id_serde_transparent() {
        let id = SiteId::new(7);
        assert_eq!(serde_json::to_string(&id).unwrap(), "7");
        let back: SiteId = serde_json::from_str("7").unwrap();
        assert_eq!(back, id);
    }
}
