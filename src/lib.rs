//! # Scanledger - Persistence for Graded Website Security Scans
//!
//! Scanledger stores and queries the results of website security audits
//! produced by an external retrieval-and-analysis pipeline. The same storage
//! contract is satisfied by two structurally different engines: a relational
//! (PostgreSQL) backend and a graph (Neo4j) backend, selected by a single
//! configuration value.
//!
//! ## Features
//!
//! - **One contract, two backends**: the [`storage::ScanStore`] trait is
//!   implemented by [`storage::postgres::PgStore`] and
//!   [`storage::neo4j::GraphStore`] with identical caller-facing behavior
//! - **Scan lifecycle**: scans are created RUNNING and move exactly once
//!   into FINISHED, FAILED, or ABORTED, enforced by [`lifecycle`]
//! - **Crash-safe terminal writes**: test results always land before the
//!   scan's terminal state becomes visible
//! - **Change-point history**: a site's score history is compressed to the
//!   points where the score actually changed
//! - **Normalized records**: both backends return the same record shapes
//!   with typed timestamps and identifiers
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use scanledger::config::StorageSettings;
//! use scanledger::storage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = StorageSettings::from_env()?;
//!     let store = storage::connect(&settings).await?;
//!     store.migrate().await?;
//!
//!     let site_id = store.ensure_site("example.com").await?;
//!     let scan = store.insert_scan(site_id).await?;
//!     println!("scan {} is {}", scan.id, scan.state);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`types`] - Core type definitions with newtype patterns for type safety
//! - [`storage`] - The storage contract, both adapters, and the factory
//! - [`lifecycle`] - The scan lifecycle state machine
//! - [`config`] - Backend selection and connection configuration
//! - [`error`] - Comprehensive error types

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use error::{StoreError, StoreResult};
pub use storage::record::{
    GradeCount, HistoryEntry, ScanOutcome, ScanRecord, TestOutcome, TestResultRecord,
};
pub use storage::{Backend, BoxedStore, ScanStore};
pub use types::{Grade, ScanId, ScanState, SiteId, TestResultId};
