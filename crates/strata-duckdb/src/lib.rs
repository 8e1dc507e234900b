//! Embedded DuckDB engine for the strata table store.
//!
//! This crate is a workspace member that isolates the heavy `duckdb` (bundled C++)
//! dependency into its own compilation unit, preventing recompilation of DuckDB
//! when unrelated store code changes.
//!
//! # Modules
//!
//! - [`engine`] -- One physical DuckDB instance: open, attach, views, queries.
//! - [`settings`] -- Per-instance settings and the read/write resource split.
//! - [`sql`] -- Identifier and literal quoting.
//! - [`error`] -- Domain-specific error types.

pub mod engine;
pub mod error;
pub mod settings;
pub mod sql;

pub use duckdb;
pub use engine::{query_rows, Engine, QueryResult, QueryResultRow};
pub use error::{EngineError, Result};
pub use settings::{parse_human_size, resolve_pair, resolve_pair_with, DetectedResources, EngineSettings};
