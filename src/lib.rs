#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Strata
//!
//! Strata is a local, versioned table store built on embedded DuckDB and
//! replicated to object storage.
//!
//! ## Features
//!
//! - **Versioned Tables**: every write produces a new version; readers never see partial state
//! - **Split Engines**: reads and writes run on independent DuckDB instances
//! - **Hot Swap**: the read snapshot is rebuilt off-lock and swapped in atomically
//! - **Remote Backup**: S3, Azure, GCS or a local directory via `object_store`
//! - **Restore on Open**: a missing or stale local copy is rebuilt from the backup
//!
//! ## Library Usage
//!
//! ```no_run
//! use strata::{InsertTableOptions, ReplicatedStore, StoreConfig};
//!
//! # async fn run() -> strata::Result<()> {
//! let config = StoreConfig::load("strata.toml")?;
//! let store = ReplicatedStore::open(config).await?;
//!
//! store
//!     .insert_table_as_select(
//!         "events",
//!         "SELECT * FROM read_parquet('day.parquet')",
//!         InsertTableOptions::merge(["event_id"]),
//!     )
//!     .await?;
//!
//! let conn = store.acquire_read_connection().await?;
//! let count = conn.query("SELECT count(*) FROM events")?;
//! println!("{:?}", count.rows[0].values[0]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`store`]: the [`ReplicatedStore`] façade
//! - [`write`]: [`WriteConnection`] and the write-side engine
//! - [`read`]: [`ReadConnection`] and the read-side engine
//! - [`backup`]: object store backup with retry
//! - [`version_dir`]: on-disk layout of versioned tables
//! - [`config`]: [`StoreConfig`] and friends
//! - [`error`]: [`StoreError`]

mod attach;
pub mod backup;
pub mod config;
pub mod error;
pub mod read;
pub mod store;
mod sync;
pub mod version_dir;
pub mod write;

pub use backup::{BackupError, BackupStore};
pub use config::{BackupConfig, BackupProvider, RenamePolicy, RetryConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use read::ReadConnection;
pub use store::{ReplicatedStore, TableFormat, TableInfo};
pub use strata_duckdb::{EngineSettings, QueryResult, QueryResultRow};
pub use version_dir::Version;
pub use write::{CreateTableOptions, InsertStrategy, InsertTableOptions, WriteConnection};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
