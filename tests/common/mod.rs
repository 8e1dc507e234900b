//! Shared test fixtures for strata integration tests
//!
//! # Usage
//!
//! In your test file, add:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult,
};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use strata::{BackupStore, EngineSettings, ReplicatedStore, RetryConfig, StoreConfig};

// ============================================================================
// Logging
// ============================================================================

/// Install a test subscriber once; controlled by `RUST_LOG`
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("strata=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Store fixtures
// ============================================================================

/// A bucket shared between store instances, standing in for remote storage
pub fn bucket() -> Arc<dyn ObjectStore> {
    Arc::new(InMemory::new())
}

/// Object store that fails selected operations on demand
#[derive(Debug)]
pub struct FlakyStore {
    inner: Arc<dyn ObjectStore>,
    fail_puts: AtomicBool,
    delete_resets: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            fail_puts: AtomicBool::new(false),
            delete_resets: AtomicU32::new(0),
        }
    }

    /// Reject every upload with a permanent error while `fail` is set
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Drop the connection on the next `n` deletes
    pub fn reset_next_deletes(&self, n: u32) {
        self.delete_resets.store(n, Ordering::SeqCst);
    }

    fn check_put(&self, location: &ObjectPath) -> object_store::Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(object_store::Error::Generic {
                store: "flaky",
                source: format!("upload of {location} rejected").into(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for FlakyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlakyStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put_opts(
        &self,
        location: &ObjectPath,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.check_put(location)?;
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &ObjectPath,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.check_put(location)?;
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &ObjectPath,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &ObjectPath) -> object_store::Result<()> {
        let reset = self
            .delete_resets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if reset {
            return Err(object_store::Error::Generic {
                store: "flaky",
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )),
            });
        }
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&ObjectPath>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&ObjectPath>,
    ) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &ObjectPath, to: &ObjectPath) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(
        &self,
        from: &ObjectPath,
        to: &ObjectPath,
    ) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

/// Backup over `bucket` with retries that never sleep
pub fn backup(bucket: &Arc<dyn ObjectStore>, prefix: &str) -> BackupStore {
    BackupStore::new(
        Arc::clone(bucket),
        prefix,
        RetryConfig {
            max_attempts: 2,
            delay_ms: 0,
        },
        4,
    )
}

fn small_settings() -> EngineSettings {
    EngineSettings {
        max_memory: Some("256MB".into()),
        threads: Some(2),
        ..Default::default()
    }
}

/// Local configuration rooted at `dir`
pub fn config(dir: &Path) -> StoreConfig {
    let mut config = StoreConfig::new("test-db", dir);
    config.read_settings = small_settings();
    config.write_settings = small_settings();
    config
}

/// Open a store rooted at `dir`, backed up to `bucket` when given
pub async fn open_store(dir: &Path, bucket: Option<&Arc<dyn ObjectStore>>) -> ReplicatedStore {
    open_with(config(dir), bucket).await
}

/// Open a store from `config`, backed up to `bucket` when given
pub async fn open_with(config: StoreConfig, bucket: Option<&Arc<dyn ObjectStore>>) -> ReplicatedStore {
    init_logging();
    let backup = bucket.map(|b| backup(b, "test-db"));
    ReplicatedStore::open_with_backup(config, backup)
        .await
        .expect("Failed to open store")
}

// ============================================================================
// Query helpers
// ============================================================================

/// Single integer from a query on a fresh read connection
pub async fn scalar(store: &ReplicatedStore, sql: &str) -> i64 {
    let conn = store
        .acquire_read_connection()
        .await
        .expect("Failed to acquire read connection");
    conn.query_row(sql, [], |row| row.get(0))
        .unwrap_or_else(|e| panic!("query {sql:?} failed: {e}"))
}

/// Row count of `table`
pub async fn count(store: &ReplicatedStore, table: &str) -> i64 {
    scalar(store, &format!("SELECT count(*) FROM \"{table}\"")).await
}

/// First column of every row, as integers
pub async fn column(store: &ReplicatedStore, sql: &str) -> Vec<i64> {
    let conn = store
        .acquire_read_connection()
        .await
        .expect("Failed to acquire read connection");
    let mut stmt = conn.prepare(sql).expect("Failed to prepare");
    let rows = stmt
        .query_map([], |row| row.get::<_, i64>(0))
        .expect("Failed to query");
    rows.map(|r| r.expect("Failed to read row")).collect()
}

/// Names of the entries in a directory, sorted
pub fn dir_entries(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(path) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}
