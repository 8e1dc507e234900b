//! Remote backup of versioned tables
//!
//! Mirrors the local write tree into an object store under a per-database
//! prefix:
//!
//! ```text
//! <prefix>/<table>/version.txt
//! <prefix>/<table>/<version>/meta.json
//! <prefix>/<table>/<version>/data.db
//! ```
//!
//! The pointer is always uploaded after the version's files, so a reader that
//! follows `version.txt` never sees a partial version. Transient network
//! failures (connection resets, broken pipes) are retried with a fixed delay.

use crate::config::{BackupConfig, BackupProvider, RetryConfig};
use crate::version_dir::{TableDirectory, Version, VERSION_FILE};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::future::Future;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Result type for backup operations
pub type BackupResult<T> = std::result::Result<T, BackupError>;

/// Errors from the remote backup
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid remote object {key}: {detail}")]
    Invalid { key: String, detail: String },

    #[error("Failed to create {provider} store: {detail}")]
    Provider {
        provider: &'static str,
        detail: String,
    },
}

impl BackupError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BackupError::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns `true` if the failure is a dropped connection worth retrying.
    ///
    /// Walks the source chain looking for the I/O error kinds produced by a
    /// reset or half-closed transport stream.
    pub fn is_transient(&self) -> bool {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = current {
            if let Some(io) = err.downcast_ref::<std::io::Error>() {
                if matches!(
                    io.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::BrokenPipe
                        | ErrorKind::UnexpectedEof
                ) {
                    return true;
                }
                // io::Error hides its payload from source()
                if let Some(inner) = io.get_ref() {
                    current = Some(inner);
                    continue;
                }
            }
            current = err.source();
        }
        false
    }
}

/// Client-level retry policy for cloud providers.
///
/// The client's own retries are switched off so that [`BackupStore::with_retry`]
/// is the only layer deciding what is retried and how often.
fn client_retry() -> object_store::RetryConfig {
    object_store::RetryConfig {
        max_retries: 0,
        ..Default::default()
    }
}

/// Build an object store client for the configured provider
fn create_object_store(provider: &BackupProvider) -> BackupResult<Arc<dyn ObjectStore>> {
    match provider {
        BackupProvider::Local { path } => {
            std::fs::create_dir_all(path)
                .map_err(|e| BackupError::io(format!("create {}", path.display()), e))?;

            let store = object_store::local::LocalFileSystem::new_with_prefix(path).map_err(
                |e| BackupError::Provider {
                    provider: "local",
                    detail: e.to_string(),
                },
            )?;

            Ok(Arc::new(store))
        }

        BackupProvider::Memory => Ok(Arc::new(object_store::memory::InMemory::new())),

        BackupProvider::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
        } => {
            let mut builder = object_store::aws::AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .with_region(region)
                .with_retry(client_retry());

            if let Some(endpoint) = endpoint {
                builder = builder.with_endpoint(endpoint).with_allow_http(true);
            }

            if let Some(key_id) = access_key_id {
                builder = builder.with_access_key_id(key_id);
            }

            if let Some(secret) = secret_access_key {
                builder = builder.with_secret_access_key(secret);
            }

            let store = builder.build().map_err(|e| BackupError::Provider {
                provider: "S3",
                detail: e.to_string(),
            })?;

            Ok(Arc::new(store))
        }

        BackupProvider::Azure {
            account,
            container,
            access_key,
        } => {
            let mut builder = object_store::azure::MicrosoftAzureBuilder::new()
                .with_account(account)
                .with_container_name(container)
                .with_retry(client_retry());

            if let Some(key) = access_key {
                builder = builder.with_access_key(key);
            }

            let store = builder.build().map_err(|e| BackupError::Provider {
                provider: "Azure",
                detail: e.to_string(),
            })?;

            Ok(Arc::new(store))
        }

        BackupProvider::Gcs {
            bucket,
            service_account_key,
        } => {
            let mut builder = object_store::gcp::GoogleCloudStorageBuilder::new()
                .with_bucket_name(bucket)
                .with_retry(client_retry());

            if let Some(key_path) = service_account_key {
                builder = builder.with_service_account_path(key_path.to_string_lossy());
            }

            let store = builder.build().map_err(|e| BackupError::Provider {
                provider: "GCS",
                detail: e.to_string(),
            })?;

            Ok(Arc::new(store))
        }
    }
}

/// Handle to one database's remote backup
#[derive(Clone)]
pub struct BackupStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    retry: RetryConfig,
    concurrency: usize,
}

impl std::fmt::Debug for BackupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupStore")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl BackupStore {
    /// Wrap an existing object store
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        retry: RetryConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Connect to the provider named in `config`
    pub fn from_config(config: &BackupConfig, prefix: impl Into<String>) -> BackupResult<Self> {
        let store = create_object_store(&config.provider)?;
        Ok(Self::new(
            store,
            prefix,
            config.retry,
            config.download_concurrency,
        ))
    }

    /// The underlying object store
    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn key(&self, parts: &[&str]) -> ObjectPath {
        let mut key = self.prefix.clone();
        for part in parts {
            if !key.is_empty() {
                key.push('/');
            }
            key.push_str(part);
        }
        ObjectPath::from(key)
    }

    fn root(&self) -> ObjectPath {
        ObjectPath::from(self.prefix.as_str())
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts
    pub(crate) async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> BackupResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackupResult<T>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(what, attempt, "Remote operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        what,
                        attempt,
                        max_attempts,
                        delay_ms = self.retry.delay_ms,
                        error = %e,
                        "Transient remote failure, retrying"
                    );
                    tokio::time::sleep(self.retry.delay()).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stream a local file into `key`
    async fn upload_file(&self, local: &Path, key: &ObjectPath) -> BackupResult<()> {
        self.with_retry("upload", || self.upload_file_once(local, key))
            .await
    }

    async fn upload_file_once(&self, local: &Path, key: &ObjectPath) -> BackupResult<()> {
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| BackupError::io(format!("open {}", local.display()), e))?;
        let mut writer = BufWriter::new(Arc::clone(&self.store), key.clone());
        if let Err(e) = tokio::io::copy(&mut file, &mut writer).await {
            let _ = writer.abort().await;
            return Err(BackupError::io(format!("upload {}", key), e));
        }
        writer
            .shutdown()
            .await
            .map_err(|e| BackupError::io(format!("complete {}", key), e))
    }

    async fn put(&self, key: &ObjectPath, data: Bytes) -> BackupResult<()> {
        self.with_retry("put", || self.put_once(key, data.clone()))
            .await
    }

    async fn put_once(&self, key: &ObjectPath, data: Bytes) -> BackupResult<()> {
        self.store.put(key, PutPayload::from(data)).await?;
        Ok(())
    }

    async fn get(&self, key: &ObjectPath) -> BackupResult<Option<Bytes>> {
        self.with_retry("get", || self.get_once(key)).await
    }

    async fn get_once(&self, key: &ObjectPath) -> BackupResult<Option<Bytes>> {
        match self.store.get(key).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self, prefix: &ObjectPath) -> BackupResult<Vec<ObjectPath>> {
        self.with_retry("list", || self.list_keys_once(prefix))
            .await
    }

    async fn list_keys_once(&self, prefix: &ObjectPath) -> BackupResult<Vec<ObjectPath>> {
        let keys: Vec<ObjectPath> = self
            .store
            .list(Some(prefix))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;
        Ok(keys)
    }

    async fn delete(&self, key: &ObjectPath) -> BackupResult<()> {
        self.with_retry("delete", || self.delete_once(key)).await
    }

    async fn delete_once(&self, key: &ObjectPath) -> BackupResult<()> {
        match self.store.delete(key).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_prefix(&self, prefix: &ObjectPath) -> BackupResult<()> {
        let keys = self.list_keys(prefix).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        debug!(prefix = %prefix, objects = keys.len(), "Deleted remote objects");
        Ok(())
    }

    async fn list_tables_once(&self) -> BackupResult<Vec<String>> {
        let root = self.root();
        let prefix = if self.prefix.is_empty() {
            None
        } else {
            Some(&root)
        };
        let listing = self.store.list_with_delimiter(prefix).await?;
        Ok(listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.filename().map(str::to_string))
            .collect())
    }

    /// Names of every table with any object under the prefix
    pub async fn list_tables(&self) -> BackupResult<Vec<String>> {
        let mut tables = self
            .with_retry("list", || self.list_tables_once())
            .await?;
        tables.sort();
        Ok(tables)
    }

    /// Current remote version of `table`, `None` if it has no pointer
    pub async fn read_version(&self, table: &str) -> BackupResult<Option<Version>> {
        let key = self.key(&[table, VERSION_FILE]);
        let Some(bytes) = self.get(&key).await? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&bytes);
        text.parse().map(Some).map_err(|e| BackupError::Invalid {
            key: key.to_string(),
            detail: format!("bad version pointer {text:?}: {e}"),
        })
    }

    /// Upload one local version of `table` and then point the remote at it
    pub async fn upload_version(
        &self,
        tree: &TableDirectory,
        table: &str,
        version: Version,
    ) -> BackupResult<()> {
        let dir = tree.version_dir(table, version);
        let version_str = version.to_string();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| BackupError::io(format!("list {}", dir.display()), e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackupError::io(format!("list {}", dir.display()), e))?
        {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    files.push(name.to_string());
                }
            }
        }
        files.sort();

        for name in &files {
            let key = self.key(&[table, &version_str, name]);
            self.upload_file(&dir.join(name), &key).await?;
        }
        self.put(
            &self.key(&[table, VERSION_FILE]),
            Bytes::from(version_str.clone()),
        )
        .await?;
        debug!(table, version = %version, files = files.len(), "Uploaded table version");
        Ok(())
    }

    /// Download every object of a remote version into `dest`.
    ///
    /// Objects are fetched concurrently and keep their path relative to the
    /// version. `dest` is created if needed.
    pub async fn download_version(
        &self,
        table: &str,
        version: Version,
        dest: &Path,
    ) -> BackupResult<usize> {
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| BackupError::io(format!("create {}", dest.display()), e))?;

        let prefix = self.key(&[table, &version.to_string()]);
        let keys = self.list_keys(&prefix).await?;

        let mut files = Vec::with_capacity(keys.len());
        for key in keys {
            let relative: Vec<String> = match key.prefix_match(&prefix) {
                Some(parts) => parts.map(|part| part.as_ref().to_string()).collect(),
                None => Vec::new(),
            };
            if relative.is_empty() {
                return Err(BackupError::Invalid {
                    key: key.to_string(),
                    detail: format!("not under {prefix}"),
                });
            }
            let local = relative.iter().fold(dest.to_path_buf(), |path, part| path.join(part));
            files.push((key, local));
        }

        let count = files.len();
        stream::iter(files)
            .map(|(key, local)| async move {
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| BackupError::io(format!("create {}", parent.display()), e))?;
                }
                self.download_file(&key, &local).await
            })
            .buffer_unordered(self.concurrency)
            .try_collect::<Vec<()>>()
            .await?;
        debug!(table, version = %version, objects = count, "Downloaded table version");
        Ok(count)
    }

    async fn download_file(&self, key: &ObjectPath, local: &Path) -> BackupResult<()> {
        self.with_retry("download", || self.download_file_once(key, local))
            .await
    }

    async fn download_file_once(&self, key: &ObjectPath, local: &Path) -> BackupResult<()> {
        let result = self.store.get(key).await?;
        let mut body = result.into_stream();
        let mut file = tokio::fs::File::create(local)
            .await
            .map_err(|e| BackupError::io(format!("create {}", local.display()), e))?;
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?)
                .await
                .map_err(|e| BackupError::io(format!("write {}", local.display()), e))?;
        }
        file.flush()
            .await
            .map_err(|e| BackupError::io(format!("flush {}", local.display()), e))
    }

    /// Remove one version of a table; missing objects are fine
    pub async fn delete_version(&self, table: &str, version: Version) -> BackupResult<()> {
        self.delete_prefix(&self.key(&[table, &version.to_string()]))
            .await
    }

    /// Remove a table and all its versions; missing objects are fine
    pub async fn delete_table(&self, table: &str) -> BackupResult<()> {
        self.delete_prefix(&self.key(&[table])).await
    }

    /// Remove everything under this database's prefix
    pub async fn delete_all(&self) -> BackupResult<()> {
        self.delete_prefix(&self.root()).await
    }
}
