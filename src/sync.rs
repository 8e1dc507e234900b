//! Reconciliation between the write tree, the read tree and the backup
//!
//! - `sync_write` restores the write tree from the backup when they may have
//!   diverged (on open, and after a failed replication).
//! - `replicate` pushes one table's current local state to the backup.
//! - `sync_read` refreshes the read tree from the write tree and swaps in a
//!   new read engine.
//!
//! All of these run under the write lock.

use crate::backup::{BackupError, BackupStore};
use crate::error::{Result, ResultExt, StoreError};
use crate::read::ReadEngine;
use crate::store::{StoreInner, WriteState};
use crate::version_dir::{read_meta, validate_table_name, TableDirectory, Version};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

impl StoreInner {
    /// Make the write tree match the backup.
    ///
    /// Skipped when nothing changed since the last successful replication.
    /// Tables whose replication failed earlier are pushed first so their
    /// local versions are not overwritten by the older remote copy.
    pub(crate) async fn sync_write(&self, state: &mut WriteState) -> Result<()> {
        if !state.dirty {
            return Ok(());
        }
        let Some(backup) = &self.backup else {
            state.dirty = false;
            return Ok(());
        };

        let pending: Vec<String> = state.unreplicated.iter().cloned().collect();
        for table in pending {
            self.replicate(&table).await.during("replicate", &table)?;
            state.unreplicated.remove(&table);
            self.prune_local(&table);
        }

        let mut remote_tables = BTreeSet::new();
        for table in backup.list_tables().await? {
            if let Err(e) = validate_table_name(&table) {
                warn!(table = %table, error = %e, "Ignoring remote entry with invalid table name");
                continue;
            }
            let remote = match backup.read_version(&table).await {
                Ok(Some(version)) => version,
                Ok(None) => {
                    warn!(table = %table, "Remote table has no version pointer, deleting it");
                    delete_remote_table(backup, &table).await;
                    continue;
                }
                Err(e @ BackupError::Invalid { .. }) => {
                    warn!(table = %table, error = %e, "Remote version pointer is unreadable, deleting table");
                    delete_remote_table(backup, &table).await;
                    continue;
                }
                Err(e) => return Err(StoreError::from(e).during("restore", &table)),
            };

            let local = self.write_tree.current_version(&table)?;
            let present = self.write_tree.version_dir(&table, remote).is_dir();
            if local == Some(remote) && present {
                remote_tables.insert(table);
                continue;
            }

            match self.restore_table(&table, remote).await {
                Ok(()) => {
                    info!(
                        db = %self.config.db_identifier,
                        table = %table,
                        version = %remote,
                        "Restored table from backup"
                    );
                    remote_tables.insert(table);
                }
                Err(e @ StoreError::Corrupted { .. }) => {
                    warn!(table = %table, error = %e, "Remote table is corrupted, deleting it");
                    delete_remote_table(backup, &table).await;
                }
                Err(e) => return Err(e.during("restore", &table)),
            }
        }

        for table in self.write_tree.list_tables()? {
            if !remote_tables.contains(&table) {
                debug!(table = %table, "Removing local table absent from backup");
                self.write_tree.remove_table(&table)?;
            }
        }
        state.dirty = false;
        Ok(())
    }

    async fn restore_table(&self, table: &str, version: Version) -> Result<()> {
        let Some(backup) = &self.backup else {
            return Ok(());
        };
        self.write_tree.remove_table(table)?;
        let dir = self.write_tree.version_dir(table, version);
        backup.download_version(table, version, &dir).await?;
        if let Err(e) = read_meta(&dir) {
            self.write_tree.remove_table(table)?;
            return Err(StoreError::corrupted(table, e.to_string()));
        }
        self.write_tree.publish_version(table, version)
    }

    /// Push the local state of `table` to the backup.
    ///
    /// Uploads the current version and then deletes the version the remote
    /// pointed at before. A table with no local version is deleted remotely.
    pub(crate) async fn replicate(&self, table: &str) -> Result<()> {
        let Some(backup) = &self.backup else {
            return Ok(());
        };
        let Some(version) = self.write_tree.current_version(table)? else {
            backup.delete_table(table).await?;
            return Ok(());
        };
        let previous = backup.read_version(table).await?;
        backup
            .upload_version(&self.write_tree, table, version)
            .await?;
        if let Some(previous) = previous.filter(|p| *p != version) {
            if let Err(e) = backup.delete_version(table, previous).await {
                warn!(table, version = %previous, error = %e, "Failed to delete superseded remote version");
            }
        }
        debug!(table, version = %version, "Replicated table");
        Ok(())
    }

    /// Delete superseded versions of `table` from the write tree
    pub(crate) fn prune_local(&self, table: &str) {
        match self.write_tree.prune(table) {
            Ok(removed) if !removed.is_empty() => {
                debug!(table, removed = ?removed, "Removed superseded local versions");
            }
            Ok(_) => {}
            Err(e) => warn!(table, error = %e, "Failed to remove superseded local versions"),
        }
    }

    /// Clean the write tree after a crash.
    ///
    /// Unpublished version directories are removed. If the pointer names a
    /// directory that no longer exists (a version bump interrupted between
    /// rename and publish) the newest remaining version is adopted.
    pub(crate) fn prune_orphans(&self) -> Result<()> {
        let tree = &self.write_tree;
        for table in tree.list_tables()? {
            let current = match tree.current_version(&table) {
                Ok(current) => current,
                Err(e @ StoreError::Corrupted { .. }) => {
                    warn!(table = %table, error = %e, "Local version pointer is unreadable, removing table");
                    tree.remove_table(&table)?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Some(current) = current {
                if !tree.version_dir(&table, current).is_dir() {
                    let newest = tree
                        .list_version_dirs(&table)?
                        .iter()
                        .filter_map(|name| name.parse::<Version>().ok())
                        .filter(|v| *v > current)
                        .max();
                    match newest {
                        Some(version) if read_meta(&tree.version_dir(&table, version)).is_ok() => {
                            warn!(table = %table, version = %version, "Adopting interrupted version bump");
                            tree.publish_version(&table, version)?;
                        }
                        _ => {
                            warn!(table = %table, version = %current, "Current version is missing, removing table");
                            tree.remove_table(&table)?;
                            continue;
                        }
                    }
                }
            }
            let removed = tree.prune(&table)?;
            if !removed.is_empty() {
                info!(table = %table, removed = ?removed, "Removed orphaned versions");
            }
        }
        Ok(())
    }

    /// Refresh the read tree and swap in a new read engine
    pub(crate) async fn sync_read(&self) -> Result<()> {
        let (read, write) = (self.read_tree.clone(), self.write_tree.clone());
        let settings = self.read_settings.clone();
        let init = self.config.init_statements.clone();
        let engine = tokio::task::spawn_blocking(move || {
            copy_changed_versions(&write, &read)?;
            ReadEngine::build(&read, &write, &settings, &init)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))??;

        let previous = self.read.write().await.replace(engine);
        drop(previous);

        self.gc_read();
        Ok(())
    }

    /// Remove tables and versions from the read tree that the write tree no longer has
    fn gc_read(&self) {
        let tables = match self.read_tree.list_tables() {
            Ok(tables) => tables,
            Err(e) => {
                warn!(error = %e, "Failed to list read tree");
                return;
            }
        };
        for table in tables {
            let result = match self.write_tree.current_version(&table) {
                Ok(None) => self.read_tree.remove_table(&table),
                Ok(Some(current)) => self.remove_read_versions_except(&table, current),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(table = %table, error = %e, "Failed to clean read tree");
            }
        }
    }

    fn remove_read_versions_except(&self, table: &str, keep: Version) -> Result<()> {
        let keep = keep.to_string();
        for name in self.read_tree.list_version_dirs(table)? {
            if name != keep {
                std::fs::remove_dir_all(self.read_tree.table_dir(table).join(&name))
                    .map_err(|e| StoreError::io(format!("remove {table}/{name}"), e))?;
            }
        }
        Ok(())
    }
}

async fn delete_remote_table(backup: &BackupStore, table: &str) {
    if let Err(e) = backup.delete_table(table).await {
        warn!(table, error = %e, "Failed to delete remote table");
    }
}

/// Copy every table whose current version the read tree lacks
fn copy_changed_versions(write: &TableDirectory, read: &TableDirectory) -> Result<()> {
    for table in write.list_tables()? {
        let Some(version) = write.current_version(&table)? else {
            continue;
        };
        if read.current_version(&table).ok().flatten() == Some(version)
            && read.version_dir(&table, version).is_dir()
        {
            continue;
        }
        write.copy_version_to(read, &table, version).during("sync read", &table)?;
        debug!(table = %table, version = %version, "Copied version to read tree");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version_dir::{write_meta, TableMeta, DATA_FILE};
    use tempfile::tempdir;

    fn publish(tree: &TableDirectory, table: &str, version: u64, payload: &[u8]) {
        let version = Version::from(version);
        let dir = tree.create_version_dir(table, version).unwrap();
        std::fs::write(dir.join(DATA_FILE), payload).unwrap();
        write_meta(&dir, &TableMeta::physical()).unwrap();
        tree.publish_version(table, version).unwrap();
    }

    #[test]
    fn test_copy_changed_versions() {
        let dir = tempdir().unwrap();
        let write = TableDirectory::new(dir.path().join("write"));
        let read = TableDirectory::new(dir.path().join("read"));
        publish(&write, "a", 1, b"one");
        publish(&write, "b", 1, b"bee");

        copy_changed_versions(&write, &read).unwrap();
        assert_eq!(read.current_version("a").unwrap(), Some(Version::from(1)));
        assert_eq!(read.current_version("b").unwrap(), Some(Version::from(1)));

        // an up-to-date copy is left alone
        std::fs::write(read.data_file("b", Version::from(1)), b"untouched").unwrap();
        publish(&write, "a", 2, b"two");
        copy_changed_versions(&write, &read).unwrap();
        assert_eq!(read.current_version("a").unwrap(), Some(Version::from(2)));
        assert_eq!(std::fs::read(read.data_file("a", Version::from(2))).unwrap(), b"two");
        assert_eq!(std::fs::read(read.data_file("b", Version::from(1))).unwrap(), b"untouched");
    }

    #[test]
    fn test_garbled_read_pointer_is_recopied() {
        let dir = tempdir().unwrap();
        let write = TableDirectory::new(dir.path().join("write"));
        let read = TableDirectory::new(dir.path().join("read"));
        publish(&write, "a", 3, b"three");
        copy_changed_versions(&write, &read).unwrap();
        std::fs::write(read.table_dir("a").join(crate::version_dir::VERSION_FILE), b"??").unwrap();

        copy_changed_versions(&write, &read).unwrap();
        assert_eq!(read.current_version("a").unwrap(), Some(Version::from(3)));
    }
}
