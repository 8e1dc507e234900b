//! Attaching table versions to an engine
//!
//! Every physical table lives in its own file, attached under
//! `<table>__data__db` and exposed through a view named after the table.
//! View tables are created after all physical attachments, oldest first,
//! and retried until a pass makes no progress so views may depend on each
//! other.

use crate::error::{Result, StoreError};
use crate::version_dir::{read_meta, TableDirectory, Version};
use strata_duckdb::sql::quote_ident;
use strata_duckdb::{Engine, EngineError};
use tracing::{debug, error};

/// Attachment alias of a table's physical file
pub(crate) fn data_alias(table: &str) -> String {
    format!("{table}__data__db")
}

/// Fully qualified name of a table's physical relation
pub(crate) fn data_relation(table: &str) -> String {
    format!("{}.\"default\"", quote_ident(&data_alias(table)))
}

/// A view that failed to bind
#[derive(Debug)]
pub(crate) struct ViewFailure {
    pub table: String,
    pub error: EngineError,
}

/// Attach the current version of every table.
///
/// Files come from `files`; which version is current is always taken from
/// `versions` (the write tree), so tables dropped there are never
/// re-attached from a stale copy. A table whose metadata cannot be read or
/// whose file cannot be attached is removed from `files` and reported as
/// corrupted. Views that fail to bind are returned to the caller.
pub(crate) fn attach_tables(
    engine: &Engine,
    files: &TableDirectory,
    versions: &TableDirectory,
    read_only: bool,
) -> Result<Vec<ViewFailure>> {
    let mut views: Vec<(Version, String, String)> = Vec::new();
    for table in files.list_tables()? {
        let Some(version) = versions.current_version(&table)? else {
            continue;
        };
        let version_dir = files.version_dir(&table, version);

        let meta = match read_meta(&version_dir) {
            Ok(meta) => meta,
            Err(e) => {
                error!(table = %table, version = %version, error = %e, "Unreadable table metadata");
                files.remove_version(&table, version)?;
                return Err(StoreError::corrupted(&table, e.to_string()));
            }
        };

        if meta.is_view() {
            views.push((version, table, meta.view_sql));
            continue;
        }

        let file = files.data_file(&table, version);
        if let Err(e) = engine.attach(&file, &data_alias(&table), read_only) {
            error!(table = %table, version = %version, error = %e, "Failed to attach table");
            files.remove_table(&table)?;
            return Err(StoreError::corrupted(&table, e.to_string()));
        }
        engine.create_or_replace_view(&table, &format!("SELECT * FROM {}", data_relation(&table)))?;
        debug!(table = %table, version = %version, read_only, "Attached table");
    }

    views.sort();
    Ok(create_views(engine, views))
}

fn create_views(engine: &Engine, mut pending: Vec<(Version, String, String)>) -> Vec<ViewFailure> {
    loop {
        let before = pending.len();
        let mut failures = Vec::new();
        let mut remaining = Vec::new();
        for (version, table, sql) in pending {
            match engine.create_or_replace_view(&table, &sql) {
                Ok(()) => debug!(table = %table, "Created view"),
                Err(error) => {
                    failures.push(ViewFailure {
                        table: table.clone(),
                        error,
                    });
                    remaining.push((version, table, sql));
                }
            }
        }
        if remaining.is_empty() || remaining.len() == before {
            return failures;
        }
        pending = remaining;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version_dir::{write_meta, TableMeta};
    use strata_duckdb::EngineSettings;
    use tempfile::tempdir;

    fn engine() -> Engine {
        Engine::open(None, &EngineSettings::default(), &[]).unwrap()
    }

    fn physical(tree: &TableDirectory, table: &str, version: u64, query: &str) {
        let version = Version::from(version);
        let dir = tree.create_version_dir(table, version).unwrap();
        let writer = engine();
        writer
            .attach(&tree.data_file(table, version), "staging", false)
            .unwrap();
        writer
            .execute_batch(&format!("CREATE TABLE staging.\"default\" AS ({query})"))
            .unwrap();
        writer.detach_if_exists("staging").unwrap();
        write_meta(&dir, &TableMeta::physical()).unwrap();
        tree.publish_version(table, version).unwrap();
    }

    fn view(tree: &TableDirectory, table: &str, version: u64, sql: &str) {
        let version = Version::from(version);
        let dir = tree.create_version_dir(table, version).unwrap();
        write_meta(&dir, &TableMeta::view(sql)).unwrap();
        tree.publish_version(table, version).unwrap();
    }

    #[test]
    fn test_views_resolve_in_any_order() {
        let dir = tempdir().unwrap();
        let tree = TableDirectory::new(dir.path());
        physical(&tree, "base", 1, "SELECT 1 AS x");
        // "a_top" sorts before its dependency and is older than it
        view(&tree, "a_top", 2, "SELECT x + 1 AS y FROM mid");
        view(&tree, "mid", 3, "SELECT x FROM base");

        let engine = engine();
        let failures = attach_tables(&engine, &tree, &tree, true).unwrap();
        assert!(failures.is_empty(), "{failures:?}");
        let result = engine.query("SELECT y FROM a_top").unwrap();
        assert_eq!(result.rows[0].values[0], serde_json::json!(2));
    }

    #[test]
    fn test_broken_view_is_reported() {
        let dir = tempdir().unwrap();
        let tree = TableDirectory::new(dir.path());
        view(&tree, "broken", 1, "SELECT * FROM nowhere");
        let failures = attach_tables(&engine(), &tree, &tree, false).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].table, "broken");
    }

    #[test]
    fn test_corrupt_file_removes_table() {
        let dir = tempdir().unwrap();
        let tree = TableDirectory::new(dir.path());
        let v = Version::from(1);
        let vdir = tree.create_version_dir("bad", v).unwrap();
        std::fs::write(vdir.join(crate::version_dir::DATA_FILE), b"not a database").unwrap();
        write_meta(&vdir, &TableMeta::physical()).unwrap();
        tree.publish_version("bad", v).unwrap();

        let err = attach_tables(&engine(), &tree, &tree, true).unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { .. }));
        assert!(!tree.table_dir("bad").exists());
    }

    #[test]
    fn test_versions_come_from_authoritative_tree() {
        let dir = tempdir().unwrap();
        let files = TableDirectory::new(dir.path().join("read"));
        let versions = TableDirectory::new(dir.path().join("write"));
        physical(&files, "dropped", 1, "SELECT 1 AS x");

        let engine = engine();
        attach_tables(&engine, &files, &versions, true).unwrap();
        assert!(engine.query("SELECT * FROM dropped").is_err());
    }
}
