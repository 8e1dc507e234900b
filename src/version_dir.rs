//! Versioned table directory layout
//!
//! Pure file-layout logic for one tree of tables. The store keeps two such
//! trees (`write/` and `read/`); both share the same layout:
//!
//! ```text
//! <root>/<table>/version.txt           # current version, plaintext
//! <root>/<table>/<version>/meta.json   # {"Format":"db"|"","ViewSQL":"..."}
//! <root>/<table>/<version>/data.db     # physical tables only
//! ```
//!
//! A version is a self-contained directory. Nothing here locks; every caller
//! holds the store's write lock. New data always goes into a fresh version
//! directory and the pointer is switched only once that directory is complete.

use crate::error::{Result, StoreError};
use object_store::path::PathPart;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Name of the version pointer file inside a table directory
pub const VERSION_FILE: &str = "version.txt";

/// Name of the metadata record inside a version directory
pub const META_FILE: &str = "meta.json";

/// Name of the physical data file inside a version directory
pub const DATA_FILE: &str = "data.db";

/// Table version: wall-clock milliseconds, strictly increasing per table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u64);

impl Version {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self {
        Version(v)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Version {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse().map(Version)
    }
}

/// Hands out strictly increasing versions for one store
#[derive(Debug, Default)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next version, later than both the wall clock and `after`
    pub fn next_after(&self, after: Option<Version>) -> Version {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let floor = after.map(|v| v.0 + 1).unwrap_or(0);
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(floor).max(prev + 1);
            match self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Version(candidate),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Physical format of a version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageFormat {
    /// Table data in `data.db`
    #[serde(rename = "db")]
    Db,
    /// No physical data (views)
    #[default]
    #[serde(rename = "")]
    None,
}

/// Per-version metadata record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    #[serde(rename = "Format", default)]
    pub format: StorageFormat,
    #[serde(rename = "ViewSQL", default)]
    pub view_sql: String,
}

impl TableMeta {
    pub fn physical() -> Self {
        Self {
            format: StorageFormat::Db,
            view_sql: String::new(),
        }
    }

    pub fn view(sql: impl Into<String>) -> Self {
        Self {
            format: StorageFormat::None,
            view_sql: sql.into(),
        }
    }

    pub fn is_view(&self) -> bool {
        !self.view_sql.is_empty()
    }
}

/// Serialize `meta` into `version_dir`
pub fn write_meta(version_dir: &Path, meta: &TableMeta) -> Result<()> {
    let bytes = serde_json::to_vec(meta)?;
    let path = version_dir.join(META_FILE);
    fs::write(&path, bytes).map_err(|e| StoreError::io(format!("write {}", path.display()), e))
}

/// Read the metadata record of `version_dir`
pub fn read_meta(version_dir: &Path) -> Result<TableMeta> {
    let path = version_dir.join(META_FILE);
    let bytes =
        fs::read(&path).map_err(|e| StoreError::io(format!("read {}", path.display()), e))?;
    let meta: TableMeta = serde_json::from_slice(&bytes)?;
    if !meta.is_view() && meta.format != StorageFormat::Db {
        return Err(StoreError::corrupted(
            version_dir.display().to_string(),
            "metadata names neither a data file nor a view",
        ));
    }
    Ok(meta)
}

/// One tree of versioned tables
#[derive(Debug, Clone)]
pub struct TableDirectory {
    root: PathBuf,
}

impl TableDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    pub fn version_dir(&self, table: &str, version: Version) -> PathBuf {
        self.table_dir(table).join(version.to_string())
    }

    pub fn data_file(&self, table: &str, version: Version) -> PathBuf {
        self.version_dir(table, version).join(DATA_FILE)
    }

    /// Create the root if it is missing
    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .map_err(|e| StoreError::io(format!("create {}", self.root.display()), e))
    }

    /// Current version of `table`, `None` if the table is unknown
    pub fn current_version(&self, table: &str) -> Result<Option<Version>> {
        let path = self.table_dir(table).join(VERSION_FILE);
        match fs::read_to_string(&path) {
            Ok(contents) => contents
                .parse()
                .map(Some)
                .map_err(|e| StoreError::corrupted(table, format!("bad version pointer: {e}"))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(format!("read {}", path.display()), e)),
        }
    }

    /// Point `table` at `version`.
    ///
    /// The version directory must already be complete. The pointer is written
    /// to a sibling file and renamed over the old one.
    pub fn publish_version(&self, table: &str, version: Version) -> Result<()> {
        let dir = self.table_dir(table);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(format!("create {}", dir.display()), e))?;
        let tmp = dir.join(format!("{VERSION_FILE}.tmp"));
        fs::write(&tmp, version.to_string())
            .map_err(|e| StoreError::io(format!("write {}", tmp.display()), e))?;
        fs::rename(&tmp, dir.join(VERSION_FILE))
            .map_err(|e| StoreError::io(format!("publish {}", dir.display()), e))
    }

    /// Create a new, empty version directory
    pub fn create_version_dir(&self, table: &str, version: Version) -> Result<PathBuf> {
        let dir = self.version_dir(table, version);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(format!("create {}", dir.display()), e))?;
        Ok(dir)
    }

    /// Move a version directory to a new version id, reusing its files
    pub fn rename_version(&self, table: &str, from: Version, to: Version) -> Result<PathBuf> {
        let src = self.version_dir(table, from);
        let dst = self.version_dir(table, to);
        fs::rename(&src, &dst)
            .map_err(|e| StoreError::io(format!("rename {} to {}", src.display(), dst.display()), e))?;
        Ok(dst)
    }

    /// Move a whole table directory
    pub fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        let src = self.table_dir(from);
        let dst = self.table_dir(to);
        fs::rename(&src, &dst)
            .map_err(|e| StoreError::io(format!("rename {} to {}", src.display(), dst.display()), e))
    }

    /// Names of all table directories, sorted
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(format!("list {}", self.root.display()), e)),
        };
        let mut tables = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("list tables", e))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            match entry.file_name().to_str() {
                Some(name) if !name.starts_with('.') => tables.push(name.to_string()),
                _ => {}
            }
        }
        tables.sort();
        Ok(tables)
    }

    /// Names of every subdirectory of `table` (versions and stray directories)
    pub fn list_version_dirs(&self, table: &str) -> Result<Vec<String>> {
        let dir = self.table_dir(table);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(format!("list {}", dir.display()), e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("list versions", e))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove a table and all its versions; missing tables are fine
    pub fn remove_table(&self, table: &str) -> Result<()> {
        remove_dir_if_exists(&self.table_dir(table))
    }

    /// Remove one version directory; missing versions are fine
    pub fn remove_version(&self, table: &str, version: Version) -> Result<()> {
        remove_dir_if_exists(&self.version_dir(table, version))
    }

    /// Remove everything in `table` except its current version.
    ///
    /// A table with no pointer is removed entirely. Returns the names removed.
    pub fn prune(&self, table: &str) -> Result<Vec<String>> {
        let Some(current) = self.current_version(table)? else {
            self.remove_table(table)?;
            return Ok(vec![table.to_string()]);
        };
        let keep = current.to_string();
        let mut removed = Vec::new();
        for name in self.list_version_dirs(table)? {
            if name != keep {
                remove_dir_if_exists(&self.table_dir(table).join(&name))?;
                removed.push(format!("{table}/{name}"));
            }
        }
        Ok(removed)
    }

    /// Copy one version of `table` from this tree into `dest` and publish it there
    pub fn copy_version_to(&self, dest: &TableDirectory, table: &str, version: Version) -> Result<()> {
        let src = self.version_dir(table, version);
        let dst = dest.version_dir(table, version);
        remove_dir_if_exists(&dst)?;
        copy_dir(&src, &dst)?;
        dest.publish_version(table, version)
    }

    /// On-disk size of a table's current data file, 0 if absent
    pub fn data_size(&self, table: &str) -> u64 {
        match self.current_version(table) {
            Ok(Some(version)) => fs::metadata(self.data_file(table, version))
                .map(|m| m.len())
                .unwrap_or(0),
            _ => 0,
        }
    }
}

/// Check that `name` can be used as a table directory
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StoreError::invalid_name(name, "name is empty"));
    }
    if name.starts_with('.') {
        return Err(StoreError::invalid_name(name, "name starts with '.'"));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(StoreError::invalid_name(name, "name contains a path separator"));
    }
    // backup keys are listed back in their escaped form
    if PathPart::from(name).as_ref() != name {
        return Err(StoreError::invalid_name(
            name,
            "name contains characters that are escaped in object store keys",
        ));
    }
    Ok(())
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(format!("remove {}", path.display()), e)),
    }
}

/// Recursively copy `src` into a new directory `dst`
pub(crate) fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).map_err(|e| StoreError::io(format!("create {}", dst.display()), e))?;
    let entries =
        fs::read_dir(src).map_err(|e| StoreError::io(format!("list {}", src.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(format!("list {}", src.display()), e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| StoreError::io(format!("stat {}", from.display()), e))?;
        if file_type.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|e| {
                StoreError::io(format!("copy {} to {}", from.display(), to.display()), e)
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_unknown_table_has_no_version() {
        let dir = tempdir().unwrap();
        let tree = TableDirectory::new(dir.path());
        assert_eq!(tree.current_version("missing").unwrap(), None);
    }

    #[test]
    fn test_publish_and_read_back() {
        let dir = tempdir().unwrap();
        let tree = TableDirectory::new(dir.path());
        let v = Version::from(1700000000000);
        tree.create_version_dir("t", v).unwrap();
        tree.publish_version("t", v).unwrap();
        assert_eq!(tree.current_version("t").unwrap(), Some(v));
        assert!(!tree.table_dir("t").join("version.txt.tmp").exists());
    }

    #[test]
    fn test_pointer_is_trimmed() {
        let dir = tempdir().unwrap();
        let tree = TableDirectory::new(dir.path());
        std::fs::create_dir_all(tree.table_dir("t")).unwrap();
        std::fs::write(tree.table_dir("t").join(VERSION_FILE), "  42\n").unwrap();
        assert_eq!(tree.current_version("t").unwrap(), Some(Version::from(42)));
    }

    #[test]
    fn test_garbage_pointer_is_corruption() {
        let dir = tempdir().unwrap();
        let tree = TableDirectory::new(dir.path());
        std::fs::create_dir_all(tree.table_dir("t")).unwrap();
        std::fs::write(tree.table_dir("t").join(VERSION_FILE), "not-a-version").unwrap();
        assert!(matches!(
            tree.current_version("t"),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_meta_wire_format() {
        let dir = tempdir().unwrap();
        write_meta(dir.path(), &TableMeta::physical()).unwrap();
        let raw = std::fs::read_to_string(dir.path().join(META_FILE)).unwrap();
        assert!(raw.contains("\"Format\":\"db\""));
        assert_eq!(read_meta(dir.path()).unwrap(), TableMeta::physical());

        write_meta(dir.path(), &TableMeta::view("SELECT 1")).unwrap();
        let meta = read_meta(dir.path()).unwrap();
        assert!(meta.is_view());
        assert_eq!(meta.view_sql, "SELECT 1");
    }

    #[test]
    fn test_meta_from_foreign_writer() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(META_FILE),
            r#"{"ViewSQL":"","Format":"db"}"#,
        )
        .unwrap();
        assert_eq!(read_meta(dir.path()).unwrap().format, StorageFormat::Db);
    }

    #[test]
    fn test_empty_meta_is_corrupted() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(META_FILE), "{}").unwrap();
        assert!(read_meta(dir.path()).is_err());
    }

    #[test]
    fn test_prune_keeps_only_current() {
        let dir = tempdir().unwrap();
        let tree = TableDirectory::new(dir.path());
        for v in [1u64, 2, 3] {
            tree.create_version_dir("t", Version::from(v)).unwrap();
        }
        tree.publish_version("t", Version::from(2)).unwrap();
        let removed = tree.prune("t").unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(tree.list_version_dirs("t").unwrap(), vec!["2".to_string()]);
    }

    #[test]
    fn test_prune_removes_unpublished_table() {
        let dir = tempdir().unwrap();
        let tree = TableDirectory::new(dir.path());
        tree.create_version_dir("orphan", Version::from(5)).unwrap();
        tree.prune("orphan").unwrap();
        assert!(tree.list_tables().unwrap().is_empty());
    }

    #[test]
    fn test_copy_version_between_trees() {
        let dir = tempdir().unwrap();
        let write = TableDirectory::new(dir.path().join("write"));
        let read = TableDirectory::new(dir.path().join("read"));
        let v = Version::from(9);
        let vdir = write.create_version_dir("t", v).unwrap();
        std::fs::write(vdir.join(DATA_FILE), b"payload").unwrap();
        write_meta(&vdir, &TableMeta::physical()).unwrap();
        write.publish_version("t", v).unwrap();

        write.copy_version_to(&read, "t", v).unwrap();
        assert_eq!(read.current_version("t").unwrap(), Some(v));
        assert_eq!(std::fs::read(read.data_file("t", v)).unwrap(), b"payload");
        assert_eq!(read.data_size("t"), 7);
    }

    #[test]
    fn test_clock_is_strictly_increasing() {
        let clock = VersionClock::new();
        let mut prev = clock.next_after(None);
        for _ in 0..1000 {
            let next = clock.next_after(None);
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_clock_outruns_future_versions() {
        let clock = VersionClock::new();
        let far = Version::from(u64::MAX / 2);
        assert!(clock.next_after(Some(far)) > far);
    }

    #[test]
    fn test_table_names() {
        validate_table_name("events_2024").unwrap();
        validate_table_name("Mixed Case").unwrap();
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name(".hidden").is_err());
        assert!(validate_table_name("a/b").is_err());
        assert!(validate_table_name("a\\b").is_err());
        validate_table_name("daily-sales (eu)").unwrap();
        for name in ["verkäufe", "sales[2024]", "a%20b", "x~y", "what?", "star*", "a|b", "{t}", "h#1", "tab\tname"] {
            assert!(
                matches!(validate_table_name(name), Err(StoreError::InvalidTableName { .. })),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_list_tables_skips_files() {
        let dir = tempdir().unwrap();
        let tree = TableDirectory::new(dir.path());
        std::fs::write(dir.path().join("stray.db"), b"").unwrap();
        tree.create_version_dir("b", Version::from(1)).unwrap();
        tree.create_version_dir("a", Version::from(1)).unwrap();
        assert_eq!(tree.list_tables().unwrap(), vec!["a", "b"]);
    }
}
