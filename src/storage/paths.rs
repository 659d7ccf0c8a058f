//! Persistent-state layout
//!
//! One directory per database under the data root:
//! `<root>/<db>/{<db>.dbf, <db>.dat, <db>.wal, index/}`. The root is
//! taken from `DBMS_DATA_DIR` when set.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Environment variable overriding the data root.
pub const DATA_DIR_ENV: &str = "DBMS_DATA_DIR";

/// Default data root when the environment does not override it.
pub const DEFAULT_DATA_DIR: &str = "data";

/// Resolve the data root from the environment.
pub fn data_root() -> PathBuf {
    std::env::var_os(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

/// Subtree reserved for the external backup copier.
pub fn backups_root(root: &Path) -> PathBuf {
    root.join("backups")
}

/// File layout of one database.
#[derive(Debug, Clone)]
pub struct DbPaths {
    /// Database name
    pub db: String,
    /// `<root>/<db>`
    pub dir: PathBuf,
    /// Schema catalog
    pub dbf: PathBuf,
    /// Record heap
    pub dat: PathBuf,
    /// Write-ahead log
    pub wal: PathBuf,
    /// Index directory
    pub index_dir: PathBuf,
}

impl DbPaths {
    pub fn new(root: &Path, db: &str) -> Self {
        let dir = root.join(db);
        Self {
            db: db.to_string(),
            dbf: dir.join(format!("{db}.dbf")),
            dat: dir.join(format!("{db}.dat")),
            wal: dir.join(format!("{db}.wal")),
            index_dir: dir.join("index"),
            dir,
        }
    }

    /// `index/<table>.<indexName>.idx` — the table name stays in the
    /// filename so PRIMARY indexes of different tables never collide.
    pub fn index_file(&self, table: &str, index_name: &str) -> PathBuf {
        self.index_dir.join(format!("{table}.{index_name}.idx"))
    }

    /// Create the database directory and index subdirectory.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.index_dir)?;
        Ok(())
    }

    /// Does the database directory exist?
    pub fn exists(&self) -> bool {
        self.dbf.is_file()
    }
}

/// Database names found under the root, skipping the backups subtree.
pub fn list_databases(root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    if !root.is_dir() {
        return Ok(names);
    }
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "backups" {
            continue;
        }
        if DbPaths::new(root, &name).exists() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_layout() {
        let paths = DbPaths::new(Path::new("/tmp/data"), "shop");
        assert_eq!(paths.dbf, Path::new("/tmp/data/shop/shop.dbf"));
        assert_eq!(paths.dat, Path::new("/tmp/data/shop/shop.dat"));
        assert_eq!(paths.wal, Path::new("/tmp/data/shop/shop.wal"));
        assert_eq!(
            paths.index_file("users", "PRIMARY"),
            Path::new("/tmp/data/shop/index/users.PRIMARY.idx")
        );
    }

    #[test]
    fn test_list_databases_on_missing_root() {
        let names = list_databases(Path::new("/definitely/not/here")).unwrap();
        assert!(names.is_empty());
    }
}
