// Filesystem-backed cache store.
// One JSON file per entry, written atomically via a temp file and rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::Builder;

use crate::error::{FetchError, Result};

use super::key::RequestKey;
use super::paths;
use super::store::{CacheEntry, CacheStore};

const TEMP_SUFFIX: &str = ".tmp";

/// Durable store rooted at a directory.
///
/// Only files named after a key digest belong to the store; anything else
/// under the root is left untouched.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store under the platform cache directory.
    pub fn in_cache_dir() -> Result<Self> {
        paths::entries_dir()
            .map(Self::new)
            .ok_or_else(|| FetchError::Config("no cache directory for this platform".to_string()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_entry(path: &Path) -> Result<Option<CacheEntry>> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(path)?;
        let entry: CacheEntry = serde_json::from_str(&contents)?;
        Ok(Some(entry))
    }

    fn write_entry(&self, entry: &CacheEntry) -> Result<()> {
        fs::create_dir_all(&self.root)?;

        let path = paths::entry_path(&self.root, &entry.key);
        let json = serde_json::to_string(entry)?;

        // Write atomically via a temp file unique to this writer
        let mut file = Builder::new()
            .prefix(".")
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.root)?;
        file.write_all(json.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&path).map_err(|err| err.error)?;

        Ok(())
    }

    /// Files under the root that the store owns: digest-named entries and
    /// temp files left behind by interrupted writes.
    fn owned_files(&self) -> Vec<PathBuf> {
        let Ok(dir) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        dir.filter_map(|item| item.ok().map(|item| item.path()))
            .filter(|path| is_entry_file(path) || is_temp_file(path))
            .collect()
    }

    fn entry_files(&self) -> Vec<PathBuf> {
        self.owned_files()
            .into_iter()
            .filter(|path| is_entry_file(path))
            .collect()
    }

    fn delete_file(path: &Path) {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %err, "failed to delete cache file");
            }
        }
    }
}

impl CacheStore for DiskStore {
    fn get(&self, key: &RequestKey) -> Option<CacheEntry> {
        let path = paths::entry_path(&self.root, key);
        match Self::read_entry(&path) {
            // A digest collision would hand back another key's data.
            Ok(Some(entry)) if &entry.key == key => Some(entry),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "unreadable cache entry");
                Self::delete_file(&path);
                None
            }
        }
    }

    fn set(&self, entry: CacheEntry) {
        if let Err(err) = self.write_entry(&entry) {
            tracing::warn!(key = %entry.key, error = %err, "failed to persist cache entry");
        }
    }

    fn delete_where(&self, predicate: &dyn Fn(&CacheEntry) -> bool) -> usize {
        let mut removed = 0;
        for path in self.entry_files() {
            match Self::read_entry(&path) {
                Ok(Some(entry)) if predicate(&entry) => {
                    Self::delete_file(&path);
                    removed += 1;
                }
                Ok(_) => {}
                Err(_) => Self::delete_file(&path),
            }
        }
        removed
    }

    fn clear_all(&self) {
        for path in self.owned_files() {
            Self::delete_file(&path);
        }
    }

    /// Counts readable entries; corrupt files are not counted.
    fn len(&self) -> usize {
        self.entry_files()
            .iter()
            .filter(|path| matches!(Self::read_entry(path), Ok(Some(_))))
            .count()
    }
}

/// `<sha256 hex>.json`, as produced by [`paths::entry_path`].
fn is_entry_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
        && path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| stem.len() == 64 && stem.bytes().all(|b| b.is_ascii_hexdigit()))
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.') && name.ends_with(TEMP_SUFFIX))
}
