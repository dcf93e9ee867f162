// Cache and config path utilities.
// Resolves platform directories and maps request keys to entry files.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use sha2::{Digest, Sha256};

use super::key::RequestKey;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "scoped-fetch")
}

/// Get the base cache directory (~/.cache/scoped-fetch on Linux).
pub fn cache_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.cache_dir().to_path_buf())
}

/// Directory holding one file per cached response.
pub fn entries_dir() -> Option<PathBuf> {
    cache_dir().map(|dir| dir.join("entries"))
}

/// Path to the optional configuration file.
pub fn config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.json"))
}

/// Path of the file storing `key` under `root`.
pub fn entry_path(root: &Path, key: &RequestKey) -> PathBuf {
    root.join(format!("{}.json", key_digest(key)))
}

/// Hex SHA-256 of the key; keys contain characters unsafe in file names.
pub fn key_digest(key: &RequestKey) -> String {
    hex::encode(Sha256::digest(key.as_str().as_bytes()))
}
