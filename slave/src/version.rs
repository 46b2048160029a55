//! Durable "last fully applied version" scalar.
//!
//! A single JSON file `{"version": N}`, rewritten with write-temp-then-
//! rename so a crash mid-write can never leave a torn file. `update` only
//! moves forward; replayed diffs cannot roll the version back.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub type VersionResult<T> = Result<T, VersionError>;

#[derive(Debug, Error)]
pub enum VersionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupt version file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionData {
    version: i64,
}

pub struct VersionStore {
    path: PathBuf,
    version: RwLock<i64>,
}

impl VersionStore {
    /// Load the version file, creating it at 0 if absent.
    pub fn open(path: impl Into<PathBuf>) -> VersionResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let version = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<VersionData>(&raw)?.version,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                write_atomic(&path, 0)?;
                0
            }
            Err(err) => return Err(err.into()),
        };

        info!(path = %path.display(), version, "version store loaded");
        Ok(Self {
            path,
            version: RwLock::new(version),
        })
    }

    pub fn current(&self) -> i64 {
        *self.version.read()
    }

    /// Advance to `new_version` iff it is greater than the current one.
    /// Returns whether the store moved.
    pub fn update(&self, new_version: i64) -> VersionResult<bool> {
        let mut guard = self.version.write();
        if new_version <= *guard {
            return Ok(false);
        }
        write_atomic(&self.path, new_version)?;
        *guard = new_version;
        Ok(true)
    }
}

fn write_atomic(path: &Path, version: i64) -> VersionResult<()> {
    let data = serde_json::to_vec_pretty(&VersionData { version })?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &data)?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_starts_at_zero_and_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/version.json");
        let store = VersionStore::open(&path).unwrap();
        assert_eq!(store.current(), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_update_only_moves_forward() {
        let dir = TempDir::new().unwrap();
        let store = VersionStore::open(dir.path().join("version.json")).unwrap();

        assert!(store.update(3).unwrap());
        assert_eq!(store.current(), 3);

        // neither a replay nor an equal version moves the store
        assert!(!store.update(2).unwrap());
        assert!(!store.update(3).unwrap());
        assert_eq!(store.current(), 3);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("version.json");
        {
            let store = VersionStore::open(&path).unwrap();
            store.update(7).unwrap();
        }
        let store = VersionStore::open(&path).unwrap();
        assert_eq!(store.current(), 7);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("version.json");
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            VersionStore::open(&path),
            Err(VersionError::Corrupt(_))
        ));
    }
}
