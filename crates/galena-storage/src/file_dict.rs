//! A key→bytes map persisted as one file per key in a directory.

use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::cap_dict::Store;
use crate::error::{Result, StorageError};

/// Adapts a local directory to a dictionary-of-bytes interface.
///
/// Keys become file names, so they must not contain a path separator or
/// `..`, and must not start with `.` (reserved for bookkeeping files).
pub struct FileDict {
    dir: PathBuf,
}

impl FileDict {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let reason = if key.is_empty() {
            Some("empty")
        } else if key.contains('/') || key.contains('\\') {
            Some("contains a path separator")
        } else if key.contains("..") {
            Some("contains '..'")
        } else if key.starts_with('.') {
            Some("reserved '.' prefix")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason,
            });
        }
        Ok(self.dir.join(key))
    }
}

impl Store for FileDict {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match fs::read(self.key_path(key)?) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.key_path(key)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(path, value)?;
        Ok(())
    }

    /// Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.key_path(key)?.exists())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            if let Some(name) = entry?.file_name().to_str() {
                keys.push(name.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn set_get_delete() {
        let dir = TempDir::new().unwrap();
        let d = FileDict::new(dir.path().join("sink"));

        d.put("fred", b"Fred").unwrap();
        assert_eq!(d.get("fred").unwrap().unwrap().as_ref(), b"Fred");
        assert!(d.contains("fred").unwrap());
        assert_eq!(d.keys().unwrap(), vec!["fred"]);

        d.remove("fred").unwrap();
        assert_eq!(d.get("fred").unwrap(), None);
        d.remove("fred").unwrap(); // absent delete tolerated
    }

    #[test]
    fn addresses_work_as_keys() {
        let dir = TempDir::new().unwrap();
        let d = FileDict::new(dir.path());
        d.put("file@SmallFS-node2.SmallFSRep", b"{}").unwrap();
        assert_eq!(d.keys().unwrap(), vec!["file@SmallFS-node2.SmallFSRep"]);
    }

    #[test]
    fn hostile_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let d = FileDict::new(dir.path());
        for key in ["", "a/b", "..", "a..b", ".hidden", "a\\b"] {
            assert!(
                matches!(d.put(key, b"x"), Err(StorageError::InvalidKey { .. })),
                "{key:?} accepted"
            );
        }
    }

    #[test]
    fn missing_directory_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let d = FileDict::new(dir.path().join("never-written"));
        assert!(d.keys().unwrap().is_empty());
        assert_eq!(d.get("fred").unwrap(), None);
        assert!(!d.contains("fred").unwrap());
    }
}
