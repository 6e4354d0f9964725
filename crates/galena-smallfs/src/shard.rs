//! One shard of the small-file store.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bytes::Bytes;
use galena_cluster::{Shard, ShardFactory};
use galena_replication::{RelaySource, ShardCore};
use galena_rpc::Env;
use galena_storage::{DEFAULT_SEGMENT_LIMIT, StorageError};
use galena_types::{CallError, ShardId};
use serde::{Deserialize, Serialize};

/// The logged mutation message. `data: None` is a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpdate {
    pub path: String,
    pub data: Option<String>,
}

impl FileUpdate {
    pub fn encode(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("file update serializes"))
    }

    pub fn decode(msg: &[u8]) -> Result<Self, CallError> {
        serde_json::from_slice(msg)
            .map_err(|e| CallError::Other(format!("malformed update message: {e}")))
    }
}

/// One shard's files plus its replication core.
pub struct FileShard {
    sid: ShardId,
    /// Set exactly once in [`FileShard::open`], after the Arc exists (the
    /// core needs a weak handle back to this shard as its relay source).
    core: OnceLock<Arc<ShardCore>>,
    /// Serializes mutations so file state and log order agree.
    write_lock: Mutex<()>,
}

impl FileShard {
    pub fn open(env: &Env, sid: &ShardId, segment_limit: u64) -> Result<Arc<Self>, CallError> {
        let shard = Arc::new(Self {
            sid: sid.clone(),
            core: OnceLock::new(),
            write_lock: Mutex::new(()),
        });
        let weak: Weak<FileShard> = Arc::downgrade(&shard);
        let source: Weak<dyn RelaySource> = weak;
        let lpath = format!("file/{}", sid.dir_name());
        let core = ShardCore::open(env, &lpath, source, segment_limit)
            .map_err(|e| CallError::Storage(e.to_string()))?;
        shard
            .core
            .set(Arc::new(core))
            .unwrap_or_else(|_| unreachable!("core set once"));
        Ok(shard)
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.sid
    }

    fn shard_core(&self) -> &Arc<ShardCore> {
        self.core.get().expect("core set in open")
    }

    fn file_path(&self, path: &str) -> PathBuf {
        self.shard_core().path().join(path)
    }

    /// Keys must be clean relative paths; names starting with `.` are
    /// reserved for bookkeeping (`.rep`).
    fn check_key(path: &str) -> Result<(), CallError> {
        let reason = if path.is_empty() {
            Some("empty")
        } else if path.starts_with('/') {
            Some("absolute")
        } else if path.contains("..") {
            Some("contains '..'")
        } else if path.split('/').any(|part| part.starts_with('.')) {
            Some("reserved '.' prefix")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(CallError::InvalidKey {
                key: path.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }

    /// The contents of `path`.
    pub fn read(&self, path: &str) -> Result<String, CallError> {
        Self::check_key(path)?;
        match fs::read_to_string(self.file_path(path)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CallError::NotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(CallError::Storage(e.to_string())),
        }
    }

    /// Writes `path` and logs the mutation for replication. The mutation
    /// is in the replication log before this returns: a write the client
    /// saw acknowledged is always durable enough to ship.
    pub fn write(&self, path: &str, data: &str) -> Result<(), CallError> {
        Self::check_key(path)?;
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        self.store_file(path, data)?;
        let msg = FileUpdate {
            path: path.to_string(),
            data: Some(data.to_string()),
        }
        .encode();
        self.log_mutation(&msg)
    }

    /// Removes `path`, logging a delete. Removing an absent file is a
    /// quiet no-op (nothing to replicate either).
    pub fn remove(&self, path: &str) -> Result<(), CallError> {
        Self::check_key(path)?;
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        match fs::remove_file(self.file_path(path)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CallError::Storage(e.to_string())),
        }
        let msg = FileUpdate {
            path: path.to_string(),
            data: None,
        }
        .encode();
        self.log_mutation(&msg)
    }

    /// Every file in this shard, as relative paths.
    pub fn list(&self) -> Result<Vec<String>, CallError> {
        self.walk()
            .map_err(|e| CallError::Storage(e.to_string()))
    }

    fn store_file(&self, path: &str, data: &str) -> Result<(), CallError> {
        let full = self.file_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| CallError::Storage(e.to_string()))?;
        }
        fs::write(full, data).map_err(|e| CallError::Storage(e.to_string()))
    }

    fn log_mutation(&self, msg: &Bytes) -> Result<(), CallError> {
        self.shard_core().append(msg).map_err(|e| {
            tracing::error!(shard = %self.sid, error = %e, "cannot log mutation");
            CallError::Storage(e.to_string())
        })?;
        Ok(())
    }

    fn walk(&self) -> Result<Vec<String>, StorageError> {
        let root = self.shard_core().path().to_path_buf();
        let mut keys = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                // Bookkeeping lives in dot-directories; skip them.
                if name.to_str().is_some_and(|n| n.starts_with('.')) {
                    continue;
                }
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&root)
                    && let Some(rel) = rel.to_str()
                {
                    keys.push(rel.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

impl RelaySource for FileShard {
    fn list(&self) -> Result<Vec<String>, StorageError> {
        self.walk()
    }

    /// Snapshot of one key at the current log position: replaying the
    /// returned updates reproduces the key on an empty peer.
    fn dump(&self, key: &str) -> Result<(i64, Vec<Bytes>), StorageError> {
        let seq = self.shard_core().end()?;
        let updates = match fs::read_to_string(self.file_path(key)) {
            Ok(data) => vec![
                FileUpdate {
                    path: key.to_string(),
                    data: Some(data),
                }
                .encode(),
            ],
            // Deleted since listing: nothing to copy.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok((seq, updates))
    }

    fn get(&self, seq: i64) -> Result<Bytes, StorageError> {
        self.shard_core().get(seq)
    }

    fn end(&self) -> Result<i64, StorageError> {
        self.shard_core().end()
    }

    fn log_dir(&self) -> PathBuf {
        self.shard_core().log_dir().to_path_buf()
    }
}

impl Shard for FileShard {
    fn core(&self) -> &ShardCore {
        self.shard_core()
    }

    /// Applies a replicated mutation: the inverse of the logged message.
    /// Replication traffic is not re-logged here; only masters append.
    fn apply_update(&self, msg: &Bytes) -> Result<(), CallError> {
        let update = FileUpdate::decode(msg)?;
        Self::check_key(&update.path)?;
        match update.data {
            Some(data) => {
                let full = self.file_path(&update.path);
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent).map_err(|e| CallError::Storage(e.to_string()))?;
                }
                fs::write(full, data).map_err(|e| CallError::Storage(e.to_string()))
            }
            None => match fs::remove_file(self.file_path(&update.path)) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(CallError::Storage(e.to_string())),
            },
        }
    }
}

/// Factory registering the small-file data type with a [`DataNode`].
///
/// [`DataNode`]: galena_cluster::DataNode
pub struct FileShardFactory {
    segment_limit: u64,
}

impl FileShardFactory {
    pub fn new(segment_limit: u64) -> Self {
        Self { segment_limit }
    }
}

impl Default for FileShardFactory {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_LIMIT)
    }
}

impl ShardFactory for FileShardFactory {
    type Shard = FileShard;

    fn type_id(&self) -> &'static str {
        "file"
    }

    fn make_shard(&self, env: &Env, shard: &ShardId) -> Result<Arc<FileShard>, CallError> {
        FileShard::open(env, shard, self.segment_limit)
    }

    fn route_key(&self, msg: &Bytes) -> Result<String, CallError> {
        Ok(FileUpdate::decode(msg)?.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use galena_test_harness::LoopGrid;
    use tempfile::TempDir;

    fn shard(tmp: &TempDir) -> (Env, Arc<FileShard>) {
        let env = Env::new(
            Arc::new(LoopGrid::new()),
            tmp.path().join("data"),
            "SmallFS-node1",
            1,
        );
        let shard = FileShard::open(&env, &ShardId::root(), DEFAULT_SEGMENT_LIMIT).unwrap();
        (env, shard)
    }

    #[test]
    fn write_read_list_remove() {
        let tmp = TempDir::new().unwrap();
        let (env, shard) = shard(&tmp);

        shard.write("fred", "hi").unwrap();
        shard.write("sub/barney", "dino").unwrap();
        assert_eq!(shard.read("fred").unwrap(), "hi");
        assert_eq!(shard.list().unwrap(), vec!["fred", "sub/barney"]);

        shard.remove("fred").unwrap();
        assert!(matches!(
            shard.read("fred"),
            Err(CallError::NotFound { .. })
        ));
        env.pool().flush();
    }

    #[test]
    fn mutations_reach_the_replication_log_in_order() {
        let tmp = TempDir::new().unwrap();
        let (env, shard) = shard(&tmp);

        shard.write("fred", "hi").unwrap();
        shard.write("fred", "lo").unwrap();
        shard.remove("fred").unwrap();
        env.pool().flush();

        let core = shard.core();
        assert_eq!(core.end().unwrap(), 3);
        assert_eq!(
            FileUpdate::decode(&core.get(1).unwrap()).unwrap(),
            FileUpdate {
                path: "fred".into(),
                data: Some("lo".into())
            }
        );
        assert_eq!(
            FileUpdate::decode(&core.get(2).unwrap()).unwrap(),
            FileUpdate {
                path: "fred".into(),
                data: None
            }
        );
    }

    #[test]
    fn apply_update_is_the_inverse_of_the_log_message() {
        let tmp = TempDir::new().unwrap();
        let (_env, shard) = shard(&tmp);

        shard
            .apply_update(&FileUpdate {
                path: "wilma".into(),
                data: Some("pebbles".into()),
            }
            .encode())
            .unwrap();
        assert_eq!(shard.read("wilma").unwrap(), "pebbles");

        shard
            .apply_update(&FileUpdate {
                path: "wilma".into(),
                data: None,
            }
            .encode())
            .unwrap();
        assert!(shard.read("wilma").is_err());
        // Applying updates never grows this replica's own log.
        assert_eq!(shard.core().end().unwrap(), 0);
    }

    #[test]
    fn dump_reflects_presence_and_log_position() {
        let tmp = TempDir::new().unwrap();
        let (env, shard) = shard(&tmp);
        shard.write("fred", "hi").unwrap();
        env.pool().flush();

        let (seq, updates) = RelaySource::dump(shard.as_ref(), "fred").unwrap();
        assert_eq!(seq, 1);
        assert_eq!(updates.len(), 1);

        let (_, missing) = RelaySource::dump(shard.as_ref(), "nobody").unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn hostile_keys_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let (_env, shard) = shard(&tmp);
        for key in ["", "/etc/passwd", "a/../b", ".rep", "sub/.hidden"] {
            assert!(
                matches!(shard.read(key), Err(CallError::InvalidKey { .. })),
                "{key:?} accepted"
            );
        }
    }

    #[test]
    fn is_new_flips_on_first_write() {
        let tmp = TempDir::new().unwrap();
        let (env, shard) = shard(&tmp);
        assert!(shard.core().is_new());
        shard.write("fred", "hi").unwrap();
        env.pool().flush();
        assert!(!shard.core().is_new());
    }
}
