//! File-backed coordination store
//!
//! The whole key space is one JSON object. Every operation takes an advisory
//! lock on `<path>.lck` (shared for reads, exclusive for writes), so several
//! operator processes on one host can share a store. Writes replace the file
//! atomically. Change events reach subscribers of this process only.

use crate::common::{Error, Result};
use crate::store::{apply_ops, KvBackend, KvEvent, TxnOp};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

pub struct FileKv {
    path: PathBuf,
    lock_path: PathBuf,
    events: broadcast::Sender<KvEvent>,
}

impl FileKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lck");
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tracing::debug!("file store at {}", path.display());
        Ok(Self {
            path,
            lock_path: PathBuf::from(lock_path),
            events,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| {
                Error::StoreUnavailable(format!("{}: {}", self.lock_path.display(), e))
            })
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Corrupted(format!("store file {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(Error::StoreUnavailable(format!(
                "{}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn save(&self, data: &BTreeMap<String, String>) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, data)?;
        tmp.as_file_mut().flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn read_locked<T>(&self, f: impl FnOnce(&BTreeMap<String, String>) -> T) -> Result<T> {
        let lock = self.lock_file()?;
        fs2::FileExt::lock_shared(&lock)?;
        let result = self.load().map(|data| f(&data));
        let _ = fs2::FileExt::unlock(&lock);
        result
    }

    fn commit(&self, ops: Vec<TxnOp>) -> Result<()> {
        let lock = self.lock_file()?;
        fs2::FileExt::lock_exclusive(&lock)?;
        let result = self.load().and_then(|mut data| {
            let events = apply_ops(&mut data, ops);
            self.save(&data)?;
            Ok(events)
        });
        let _ = fs2::FileExt::unlock(&lock);

        for event in result? {
            let _ = self.events.send(event);
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for FileKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.read_locked(|data| data.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.read_locked(|data| {
            data.range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.commit(vec![TxnOp::put(key, value)])
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<()> {
        let op = if prefix {
            TxnOp::delete_prefix(key)
        } else {
            TxnOp::delete(key)
        };
        self.commit(vec![op])
    }

    async fn txn(&self, ops: Vec<TxnOp>) -> Result<()> {
        self.commit(ops)
    }

    fn subscribe(&self) -> broadcast::Receiver<KvEvent> {
        self.events.subscribe()
    }
}
