//! In-process coordination store
//!
//! Holds every key in a sorted map and broadcasts changes to subscribers.
//! Reads and writes can be made to fail on demand, which the coordinator and
//! runtime tests use to exercise retry and cache fallback.

use crate::common::{Error, Result};
use crate::store::{apply_ops, KvBackend, KvEvent, TxnOp};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

pub struct MemoryKv {
    data: RwLock<BTreeMap<String, String>>,
    events: broadcast::Sender<KvEvent>,
    available: AtomicBool,
    failing_reads: AtomicU32,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            data: RwLock::new(BTreeMap::new()),
            events,
            available: AtomicBool::new(true),
            failing_reads: AtomicU32::new(0),
        }
    }

    /// Make every operation fail with `StoreUnavailable` while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` reads.
    pub fn fail_next_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Copy of every key and value.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.read().clone()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("memory store offline".into()))
        }
    }

    fn check_read(&self) -> Result<()> {
        self.check_available()?;
        let failing = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Error::StoreUnavailable("injected read failure".into()));
        }
        Ok(())
    }

    fn commit(&self, ops: Vec<TxnOp>) -> Result<()> {
        self.check_available()?;
        let events = {
            let mut data = self.data.write();
            apply_ops(&mut data, ops)
        };
        for event in events {
            // No receivers is fine
            let _ = self.events.send(event);
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_read()?;
        Ok(self.data.read().get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.check_read()?;
        let data = self.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_prefix() {
        let kv = MemoryKv::new();
        kv.put("redist_state_00_001_00002", "begin").await.unwrap();
        kv.put("redist_state_01_000_00001", "begin").await.unwrap();
        kv.put("redist_state_00_000_00007", "st=F").await.unwrap();

        let zone0 = kv.get_prefix("redist_state_00_").await.unwrap();
        assert_eq!(zone0.len(), 2);
        assert_eq!(zone0[0].0, "redist_state_00_000_00007");
        assert_eq!(kv.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subscribe_sees_changes() {
        let kv = MemoryKv::new();
        let mut rx = kv.subscribe();
        kv.put("version", "2").await.unwrap();
        kv.delete("version", false).await.unwrap();

        let put = rx.recv().await.unwrap();
        assert_eq!(put.value.as_deref(), Some("2"));
        let del = rx.recv().await.unwrap();
        assert_eq!(del.key, "version");
        assert_eq!(del.value, None);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let kv = MemoryKv::new();
        kv.put("k", "v").await.unwrap();
        kv.fail_next_reads(2);
        assert!(kv.get("k").await.unwrap_err().is_retryable());
        assert!(kv.get("k").await.is_err());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));

        kv.set_available(false);
        assert!(matches!(
            kv.put("k", "w").await,
            Err(Error::StoreUnavailable(_))
        ));
        kv.set_available(true);
        assert_eq!(kv.snapshot().get("k").map(String::as_str), Some("v"));
    }
}
