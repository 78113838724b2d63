//! TopologyStore: the two shard manager generations of a router
//!
//! Routing always reads the active generation without locking. A new
//! topology version is built in the standby slot, given time to connect,
//! published by flipping the active index, and only then is the previous
//! generation drained. Swaps are serialized; versions not newer than the
//! current one are ignored.

use crate::common::{Result, RetryPolicy, RuntimeConfig, StatsConfig};
use crate::runtime::markdown::ZoneMarkdown;
use crate::runtime::processor::ConnectionFactory;
use crate::runtime::shard_manager::{Route, ShardManager};
use crate::store::keys::{TAG_VERSION, TAG_ZONE_MARKDOWN};
use crate::store::{read_with_retry, ClusterCache, ClusterReader, KvBackend, KvEvent};
use crate::topology::Cluster;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

const READY_CHECK_INTERVAL: Duration = Duration::from_millis(100);

pub struct TopologyStore {
    slots: [ArcSwapOption<ShardManager>; 2],
    active: AtomicUsize,
    version: AtomicU32,
    swap_lock: Mutex<()>,

    reader: Arc<dyn ClusterReader>,
    cache: Option<ClusterCache>,
    factory: Arc<dyn ConnectionFactory>,
    markdown: Arc<ZoneMarkdown>,
    stats_cfg: StatsConfig,
    runtime_cfg: RuntimeConfig,
    retry: RetryPolicy,
}

impl TopologyStore {
    pub fn new(
        reader: Arc<dyn ClusterReader>,
        factory: Arc<dyn ConnectionFactory>,
        stats_cfg: StatsConfig,
        runtime_cfg: RuntimeConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            slots: [ArcSwapOption::empty(), ArcSwapOption::empty()],
            active: AtomicUsize::new(0),
            version: AtomicU32::new(0),
            swap_lock: Mutex::new(()),
            reader,
            cache: None,
            factory,
            markdown: Arc::new(ZoneMarkdown::new()),
            stats_cfg,
            runtime_cfg,
            retry,
        }
    }

    /// Fall back to `cache` when the store cannot be read during a swap.
    pub fn with_cache(mut self, cache: ClusterCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn markdown(&self) -> &Arc<ZoneMarkdown> {
        &self.markdown
    }

    /// Install the first generation.
    pub async fn init(&self, cluster: &Cluster, version: u32) -> Result<()> {
        let _guard = self.swap_lock.lock().await;
        cluster.validate()?;
        let mgr = Arc::new(ShardManager::new(
            cluster,
            self.factory.as_ref(),
            &self.stats_cfg,
            Arc::clone(&self.markdown),
            None,
        )?);
        self.wait_ready(&mgr, self.runtime_cfg.connect_timeout() * 2)
            .await;

        let idx = self.active.load(Ordering::Acquire);
        self.slots[idx].store(Some(mgr));
        self.version.store(version, Ordering::Release);
        tracing::info!("topology version {} installed", version);
        Ok(())
    }

    /// Manager currently used for routing.
    pub fn active(&self) -> Option<Arc<ShardManager>> {
        self.slots[self.active.load(Ordering::Acquire)].load_full()
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Route `key` through the active generation.
    pub fn route(&self, key: &[u8], write_quorum: usize) -> Option<Result<Route>> {
        self.active().map(|m| m.get_ss_processors(key, write_quorum))
    }

    async fn wait_ready(&self, mgr: &ShardManager, bound: Duration) {
        let deadline = tokio::time::Instant::now() + bound;
        while !mgr.is_connectivity_ok() {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("connections not ready after {:?}, continuing", bound);
                return;
            }
            tokio::time::sleep(READY_CHECK_INTERVAL.min(bound)).await;
        }
    }

    /// Switch to topology `version`. Returns whether a swap happened.
    pub async fn apply_version(&self, version: u32) -> Result<bool> {
        let _guard = self.swap_lock.lock().await;
        let current_version = self.version();
        if version <= current_version {
            tracing::debug!(
                "ignoring topology version {} (current {})",
                version,
                current_version
            );
            return Ok(false);
        }

        tracing::info!("new topology version={}", version);
        let (cluster, read_version) =
            read_with_retry(self.reader.as_ref(), self.cache.as_ref(), version, self.retry).await?;
        if read_version != version {
            tracing::warn!("announced version {} but read version {}", version, read_version);
        }

        let current = self.active();
        let standby = Arc::new(ShardManager::new(
            &cluster,
            self.factory.as_ref(),
            &self.stats_cfg,
            Arc::clone(&self.markdown),
            current.as_deref(),
        )?);
        self.wait_ready(&standby, self.runtime_cfg.standby_ready_timeout())
            .await;

        let prev = self.active.load(Ordering::Acquire);
        let next = (prev + 1) % 2;
        self.slots[next].store(Some(Arc::clone(&standby)));
        self.active.store(next, Ordering::Release);
        self.version.store(version, Ordering::Release);

        if let Some(old) = current {
            old.shutdown(Some(&standby)).await;
        }
        self.slots[prev].store(None);
        tracing::info!("shard manager updated to version {}", version);
        Ok(true)
    }

    async fn handle_event(&self, event: KvEvent) {
        match event.key.as_str() {
            TAG_VERSION => {
                let Some(version) = event.value.and_then(|v| v.trim().parse::<u32>().ok()) else {
                    return;
                };
                if let Err(e) = self.apply_version(version).await {
                    tracing::error!("failed to apply topology version {}: {}", version, e);
                }
            }
            TAG_ZONE_MARKDOWN => self.markdown.apply_value(event.value.as_deref()),
            _ => {}
        }
    }

    /// Re-read the watched keys after missing events.
    async fn resync(&self, kv: &dyn KvBackend) {
        for key in [TAG_ZONE_MARKDOWN, TAG_VERSION] {
            match kv.get(key).await {
                Ok(value) => {
                    self.handle_event(KvEvent {
                        key: key.to_string(),
                        value,
                    })
                    .await
                }
                Err(e) => tracing::warn!("resync of {} failed: {}", key, e),
            }
        }
    }

    /// Follow the store: `version` changes drive swaps and `zonemarkdown`
    /// drives the hard markdown. Ends when the store's event channel closes.
    pub fn spawn_watcher(self: Arc<Self>, kv: Arc<dyn KvBackend>) -> JoinHandle<()> {
        let mut events = BroadcastStream::new(kv.subscribe());
        tokio::spawn(async move {
            self.resync(kv.as_ref()).await;
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        tracing::warn!("watch lagged by {} events, resyncing", missed);
                        self.resync(kv.as_ref()).await;
                    }
                }
            }
            tracing::info!("topology watcher stopped");
        })
    }

    /// Drain the active generation.
    pub async fn shutdown(&self) {
        let _guard = self.swap_lock.lock().await;
        let idx = self.active.load(Ordering::Acquire);
        if let Some(mgr) = self.slots[idx].swap(None) {
            mgr.shutdown(None).await;
        }
    }
}
