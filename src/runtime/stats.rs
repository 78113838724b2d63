//! Per-node health statistics and soft markdown
//!
//! Request processors report one [`ProcStat`] per request through a bounded
//! queue; a single collector task folds them into sliding timeout windows and
//! an EMA of processing time. A node whose timeouts within the window reach
//! the threshold is soft-marked down until its expiry passes. Routing reads
//! the markdown table without locks.

use crate::common::{timestamp_now, StatsConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const QUEUE_CAPACITY: usize = 5000;

/// Outcome of one request against one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub zone: u32,
    pub node: u32,
    pub timeout: bool,
    /// Processing time in microseconds; 0 when unknown
    pub proc_time_us: i32,
}

/// Collector-only state
#[derive(Debug)]
struct Windows {
    /// Slot receiving timeouts; `window_size` until the first timeout
    current: u32,
    timeouts: Vec<Vec<u32>>,
    expiration: Vec<u64>,
}

pub struct ClusterStats {
    num_zones: u32,
    max_nodes: u32,
    window_size: u32,
    window_unit: u64,
    cfg: StatsConfig,

    markdown: Vec<AtomicBool>,
    ema: Vec<AtomicI32>,
    windows: Mutex<Windows>,

    tx: mpsc::Sender<ProcStat>,
    rx: Mutex<Option<mpsc::Receiver<ProcStat>>>,
    quit: watch::Sender<bool>,
}

impl ClusterStats {
    pub fn new(num_zones: u32, max_nodes: u32, cfg: &StatsConfig) -> Self {
        let slots = (num_zones * max_nodes) as usize;
        let window_size = cfg.timeout_window_size.max(1);
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (quit, _) = watch::channel(false);

        Self {
            num_zones,
            max_nodes,
            window_size,
            window_unit: cfg.timeout_window_unit_secs.max(1),
            cfg: cfg.clone(),
            markdown: (0..slots).map(|_| AtomicBool::new(false)).collect(),
            ema: (0..slots).map(|_| AtomicI32::new(0)).collect(),
            windows: Mutex::new(Windows {
                current: window_size,
                timeouts: vec![vec![0; window_size as usize]; slots],
                expiration: vec![0; slots],
            }),
            tx,
            rx: Mutex::new(Some(rx)),
            quit,
        }
    }

    fn index(&self, zone: u32, node: u32) -> Option<usize> {
        (zone < self.num_zones && node < self.max_nodes)
            .then(|| (zone * self.max_nodes + node) as usize)
    }

    /// Queue a sample; dropped when the queue is full.
    pub fn send(&self, stat: ProcStat) {
        if self.tx.try_send(stat).is_err() {
            tracing::trace!("stats queue full, sample dropped");
        }
    }

    pub fn is_marked_down(&self, zone: u32, node: u32) -> bool {
        self.index(zone, node)
            .map(|i| self.markdown[i].load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Moving average of processing time in microseconds.
    pub fn ema_proc_time(&self, zone: u32, node: u32) -> i32 {
        self.index(zone, node)
            .map(|i| self.ema[i].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// `(zone, node)` of every soft-marked node.
    pub fn marked_down(&self) -> Vec<(u32, u32)> {
        let mut nodes = Vec::new();
        for zone in 0..self.num_zones {
            for node in 0..self.max_nodes {
                if self.is_marked_down(zone, node) {
                    nodes.push((zone, node));
                }
            }
        }
        nodes
    }

    /// Fold one sample in, at unix time `now`.
    pub fn process_sample(&self, stat: &ProcStat, now: u64) {
        let Some(idx) = self.index(stat.zone, stat.node) else {
            return;
        };

        if stat.timeout {
            let mut w = self.windows.lock();
            if w.current >= self.window_size {
                w.current = ((now / self.window_unit) % self.window_size as u64) as u32;
            }
            let current = w.current as usize;
            w.timeouts[idx][current] += 1;
            let count: u32 = w.timeouts[idx].iter().sum();

            if count >= self.cfg.markdown_threshold && !self.markdown[idx].load(Ordering::Acquire) {
                w.expiration[idx] = now + self.cfg.markdown_expiration_base_secs;
                self.markdown[idx].store(true, Ordering::Release);
                tracing::info!(
                    "markdown: node {}-{}, exp:{}, timeout count: {}",
                    stat.zone,
                    stat.node,
                    w.expiration[idx],
                    count
                );
            }
        }

        if stat.proc_time_us > 0 {
            let prev = self.ema[idx].load(Ordering::Relaxed) as f32;
            let window = (self.cfg.ema_window_size + 1) as f32;
            let next = (stat.proc_time_us as f32 - prev) * 2.0 / window + prev + 0.5;
            self.ema[idx].store(next as i32, Ordering::Relaxed);
        }
    }

    /// Advance the window to `now`, clearing the oldest slot, and mark up
    /// every node whose markdown expired.
    pub fn markup_at(&self, now: u64) {
        let mut w = self.windows.lock();
        w.current = ((now / self.window_unit) % self.window_size as u64) as u32;
        let oldest = ((w.current + 1) % self.window_size) as usize;

        for zone in 0..self.num_zones {
            for node in 0..self.max_nodes {
                let idx = (zone * self.max_nodes + node) as usize;
                w.timeouts[idx][oldest] = 0;

                if self.markdown[idx].load(Ordering::Acquire) && now > w.expiration[idx] {
                    tracing::info!("markup: node {}-{}", zone, node);
                    w.expiration[idx] = 0;
                    self.markdown[idx].store(false, Ordering::Release);
                }
            }
        }
    }

    /// Start the collector task. Only the first call starts one.
    pub fn run(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.rx.lock().take()?;
        let mut quit = self.quit.subscribe();
        let stats = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(stats.window_unit));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = quit.changed() => break,
                    sample = rx.recv() => match sample {
                        Some(stat) => stats.process_sample(&stat, timestamp_now()),
                        None => break,
                    },
                    _ = ticker.tick() => stats.markup_at(timestamp_now()),
                }
            }
            tracing::info!("cluster stats collector quit");
        }))
    }

    pub fn quit(&self) {
        let _ = self.quit.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(threshold: u32) -> StatsConfig {
        StatsConfig {
            timeout_stats_enabled: true,
            resp_time_stats_enabled: true,
            markdown_threshold: threshold,
            markdown_expiration_base_secs: 300,
            ..Default::default()
        }
    }

    fn timeout(zone: u32, node: u32) -> ProcStat {
        ProcStat {
            zone,
            node,
            timeout: true,
            proc_time_us: 0,
        }
    }

    #[test]
    fn test_markdown_after_threshold() {
        let stats = ClusterStats::new(3, 2, &cfg(3));
        let now = 6000;
        stats.process_sample(&timeout(1, 1), now);
        stats.process_sample(&timeout(1, 1), now);
        assert!(!stats.is_marked_down(1, 1));
        stats.process_sample(&timeout(1, 1), now);
        assert!(stats.is_marked_down(1, 1));
        assert!(!stats.is_marked_down(1, 0));
        assert_eq!(stats.marked_down(), vec![(1, 1)]);
    }

    #[test]
    fn test_markup_after_expiry() {
        let stats = ClusterStats::new(1, 1, &cfg(1));
        let now = 6000;
        stats.process_sample(&timeout(0, 0), now);
        assert!(stats.is_marked_down(0, 0));

        stats.markup_at(now + 300);
        assert!(stats.is_marked_down(0, 0));
        stats.markup_at(now + 301);
        assert!(!stats.is_marked_down(0, 0));
    }

    #[test]
    fn test_window_slides() {
        // 5 slots of 60 s: timeouts older than the window stop counting
        let stats = ClusterStats::new(1, 1, &cfg(2));
        let start = 6000;
        stats.process_sample(&timeout(0, 0), start);
        for step in 1..=5 {
            stats.markup_at(start + step * 60);
        }
        stats.process_sample(&timeout(0, 0), start + 5 * 60);
        assert!(!stats.is_marked_down(0, 0));
    }

    #[test]
    fn test_ema() {
        let stats = ClusterStats::new(1, 1, &cfg(10));
        let sample = ProcStat {
            zone: 0,
            node: 0,
            timeout: false,
            proc_time_us: 1000,
        };
        stats.process_sample(&sample, 0);
        assert_eq!(stats.ema_proc_time(0, 0), 50);
        stats.process_sample(&sample, 0);
        assert_eq!(stats.ema_proc_time(0, 0), 98);
    }

    #[test]
    fn test_out_of_range_ignored() {
        let stats = ClusterStats::new(2, 2, &cfg(1));
        stats.process_sample(&timeout(2, 0), 0);
        stats.process_sample(&timeout(0, 2), 0);
        assert!(stats.marked_down().is_empty());
        assert!(!stats.is_marked_down(5, 5));
    }

    #[tokio::test]
    async fn test_collector_processes_queue() {
        let stats = Arc::new(ClusterStats::new(1, 1, &cfg(1)));
        let handle = stats.run().unwrap();
        assert!(stats.run().is_none());

        stats.send(timeout(0, 0));
        for _ in 0..100 {
            if stats.is_marked_down(0, 0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(stats.is_marked_down(0, 0));

        stats.quit();
        handle.await.unwrap();
    }
}
