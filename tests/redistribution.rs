//! Redistribution tests for shardmesh: prepare, commit, abort and the
//! automatic flow against a simulated storage tier

use shardmesh::common::{ClusterConfig, RedistConfig};
use shardmesh::coordinator::Redistributor;
use shardmesh::placement::validate_zones;
use shardmesh::store::{
    ClusterCache, ClusterReader, KvBackend, MemoryKv, RedistPhase, StoreReader,
};
use shardmesh::{Cluster, Error, MappingAlg};
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn config(counts: &[usize], num_shards: u32) -> ClusterConfig {
    ClusterConfig {
        alg_version: 1,
        num_zones: counts.len() as u32,
        num_shards,
        conn_info: counts
            .iter()
            .enumerate()
            .map(|(z, &n)| (0..n).map(|i| format!("10.8.{}.{}:5080", z, i)).collect())
            .collect(),
        ..Default::default()
    }
}

fn fast() -> RedistConfig {
    RedistConfig {
        min_wait_secs: 0,
        poll_interval_ms: 5,
        markdown_settle_ms: 0,
        ..Default::default()
    }
}

async fn stored(counts: &[usize], num_shards: u32) -> (Arc<MemoryKv>, Redistributor) {
    let kv = Arc::new(MemoryKv::new());
    let redist = Redistributor::new(kv.clone(), "itest", fast());
    assert_eq!(redist.store(config(counts, num_shards)).await.unwrap(), 1);
    (kv, redist)
}

fn redist_keys(data: &BTreeMap<String, String>) -> Vec<String> {
    data.keys()
        .filter(|k| k.starts_with("redist"))
        .cloned()
        .collect()
}

fn zone_keys(data: &BTreeMap<String, String>, zone: u32) -> BTreeMap<String, String> {
    let ipport = format!("node_ipport_{:02}_", zone);
    let shards = format!("node_shards_{:02}_", zone);
    data.iter()
        .filter(|(k, _)| k.starts_with(&ipport) || k.starts_with(&shards))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

async fn committed(kv: &Arc<MemoryKv>) -> (Cluster, u32) {
    let reader = StoreReader::new(kv.clone());
    let (cluster, version) = reader.read().await.unwrap();
    validate_zones(&cluster.zones, cluster.num_shards(), MappingAlg::V1).unwrap();
    (cluster, version)
}

#[tokio::test]
async fn test_write_read_round_trip() {
    let (kv, _redist) = stored(&[3, 2, 4], 32).await;
    let (cluster, version) = committed(&kv).await;
    assert_eq!(version, 1);
    assert_eq!(cluster.config.node_counts(), vec![3, 2, 4]);
}

#[tokio::test]
async fn test_prepare_mismatch_rejected() {
    let (kv, redist) = stored(&[2, 2], 64).await;
    let before = kv.snapshot();

    let err = redist
        .prepare(config(&[3, 2], 128), None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "got {:?}", err);
    assert_eq!(kv.snapshot(), before);
    assert!(redist_keys(&kv.snapshot()).is_empty());
}

#[tokio::test]
async fn test_single_zone_commit_keeps_other_zones() {
    let (kv, redist) = stored(&[2, 2, 2], 24).await;
    let before = kv.snapshot();
    let (original, _) = committed(&kv).await;

    redist
        .prepare(config(&[2, 3, 2], 24), Some(1), false)
        .await
        .unwrap();
    let report = redist
        .commit(config(&[2, 3, 2], 24), Some(1), false, 0, false)
        .await
        .unwrap();
    assert_eq!(report.version, 2);
    assert_eq!(report.skipped_zones, vec![0, 2]);

    let after = kv.snapshot();
    assert_eq!(zone_keys(&after, 0), zone_keys(&before, 0));
    assert_eq!(zone_keys(&after, 2), zone_keys(&before, 2));
    assert!(redist_keys(&after).is_empty());

    let (cluster, version) = committed(&kv).await;
    assert_eq!(version, 2);
    assert_eq!(cluster.zones[0], original.zones[0]);
    assert_eq!(cluster.zones[2], original.zones[2]);
    assert_eq!(cluster.zones[1].len(), 3);
}

#[tokio::test]
async fn test_abort_is_idempotent() {
    let (kv, redist) = stored(&[2, 2], 16).await;
    redist.prepare(config(&[3, 3], 16), None, false).await.unwrap();
    kv.put("zonemarkdown", "0").await.unwrap();

    redist.abort(&config(&[3, 3], 16)).await.unwrap();
    let once = kv.snapshot();
    redist.abort(&config(&[3, 3], 16)).await.unwrap();
    let twice = kv.snapshot();

    assert_eq!(once, twice);
    assert!(!once.contains_key("zonemarkdown"));
    assert!(once.keys().all(|k| !k.starts_with("redist_node_")));
    assert!(once.keys().all(|k| !k.starts_with("redist_state_0")));
    assert_eq!(once.get("redist_enable_00").map(String::as_str), Some("abort_all"));

    // A new redistribution can be prepared after an abort
    redist.prepare(config(&[3, 2], 16), None, false).await.unwrap();
}

/// Plays the storage nodes: targets report ready, sources finish every shard.
fn spawn_storage_tier(kv: Arc<MemoryKv>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if kv.get("version").await.unwrap().as_deref() == Some("2") {
                return;
            }
            for (key, value) in kv.get_prefix("redist_tgtstate_").await.unwrap() {
                if value == "init" {
                    kv.put(&key, "ready").await.unwrap();
                }
            }
            for (key, value) in kv.get_prefix("redist_enable_").await.unwrap() {
                if !value.starts_with("yes_source") {
                    continue;
                }
                let zone = key.trim_start_matches("redist_enable_");
                let prefix = format!("redist_state_{}_", zone);
                for (state_key, state) in kv.get_prefix(&prefix).await.unwrap() {
                    if !state.starts_with("st=F") {
                        kv.put(&state_key, "st=F&total=100&ok=100&err=0")
                            .await
                            .unwrap();
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
}

#[tokio::test]
async fn test_auto_redistribution() {
    let dir = TempDir::new().unwrap();
    let dump = dir.path().join("redist_state.json");
    let kv = Arc::new(MemoryKv::new());
    let cfg = RedistConfig {
        state_dump_path: Some(dump.clone()),
        ..fast()
    };
    let redist = Redistributor::new(kv.clone(), "itest", cfg);
    redist.store(config(&[2, 2], 16)).await.unwrap();

    let tier = spawn_storage_tier(kv.clone());
    let opts = redist.wait_options();
    let report = tokio::time::timeout(
        Duration::from_secs(10),
        redist.auto(config(&[3, 3], 16), None, None, &opts, true),
    )
    .await
    .unwrap()
    .unwrap()
    .unwrap();
    tier.await.unwrap();

    assert_eq!(report.version, 2);
    assert!(report.skipped_zones.is_empty());
    let (cluster, version) = committed(&kv).await;
    assert_eq!(version, 2);
    assert_eq!(cluster.config.node_counts(), vec![3, 3]);
    assert!(redist_keys(&kv.snapshot()).is_empty());

    let states: BTreeMap<String, String> =
        serde_json::from_slice(&std::fs::read(&dump).unwrap()).unwrap();
    assert!(states.keys().any(|k| k.starts_with("redist_state_00_")));
}

#[tokio::test]
async fn test_auto_skip_zone() {
    let kv = Arc::new(MemoryKv::new());
    let redist = Redistributor::new(kv.clone(), "itest", fast());
    redist.store(config(&[2, 2, 2], 12)).await.unwrap();
    let (original, _) = committed(&kv).await;

    let tier = spawn_storage_tier(kv.clone());
    let opts = redist.wait_options();
    let report = tokio::time::timeout(
        Duration::from_secs(10),
        redist.auto(config(&[3, 3, 3], 12), None, Some(2), &opts, true),
    )
    .await
    .unwrap()
    .unwrap()
    .unwrap();
    tier.await.unwrap();

    assert_eq!(report.skipped_zones, vec![2]);
    let (cluster, _) = committed(&kv).await;
    assert_eq!(cluster.zones[0].len(), 3);
    assert_eq!(cluster.zones[1].len(), 3);
    assert_eq!(cluster.zones[2], original.zones[2]);
    assert_eq!(cluster.config.conn_info[2], original.config.conn_info[2]);
}

#[tokio::test]
async fn test_swap_host() {
    let (kv, redist) = stored(&[2, 2], 16).await;
    let (original, _) = committed(&kv).await;

    let mut swapped = config(&[2, 2], 16);
    swapped.conn_info[1][0] = "10.9.1.0:5080".into();
    let report = redist.swap_host(swapped).await.unwrap();
    assert_eq!(report.version, 2);

    let (cluster, _) = committed(&kv).await;
    assert_eq!(cluster.zones, original.zones);
    assert_eq!(cluster.endpoint(1, 0), Some("10.9.1.0:5080"));
}

#[tokio::test]
async fn test_swap_host_changing_layout_is_quorum_risk() {
    let (kv, redist) = stored(&[2, 2], 16).await;
    let before = kv.snapshot();

    let err = redist.swap_host(config(&[3, 2], 16)).await.unwrap_err();
    assert!(matches!(err, Error::QuorumRisk(_)), "got {:?}", err);
    assert_eq!(kv.snapshot(), before);
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_dry_run_leaves_store_untouched() {
    let (kv, _) = stored(&[2, 2], 16).await;
    let before = kv.snapshot();

    let out = SharedBuf::default();
    let redist = Redistributor::new(kv.clone(), "itest", fast()).with_dry_run(Box::new(out.clone()));
    redist.prepare(config(&[3, 3], 16), None, false).await.unwrap();
    redist.abort(&config(&[3, 3], 16)).await.unwrap();
    assert_eq!(kv.snapshot(), before);

    let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
    assert!(text.contains("===txn begin:"));
    assert!(text.contains("redist_enable_00=ready"));
    assert!(text.contains("redist_enable_01=abort_all"));
}

#[tokio::test]
async fn test_load_renders_topology() {
    let (_kv, redist) = stored(&[1, 1], 4).await;
    let (cluster, version, out) = redist.load(Vec::new()).await.unwrap();
    assert_eq!(version, 1);
    assert_eq!(cluster.num_zones(), 2);

    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("node_ipport_01_000=10.8.1.0:5080"));
    assert!(text.contains("version=1"));
}

#[tokio::test]
async fn test_resume_keeps_redistribution_underway() {
    let (kv, redist) = stored(&[2, 2], 16).await;
    redist.prepare(config(&[3, 3], 16), None, false).await.unwrap();
    redist.resume(0, 20).await.unwrap();

    let reader = StoreReader::new(kv.clone());
    assert_eq!(
        reader.phase(0).await.unwrap(),
        Some(RedistPhase::Resume { rate_limit: 20 })
    );
    assert_eq!(reader.phase(1).await.unwrap(), Some(RedistPhase::Ready));

    let err = redist
        .prepare(config(&[3, 2], 16), None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Redist(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_restore_from_cache() {
    let dir = TempDir::new().unwrap();
    let cache = ClusterCache::new(dir.path(), "topology");
    let mut cluster = Cluster::new(config(&[2, 3], 12));
    cluster.populate_from_config().unwrap();
    cache.write(&cluster, 3, false).unwrap();

    let kv = Arc::new(MemoryKv::new());
    let redist = Redistributor::new(kv.clone(), "itest", fast());
    assert_eq!(redist.restore(&cache).await.unwrap(), 3);

    let (restored, version) = committed(&kv).await;
    assert_eq!(version, 3);
    assert_eq!(restored.zones, cluster.zones);
    assert!(kv.snapshot().contains_key("root_itest"));
}
