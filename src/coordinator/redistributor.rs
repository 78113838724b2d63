//! Redistributor: one operator session against one cluster

use crate::common::{ClusterConfig, Error, RedistConfig, Result};
use crate::placement::{match_zones, validate_zones};
use crate::store::keys::{self, TAG_REDIST_STATE, TAG_REDIST_STATE_SUMMARY, TAG_ZONE_MARKDOWN};
use crate::store::redist::TARGET_STATE_READY;
use crate::store::{
    ClusterCache, ClusterReader, ClusterWriter, DryRunSink, KvBackend, MigrationStats,
    RedistPhase, StoreReader, TopologyWriter, TxnOp, ZoneProgress,
};
use crate::topology::Cluster;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How `wait_for_finish_state` polls one zone
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Abandon the zone instead of waiting
    pub skip: bool,
    pub max_failures: u32,
    pub min_wait: Duration,
    /// Zero waits indefinitely
    pub max_wait: Duration,
    /// Phase flags were already advanced; only observe progress
    pub notify_done: bool,
    /// Enable sources without waiting for target nodes to report ready
    pub skip_target_check: bool,
    pub rate_limit: u32,
    /// Mark the zone down once its sources start
    pub markdown: bool,
    pub poll_interval: Duration,
    pub markdown_settle: Duration,
}

impl From<&RedistConfig> for WaitOptions {
    fn from(cfg: &RedistConfig) -> Self {
        Self {
            skip: false,
            max_failures: cfg.max_failures,
            min_wait: Duration::from_secs(cfg.min_wait_secs),
            max_wait: Duration::from_secs(cfg.max_wait_secs),
            notify_done: false,
            skip_target_check: false,
            rate_limit: cfg.rate_limit,
            markdown: false,
            poll_interval: cfg.poll_interval(),
            markdown_settle: cfg.markdown_settle(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Finished(ZoneProgress),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub version: u32,
    /// Zones carried over unchanged from the previous version
    pub skipped_zones: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkdownOp {
    Set(u32),
    Delete,
    Get,
}

/// Snapshot of the committed topology and any redistribution in flight
#[derive(Debug, Clone, Serialize)]
pub struct RedistStatus {
    pub version: u32,
    pub alg_version: u32,
    pub node_counts: Vec<usize>,
    pub phases: Vec<Option<RedistPhase>>,
    pub summary: Option<String>,
    pub zone_markdown: Option<u32>,
}

impl fmt::Display for RedistStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "version={} alg_version={}",
            self.version, self.alg_version
        )?;
        for (zone, count) in self.node_counts.iter().enumerate() {
            let phase = self
                .phases
                .get(zone)
                .copied()
                .flatten()
                .map_or_else(|| "-".to_string(), |p| p.to_value());
            writeln!(f, "zone {}: {} nodes, redist={}", zone, count, phase)?;
        }
        if let Some(summary) = &self.summary {
            writeln!(f, "progress: {}", summary)?;
        }
        match self.zone_markdown {
            Some(zone) => writeln!(f, "zone markdown: {}", zone),
            None => writeln!(f, "zone markdown: none"),
        }
    }
}

pub struct Redistributor {
    kv: Arc<dyn KvBackend>,
    reader: StoreReader,
    writer: Arc<dyn ClusterWriter>,
    cluster_name: String,
    cfg: RedistConfig,
    dry_run: bool,
}

impl Redistributor {
    pub fn new(kv: Arc<dyn KvBackend>, cluster_name: impl Into<String>, cfg: RedistConfig) -> Self {
        Self {
            reader: StoreReader::new(kv.clone()),
            writer: Arc::new(TopologyWriter::live(kv.clone())),
            kv,
            cluster_name: cluster_name.into(),
            cfg,
            dry_run: false,
        }
    }

    /// Cache every topology read from the store.
    pub fn with_cache(mut self, cache: ClusterCache) -> Self {
        self.reader = self.reader.with_cache(cache);
        self
    }

    /// Render writes to `out` instead of applying them. Reads still go to
    /// the store.
    pub fn with_dry_run(mut self, out: Box<dyn io::Write + Send>) -> Self {
        self.writer = Arc::new(TopologyWriter::new(DryRunSink::new(out)));
        self.dry_run = true;
        self
    }

    pub fn with_writer(mut self, writer: Arc<dyn ClusterWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn reader(&self) -> &StoreReader {
        &self.reader
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Default wait options from the session configuration.
    pub fn wait_options(&self) -> WaitOptions {
        WaitOptions::from(&self.cfg)
    }

    /// First topology of a new cluster, published as version 1.
    pub async fn store(&self, config: ClusterConfig) -> Result<u32> {
        let existing = self.reader.version().await?;
        if existing > 0 {
            return Err(Error::Redist(format!(
                "topology version {} already stored; change it with a redistribution",
                existing
            )));
        }

        let mut cluster = Cluster::new(config);
        cluster.populate_from_config()?;
        validate_zones(&cluster.zones, cluster.num_shards(), cluster.alg()?)?;
        cluster.validate()?;
        tracing::info!("initial topology:\n{}", cluster.dump());

        self.writer.write_root_key(&self.cluster_name).await?;
        self.writer.write(&cluster, 1).await?;
        tracing::info!(">> store succeeded, version 1");
        Ok(1)
    }

    /// Read the committed topology and render its keys to `out`.
    pub async fn load<W: io::Write + Send>(&self, out: W) -> Result<(Cluster, u32, W)> {
        let (cluster, version) = self.reader.read().await?;
        tracing::debug!("committed topology:\n{}", cluster.dump());
        let render = TopologyWriter::new(DryRunSink::new(out));
        render.write(&cluster, version).await?;
        Ok((cluster, version, render.into_sink().into_inner()))
    }

    /// Refuse while any zone still belongs to a redistribution.
    async fn ensure_idle(&self, num_zones: u32) -> Result<()> {
        for zone in 0..num_zones {
            if let Some(phase) = self.reader.phase(zone).await? {
                if phase.is_underway() {
                    return Err(Error::Redist(format!(
                        "zone {} is in redistribution phase '{}'; commit or abort it first",
                        zone, phase
                    )));
                }
            }
        }
        Ok(())
    }

    async fn is_underway(&self, num_zones: u32) -> Result<bool> {
        for zone in 0..num_zones {
            if self.reader.phase(zone).await?.is_some_and(|p| p.is_underway()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn check_zone(zone: Option<u32>, num_zones: u32) -> Result<()> {
        match zone {
            Some(z) if z >= num_zones => Err(Error::Validation(format!(
                "zone {} is outside the range [0, {})",
                z, num_zones
            ))),
            _ => Ok(()),
        }
    }

    /// Compute the candidate topology for `new_config` and record it.
    ///
    /// Only node counts may change. With `swap_host` the shard layout must
    /// stay exactly the same, since only endpoints are replaced.
    pub async fn prepare(
        &self,
        mut new_config: ClusterConfig,
        target_zone: Option<u32>,
        swap_host: bool,
    ) -> Result<Cluster> {
        new_config.validate()?;
        let (current, _) = self.reader.read().await?;
        self.ensure_idle(current.num_zones()).await?;

        let checks = [
            ("alg_version", current.config.alg_version, new_config.alg_version),
            ("num_zones", current.num_zones(), new_config.num_zones),
            ("num_shards", current.num_shards(), new_config.num_shards),
        ];
        for (name, curr, new) in checks {
            if curr != new {
                let msg = format!("{}: (curr={}, new={}) mismatch", name, curr, new);
                tracing::error!("{}", msg);
                return Err(Error::Validation(msg));
            }
        }

        tracing::info!("current topology:\n{}", current.dump());
        let alg = current.alg()?;
        current.validate()?;
        validate_zones(&current.zones, current.num_shards(), alg)?;
        Self::check_zone(target_zone, current.num_zones())?;

        let mut candidate = Cluster::new(new_config);
        candidate.set_redist_zone(target_zone);
        candidate.populate_from_redist(Some(&current.zones))?;
        match target_zone {
            Some(zone) => tracing::info!("candidate topology for zone {}:\n{}", zone, candidate.dump()),
            None => tracing::info!("candidate topology:\n{}", candidate.dump()),
        }
        validate_zones(&candidate.zones, candidate.num_shards(), alg)?;

        if swap_host {
            match_zones(&candidate.zones, &current.zones).map_err(|e| {
                Error::QuorumRisk(format!("host swap would change shard ownership: {}", e))
            })?;
        }

        self.writer.write_redist_info(&current, &candidate).await?;
        tracing::info!(">> prepare step succeeded");
        Ok(candidate)
    }

    /// Set the phase flag of `zone`: sources or targets when `enable`,
    /// stopped otherwise.
    pub async fn start(
        &self,
        zone: u32,
        source: bool,
        enable: bool,
        rate_limit: u32,
        markdown: bool,
    ) -> Result<()> {
        let num_zones = self.reader.num_zones().await?;
        Self::check_zone(Some(zone), num_zones)?;

        if enable {
            match self.reader.phase(zone).await? {
                Some(phase) if phase.is_prepared() => {}
                phase => {
                    return Err(Error::Redist(format!(
                        "zone {} is not prepared (phase {})",
                        zone,
                        phase.map_or_else(|| "none".to_string(), |p| p.to_value())
                    )))
                }
            }
        }

        self.writer
            .write_redist_start(enable, zone, source, rate_limit)
            .await?;
        if markdown && source && enable {
            self.writer.write_zone_markdown(Some(zone)).await?;
        }
        Ok(())
    }

    /// Poll the migration states of `zone` until enough shards finished.
    pub async fn wait_for_finish_state(&self, zone: u32, opts: &WaitOptions) -> Result<WaitOutcome> {
        let prefix = keys::zone_prefix(TAG_REDIST_STATE, zone);
        let start = Instant::now();
        let deadline = (!opts.max_wait.is_zero()).then(|| start + opts.max_wait);
        let max_failures = opts.max_failures as usize;
        let mut notify_done = opts.notify_done;

        loop {
            let states = match self.kv.get_prefix(&prefix).await {
                Ok(states) => states,
                Err(e) if e.is_retryable() => {
                    tracing::warn!("zone {}: reading migration states failed, retrying: {}", zone, e);
                    Self::check_deadline(deadline, zone)?;
                    tokio::time::sleep(opts.poll_interval).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut progress = ZoneProgress {
                zone,
                total: states.len(),
                finished: 0,
                aborted: 0,
                min_expected: states.len().saturating_sub(max_failures),
            };
            for (_, value) in &states {
                let stats = MigrationStats::parse(value);
                if stats.is_finished() {
                    progress.finished += 1;
                } else if stats.is_aborted() {
                    progress.aborted += 1;
                }
            }

            if let Err(e) = self
                .kv
                .put(TAG_REDIST_STATE_SUMMARY, &progress.to_value())
                .await
            {
                tracing::warn!("failed to publish progress summary: {}", e);
            }
            tracing::info!(
                "zone={}, total_snapshots={}, finish_count={}, abort_count={}, min_expected={}",
                zone,
                progress.total,
                progress.finished,
                progress.aborted,
                progress.min_expected
            );

            if progress.finished == progress.total {
                return Ok(WaitOutcome::Finished(progress));
            }
            if progress.finished >= progress.min_expected && start.elapsed() >= opts.min_wait {
                return Ok(WaitOutcome::Finished(progress));
            }
            if progress.aborted > max_failures {
                return Err(Error::Redist(format!(
                    "zone {}: {} shard migrations aborted, more than the {} allowed",
                    zone, progress.aborted, max_failures
                )));
            }

            if opts.skip {
                self.skip_zone(zone).await?;
                return Ok(WaitOutcome::Skipped);
            }

            if !notify_done {
                self.advance_phase(zone, opts, deadline).await?;
                notify_done = true;
            }

            Self::check_deadline(deadline, zone)?;
            tokio::time::sleep(opts.poll_interval).await;
        }
    }

    fn check_deadline(deadline: Option<Instant>, zone: u32) -> Result<()> {
        match deadline {
            Some(d) if Instant::now() >= d => Err(Error::Timeout(format!(
                "zone {}: redistribution did not finish in time",
                zone
            ))),
            _ => Ok(()),
        }
    }

    /// Abandon `zone`: drop its part of the record and flag it skipped.
    async fn skip_zone(&self, zone: u32) -> Result<()> {
        let ops = vec![
            TxnOp::delete_prefix(keys::zone_prefix(keys::TAG_REDIST_FROM, zone)),
            TxnOp::delete_prefix(keys::zone_prefix(keys::TAG_REDIST_STATE, zone)),
            TxnOp::delete_prefix(keys::zone_prefix(keys::TAG_REDIST_TGT_STATE, zone)),
            TxnOp::delete_prefix(keys::zone_prefix(keys::TAG_REDIST_NODE_IPPORT, zone)),
            TxnOp::delete_prefix(keys::zone_prefix(keys::TAG_REDIST_NODE_SHARDS, zone)),
            TxnOp::put(keys::redist_enable(zone), RedistPhase::AbortZone.to_value()),
        ];
        tracing::info!("skip zone {}", zone);
        self.kv.txn(ops).await
    }

    /// `ready` enables targets, then sources once every target is ready.
    async fn advance_phase(
        &self,
        zone: u32,
        opts: &WaitOptions,
        deadline: Option<Instant>,
    ) -> Result<()> {
        match self.reader.phase(zone).await? {
            Some(RedistPhase::Ready) => {
                self.writer.write_redist_start(true, zone, false, 0).await?;
            }
            Some(RedistPhase::Target) => {}
            _ => return Ok(()),
        }

        if !opts.skip_target_check {
            self.wait_for_targets(zone, opts.poll_interval, deadline)
                .await?;
        }
        self.writer
            .write_redist_start(true, zone, true, opts.rate_limit)
            .await?;

        if opts.markdown {
            self.writer.write_zone_markdown(Some(zone)).await?;
            tracing::info!("zone {} marked down, settling for {:?}", zone, opts.markdown_settle);
            tokio::time::sleep(opts.markdown_settle).await;
        }
        Ok(())
    }

    async fn wait_for_targets(
        &self,
        zone: u32,
        poll_interval: Duration,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let prefix = keys::zone_prefix(keys::TAG_REDIST_TGT_STATE, zone);
        loop {
            match self.kv.get_prefix(&prefix).await {
                Ok(states) => {
                    let ready = states
                        .iter()
                        .filter(|(_, v)| v == TARGET_STATE_READY)
                        .count();
                    tracing::info!(
                        "zone={}, total_target_nodes={}, ready_count={}",
                        zone,
                        states.len(),
                        ready
                    );
                    if ready == states.len() {
                        return Ok(());
                    }
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!("zone {}: reading target states failed, retrying: {}", zone, e)
                }
                Err(e) => return Err(e),
            }
            Self::check_deadline(deadline, zone)?;
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Publish the candidate as the next committed version.
    ///
    /// Zones outside the redistribution, or skipped during it, keep their
    /// current layout and are listed in the report.
    pub async fn commit(
        &self,
        mut new_config: ClusterConfig,
        zone: Option<u32>,
        wait_for_finish: bool,
        max_failures: u32,
        markdown: bool,
    ) -> Result<CommitReport> {
        new_config.validate()?;
        let (current, version) = self.reader.read().await?;

        if current.config.alg_version != new_config.alg_version {
            let msg = format!(
                "alg_version: (curr={}, new={}) mismatch",
                current.config.alg_version, new_config.alg_version
            );
            tracing::error!("{}", msg);
            return Err(Error::Validation(msg));
        }
        Self::check_zone(zone, current.num_zones())?;

        let mut candidate = Cluster::new(new_config);
        candidate.set_redist_zone(zone);
        self.reader.read_redist_node_shards(&mut candidate).await?;
        let skipped_zones = candidate.merge_with(&current);

        tracing::info!("new topology:\n{}", candidate.dump());
        candidate.validate()?;
        validate_zones(&candidate.zones, candidate.num_shards(), candidate.alg()?)?;
        let version = version + 1;

        if wait_for_finish && !self.dry_run {
            let opts = WaitOptions {
                max_failures,
                notify_done: true,
                markdown,
                ..self.wait_options()
            };
            for z in candidate.redist_zones().collect::<Vec<_>>() {
                self.wait_for_finish_state(z, &opts).await?;
            }
        }

        if let Some(path) = self.cfg.state_dump_path.as_deref().filter(|_| !self.dry_run) {
            self.dump_state(path).await?;
        }

        self.writer.write_root_key(&self.cluster_name).await?;
        self.writer.write(&candidate, version).await?;
        if !skipped_zones.is_empty() {
            tracing::info!("zones kept unchanged: {:?}", skipped_zones);
        }
        tracing::info!(">> commit succeeded, version {}", version);

        if let Err(e) = self.writer.write_zone_markdown(None).await {
            tracing::warn!("failed to clear zone markdown: {}", e);
        }
        Ok(CommitReport {
            version,
            skipped_zones,
        })
    }

    async fn dump_state(&self, path: &Path) -> Result<()> {
        let state = self.reader.redist_state_dump().await?;
        let bytes = serde_json::to_vec_pretty(&state)?;
        tokio::fs::write(path, bytes).await?;
        tracing::info!("redistribution state dumped to {}", path.display());
        Ok(())
    }

    /// Discard the candidate and clear the zone markdown.
    pub async fn abort(&self, config: &ClusterConfig) -> Result<()> {
        self.writer.write_redist_abort(config.num_zones).await?;
        tracing::info!(">> abort step succeeded");
        if let Err(e) = self.writer.write_zone_markdown(None).await {
            tracing::warn!("failed to clear zone markdown: {}", e);
        }
        Ok(())
    }

    pub async fn resume(&self, zone: u32, rate_limit: u32) -> Result<()> {
        self.writer.write_redist_resume(zone, rate_limit).await?;
        tracing::info!(">> resume started for zone {}", zone);
        Ok(())
    }

    /// Prepare unless a redistribution is already underway, drive every
    /// zone (or only `zone`) to completion, and optionally commit.
    pub async fn auto(
        &self,
        new_config: ClusterConfig,
        zone: Option<u32>,
        skip_zone: Option<u32>,
        opts: &WaitOptions,
        commit: bool,
    ) -> Result<Option<CommitReport>> {
        let mut checked = new_config.clone();
        checked.validate()?;

        if self.is_underway(checked.num_zones).await? {
            let stored = self.reader.alg_version().await?;
            if stored != checked.alg_version {
                return Err(Error::Validation(format!(
                    "alg_version: (curr={}, new={}) mismatch",
                    stored, checked.alg_version
                )));
            }
            tracing::info!("redistribution already prepared, resuming the wait");
        } else {
            self.prepare(new_config.clone(), zone, false).await?;
            if self.dry_run {
                return Ok(None);
            }
        }

        tracing::info!("enable redistribution and wait for finish state ...");
        for z in 0..checked.num_zones {
            if zone.is_some_and(|selected| selected != z) {
                continue;
            }
            let zone_opts = WaitOptions {
                skip: zone.is_none() && skip_zone == Some(z),
                notify_done: false,
                ..opts.clone()
            };
            self.wait_for_finish_state(z, &zone_opts).await?;
        }

        if !commit {
            return Ok(None);
        }
        let report = self
            .commit(new_config, zone, false, opts.max_failures, opts.markdown)
            .await?;
        Ok(Some(report))
    }

    /// Replace node endpoints without moving any shard.
    pub async fn swap_host(&self, new_config: ClusterConfig) -> Result<CommitReport> {
        self.prepare(new_config.clone(), None, true).await?;
        let report = self.commit(new_config, None, false, 0, false).await?;
        tracing::info!(">> swaphost succeeded");
        Ok(report)
    }

    /// Republish the topology held in the local cache.
    pub async fn restore(&self, cache: &ClusterCache) -> Result<u32> {
        let (cluster, version) = cache.read().await?;
        self.writer.write_root_key(&self.cluster_name).await?;
        self.writer.write(&cluster, version).await?;
        tracing::info!(">> restore succeeded, version {}", version);
        Ok(version)
    }

    pub async fn zone_markdown(&self, op: MarkdownOp) -> Result<Option<u32>> {
        match op {
            MarkdownOp::Set(zone) => {
                self.writer.write_zone_markdown(Some(zone)).await?;
                Ok(Some(zone))
            }
            MarkdownOp::Delete => {
                self.writer.write_zone_markdown(None).await?;
                tracing::info!("zone markdown removed");
                Ok(None)
            }
            MarkdownOp::Get => self.current_markdown().await,
        }
    }

    async fn current_markdown(&self) -> Result<Option<u32>> {
        let value = self.reader.get_value(TAG_ZONE_MARKDOWN).await?;
        Ok(value.and_then(|v| v.trim().parse::<i64>().ok()).and_then(|z| u32::try_from(z).ok()))
    }

    pub async fn status(&self) -> Result<RedistStatus> {
        let (cluster, version) = self.reader.read().await?;
        let mut phases = Vec::with_capacity(cluster.num_zones() as usize);
        for zone in 0..cluster.num_zones() {
            phases.push(self.reader.phase(zone).await?);
        }
        Ok(RedistStatus {
            version,
            alg_version: cluster.config.alg_version,
            node_counts: cluster.zones.iter().map(|z| z.len()).collect(),
            phases,
            summary: self.reader.get_value(TAG_REDIST_STATE_SUMMARY).await?,
            zone_markdown: self.current_markdown().await?,
        })
    }
}
