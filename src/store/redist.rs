//! Values of the redistribution record
//!
//! Each zone taking part in a redistribution carries a phase flag that
//! storage nodes watch, and every moving shard carries a migration state that
//! the source node updates as it copies data.

use crate::store::keys::{parse_rate_limit, with_rate_limit};
use serde::Serialize;
use std::fmt;

const READY: &str = "ready";
const SOURCE: &str = "yes_source";
const SOURCE_RL: &str = "yes_source_rl";
const TARGET: &str = "yes_target";
const DISABLED: &str = "no";
const ABORT_ALL: &str = "abort_all";
const ABORT_ZONE: &str = "abort_zone";
const RESUME: &str = "source_resume";
const RESUME_RL: &str = "source_resume_rl";

/// Initial migration state of a moving shard
pub const STATE_BEGIN: &str = "begin";

pub const TARGET_STATE_INIT: &str = "init";
pub const TARGET_STATE_READY: &str = "ready";

/// Per-zone phase flag, `redist_enable_ZZ`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RedistPhase {
    /// Candidate written, nothing started
    Ready,
    /// Target nodes accept incoming shards
    Target,
    /// Source nodes copy shards out; 0 means no rate limit
    Source { rate_limit: u32 },
    /// Stopped by the operator
    Disabled,
    /// Whole redistribution abandoned
    AbortAll,
    /// This zone was skipped and keeps its current layout
    AbortZone,
    /// Source nodes continue an interrupted copy
    Resume { rate_limit: u32 },
}

impl RedistPhase {
    pub fn parse(value: &str) -> Option<Self> {
        let tag = value.split('|').next().unwrap_or_default();
        let phase = match tag {
            READY => RedistPhase::Ready,
            TARGET => RedistPhase::Target,
            SOURCE | SOURCE_RL => RedistPhase::Source {
                rate_limit: parse_rate_limit(value),
            },
            DISABLED => RedistPhase::Disabled,
            ABORT_ALL => RedistPhase::AbortAll,
            ABORT_ZONE => RedistPhase::AbortZone,
            RESUME | RESUME_RL => RedistPhase::Resume {
                rate_limit: parse_rate_limit(value),
            },
            _ => return None,
        };
        Some(phase)
    }

    pub fn to_value(&self) -> String {
        match *self {
            RedistPhase::Ready => READY.to_string(),
            RedistPhase::Target => TARGET.to_string(),
            RedistPhase::Source { rate_limit: 0 } => SOURCE.to_string(),
            RedistPhase::Source { rate_limit } => with_rate_limit(SOURCE_RL, rate_limit),
            RedistPhase::Disabled => DISABLED.to_string(),
            RedistPhase::AbortAll => ABORT_ALL.to_string(),
            RedistPhase::AbortZone => ABORT_ZONE.to_string(),
            RedistPhase::Resume { rate_limit: 0 } => RESUME.to_string(),
            RedistPhase::Resume { rate_limit } => with_rate_limit(RESUME_RL, rate_limit),
        }
    }

    /// A redistribution owns the zone: a new one must not be prepared.
    pub fn is_underway(&self) -> bool {
        matches!(
            self,
            RedistPhase::Ready
                | RedistPhase::Target
                | RedistPhase::Source { .. }
                | RedistPhase::Resume { .. }
                | RedistPhase::AbortZone
        )
    }

    /// The zone still has a candidate layout in the store.
    pub fn is_prepared(&self) -> bool {
        !matches!(self, RedistPhase::AbortAll | RedistPhase::AbortZone)
    }
}

impl fmt::Display for RedistPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_value())
    }
}

/// Status of one shard's migration, the `st` field of its state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationStatus {
    Begin,
    InProgress,
    Finish,
    Abort,
}

impl MigrationStatus {
    fn parse(code: &str) -> Option<Self> {
        match code {
            "B" => Some(MigrationStatus::Begin),
            "P" => Some(MigrationStatus::InProgress),
            "F" => Some(MigrationStatus::Finish),
            "A" => Some(MigrationStatus::Abort),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            MigrationStatus::Begin => "B",
            MigrationStatus::InProgress => "P",
            MigrationStatus::Finish => "F",
            MigrationStatus::Abort => "A",
        }
    }
}

/// Parsed `st=F&total=..&ok=..&err=..&drop=..&expired=..&mshd=..&et=..`
///
/// The initial value `begin` has no fields and parses with no status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationStats {
    pub status: Option<MigrationStatus>,
    pub total: u64,
    pub ok: u64,
    pub err: u64,
    pub drop: u64,
    pub expired: u64,
    pub micro_shard: i64,
    pub elapsed: String,
}

impl MigrationStats {
    pub fn parse(value: &str) -> Self {
        let mut stats = MigrationStats::default();
        for pair in value.split('&') {
            let Some((k, v)) = pair.split_once('=') else {
                continue;
            };
            match k {
                "st" => stats.status = MigrationStatus::parse(v),
                "total" => stats.total = v.parse().unwrap_or(0),
                "ok" => stats.ok = v.parse().unwrap_or(0),
                "err" => stats.err = v.parse().unwrap_or(0),
                "drop" => stats.drop = v.parse().unwrap_or(0),
                "expired" => stats.expired = v.parse().unwrap_or(0),
                "mshd" => stats.micro_shard = v.parse().unwrap_or(0),
                "et" => stats.elapsed = v.to_string(),
                _ => {}
            }
        }
        stats
    }

    pub fn is_finished(&self) -> bool {
        self.status == Some(MigrationStatus::Finish)
    }

    pub fn is_aborted(&self) -> bool {
        self.status == Some(MigrationStatus::Abort)
    }
}

/// Progress of one zone, published as `redist_state_summary`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ZoneProgress {
    pub zone: u32,
    pub total: usize,
    pub finished: usize,
    pub aborted: usize,
    pub min_expected: usize,
}

impl ZoneProgress {
    pub fn to_value(&self) -> String {
        format!(
            "zone={}&finish_count={}&min_expected={}",
            self.zone, self.finished, self.min_expected
        )
    }
}
