//! Hard markdown of a whole zone, set by operators through the store

use std::sync::atomic::{AtomicI32, Ordering};

const NONE: i32 = -1;

/// Zone excluded from routing, shared by every shard manager generation
#[derive(Debug)]
pub struct ZoneMarkdown {
    zone: AtomicI32,
}

impl Default for ZoneMarkdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneMarkdown {
    pub fn new() -> Self {
        Self {
            zone: AtomicI32::new(NONE),
        }
    }

    pub fn mark_down(&self, zone: u32) {
        let id = i32::try_from(zone).unwrap_or(NONE);
        self.zone.store(id, Ordering::Release);
    }

    pub fn reset(&self) {
        self.zone.store(NONE, Ordering::Release);
    }

    /// Zone currently marked down, if any.
    pub fn check(&self) -> Option<u32> {
        u32::try_from(self.zone.load(Ordering::Acquire)).ok()
    }

    /// Apply a `zonemarkdown` value: a zone id, or anything else to clear.
    pub fn apply_value(&self, value: Option<&str>) {
        match value.and_then(|v| v.trim().parse::<i32>().ok()) {
            Some(zone) if zone >= 0 => {
                tracing::info!("zone {} marked down", zone);
                self.zone.store(zone, Ordering::Release);
            }
            _ => {
                if self.check().is_some() {
                    tracing::info!("zone markdown cleared");
                }
                self.reset();
            }
        }
    }
}
