//! Violation ledger
//!
//! Counts forbidden-construct rejections per caller identity and blocks an
//! identity once it reaches the threshold. Shared by every concurrent
//! request; each update happens under the per-key entry lock, so
//! increment-and-compare is atomic.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

#[derive(Debug, Clone)]
struct ViolationRecord {
    count: u32,
    first_at: Instant,
}

/// Result of recording one violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationUpdate {
    /// Violations counted for the identity, including this one
    pub count: u32,
    /// True only for the call that crossed the threshold
    pub newly_blocked: bool,
}

pub struct ViolationLedger {
    records: DashMap<String, ViolationRecord>,
    threshold: u32,
    /// None = violations never expire within the process lifetime
    window: Option<Duration>,
}

impl ViolationLedger {
    pub fn new(threshold: u32, window: Option<Duration>) -> Self {
        Self {
            records: DashMap::new(),
            threshold: threshold.max(1),
            window,
        }
    }

    /// Count a violation for `identity`
    pub fn record_violation(&self, identity: &str) -> ViolationUpdate {
        let now = Instant::now();
        self.prune_expired(now);

        let mut entry = self
            .records
            .entry(identity.to_string())
            .or_insert_with(|| ViolationRecord {
                count: 0,
                first_at: now,
            });

        if self.is_expired(&entry, now) {
            entry.count = 0;
            entry.first_at = now;
        }

        entry.count = entry.count.saturating_add(1);
        let update = ViolationUpdate {
            count: entry.count,
            newly_blocked: entry.count == self.threshold,
        };
        drop(entry);

        if update.newly_blocked {
            warn!(
                identity,
                violations = update.count,
                "Identity blacklisted after repeated violations"
            );
        }
        update
    }

    /// Whether `identity` is currently denied service
    pub fn is_blocked(&self, identity: &str) -> bool {
        let now = Instant::now();
        match self.records.get(identity) {
            Some(record) => !self.is_expired(&record, now) && record.count >= self.threshold,
            None => false,
        }
    }

    /// Current violation count for `identity` (0 if unknown or expired)
    pub fn violations(&self, identity: &str) -> u32 {
        let now = Instant::now();
        self.records
            .get(identity)
            .filter(|record| !self.is_expired(record, now))
            .map(|record| record.count)
            .unwrap_or(0)
    }

    /// Forget an identity, lifting any block
    pub fn reset(&self, identity: &str) -> bool {
        self.records.remove(identity).is_some()
    }

    /// Drop every record the window has lapsed for. Must not be called while
    /// holding an entry guard, since `retain` locks each shard.
    fn prune_expired(&self, now: Instant) {
        if self.window.is_some() {
            self.records.retain(|_, record| !self.is_expired(record, now));
        }
    }

    fn is_expired(&self, record: &ViolationRecord, now: Instant) -> bool {
        match self.window {
            Some(window) => now.duration_since(record.first_at) >= window,
            None => false,
        }
    }
}
