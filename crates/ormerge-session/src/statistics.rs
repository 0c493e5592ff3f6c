//! Session statistics.
//!
//! Counters are only updated while statistics are enabled, which is
//! controlled by `SessionConfig::statistics_enabled`.

use std::collections::BTreeMap;

use serde::Serialize;

/// Snapshot of session counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Outermost merge calls
    pub top_level_merges: u64,
    /// Merges reached through a cascade
    pub nested_merges: u64,
    /// Instances hydrated from fetched rows
    pub entity_loads: u64,
    /// Datastore fetches issued by the session
    pub entity_fetches: u64,
    pub entity_inserts: u64,
    pub entity_updates: u64,
    pub entity_deletes: u64,
    /// Entity copies reported to the copy observer
    pub entity_copies_detected: u64,
    /// Optimistic lock failures per entity name
    pub optimistic_failures: BTreeMap<String, u64>,
}

impl SessionStats {
    pub fn total_optimistic_failures(&self) -> u64 {
        self.optimistic_failures.values().sum()
    }
}

#[derive(Debug, Default)]
pub struct Statistics {
    enabled: bool,
    stats: SessionStats,
}

impl Statistics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            stats: SessionStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn record(&mut self, update: impl FnOnce(&mut SessionStats)) {
        if self.enabled {
            update(&mut self.stats);
        }
    }

    pub fn merge(&mut self, top_level: bool) {
        self.record(|s| {
            if top_level {
                s.top_level_merges += 1;
            } else {
                s.nested_merges += 1;
            }
        });
    }

    pub fn entity_load(&mut self) {
        self.record(|s| s.entity_loads += 1);
    }

    pub fn entity_fetch(&mut self) {
        self.record(|s| s.entity_fetches += 1);
    }

    pub fn entity_insert(&mut self) {
        self.record(|s| s.entity_inserts += 1);
    }

    pub fn entity_update(&mut self) {
        self.record(|s| s.entity_updates += 1);
    }

    pub fn entity_delete(&mut self) {
        self.record(|s| s.entity_deletes += 1);
    }

    pub fn entity_copies(&mut self, count: u64) {
        self.record(|s| s.entity_copies_detected += count);
    }

    pub fn optimistic_failure(&mut self, entity_name: &str) {
        self.record(|s| {
            *s.optimistic_failures
                .entry(entity_name.to_string())
                .or_insert(0) += 1;
        });
    }

    pub fn snapshot(&self) -> SessionStats {
        self.stats.clone()
    }

    pub fn reset(&mut self) {
        self.stats = SessionStats::default();
    }
}
