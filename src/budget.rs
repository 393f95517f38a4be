//! Soft memory budget for cached tiles.
//!
//! Cached channels register their estimated resident size. Once per tick the
//! eviction pass drops the least recently touched entries whose keep-alive
//! window has elapsed until the total is back under the threshold. Entries
//! still inside their keep-alive window are never evicted, so the cache can
//! stay over budget until they age out.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::tile::{Channel, TileId};

const MIB: u64 = 1024 * 1024;

/// Memory threshold presets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheThreshold {
    Low,
    Medium,
    High,
    Ultra,
    Custom(u64),
}

impl CacheThreshold {
    pub fn bytes(self) -> u64 {
        match self {
            CacheThreshold::Low => 512 * MIB,
            CacheThreshold::Medium => 1024 * MIB,
            CacheThreshold::High => 2048 * MIB,
            CacheThreshold::Ultra => 4096 * MIB,
            CacheThreshold::Custom(bytes) => bytes,
        }
    }

    /// From string (case-insensitive). Plain numbers are taken as MiB.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "ultra" => Some(Self::Ultra),
            other => other.parse::<u64>().ok().map(|mb| Self::Custom(mb * MIB)),
        }
    }
}

/// Caching policy.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheBudget {
    pub threshold: CacheThreshold,
    /// Minimum time a cached entry is kept after its last touch
    pub keep_alive_ms: u64,
    pub cache_in_runtime: bool,
    pub cache_in_editor: bool,
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self {
            threshold: CacheThreshold::Medium,
            keep_alive_ms: 30_000,
            cache_in_runtime: true,
            cache_in_editor: false,
        }
    }
}

/// Where the loader is running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub is_editor: bool,
    pub is_playing: bool,
}

impl ExecutionContext {
    pub fn runtime() -> Self {
        Self {
            is_editor: false,
            is_playing: true,
        }
    }

    pub fn editor() -> Self {
        Self {
            is_editor: true,
            is_playing: false,
        }
    }

    /// Play mode inside the editor counts as runtime.
    pub fn is_runtime(&self) -> bool {
        self.is_playing || !self.is_editor
    }
}

impl CacheBudget {
    pub fn caching_enabled(&self, ctx: ExecutionContext) -> bool {
        if ctx.is_runtime() {
            self.cache_in_runtime
        } else {
            self.cache_in_editor
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct BudgetEntry {
    bytes: u64,
    last_touched_ms: u64,
    generation: u64,
}

/// A cached channel selected for eviction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub tile: TileId,
    pub channel: Channel,
    /// Channel generation at registration; stale candidates are ignored
    pub generation: u64,
    pub bytes: u64,
}

pub struct MemoryBudgetedCache {
    budget: CacheBudget,
    entries: HashMap<(TileId, Channel), BudgetEntry>,
    total_bytes: u64,
    evictions: usize,
}

impl MemoryBudgetedCache {
    pub fn new(budget: CacheBudget) -> Self {
        Self {
            budget,
            entries: HashMap::new(),
            total_bytes: 0,
            evictions: 0,
        }
    }

    pub fn budget(&self) -> &CacheBudget {
        &self.budget
    }

    pub fn budget_mut(&mut self) -> &mut CacheBudget {
        &mut self.budget
    }

    pub fn threshold_bytes(&self) -> u64 {
        self.budget.threshold.bytes()
    }

    pub fn register(&mut self, tile: TileId, channel: Channel, bytes: u64, generation: u64, now_ms: u64) {
        let entry = BudgetEntry {
            bytes,
            last_touched_ms: now_ms,
            generation,
        };
        if let Some(old) = self.entries.insert((tile, channel), entry) {
            self.total_bytes -= old.bytes;
        }
        self.total_bytes += bytes;
        debug!(
            "Cached {} {} ({:.1}MB, total {:.1}MB)",
            tile,
            channel.name(),
            bytes as f64 / MIB as f64,
            self.total_bytes as f64 / MIB as f64
        );
    }

    pub fn deregister(&mut self, tile: TileId, channel: Channel) -> bool {
        match self.entries.remove(&(tile, channel)) {
            Some(old) => {
                self.total_bytes -= old.bytes;
                true
            }
            None => false,
        }
    }

    /// Record an access, restarting the entry's keep-alive window.
    pub fn touch(&mut self, tile: TileId, channel: Channel, now_ms: u64) -> bool {
        match self.entries.get_mut(&(tile, channel)) {
            Some(entry) => {
                entry.last_touched_ms = entry.last_touched_ms.max(now_ms);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, tile: TileId, channel: Channel) -> bool {
        self.entries.contains_key(&(tile, channel))
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_over_budget(&self) -> bool {
        self.total_bytes > self.threshold_bytes()
    }

    /// Total number of entries evicted so far
    pub fn evictions(&self) -> usize {
        self.evictions
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    /// Deregister every entry regardless of age, in tile order. Used when
    /// caching is switched off for the current context.
    pub fn drain(&mut self) -> Vec<EvictionCandidate> {
        let mut drained: Vec<EvictionCandidate> = self
            .entries
            .drain()
            .map(|((tile, channel), e)| EvictionCandidate {
                tile,
                channel,
                generation: e.generation,
                bytes: e.bytes,
            })
            .collect();
        drained.sort_by_key(|c| (c.tile, c.channel));
        self.total_bytes = 0;
        self.evictions += drained.len();
        drained
    }

    /// Run one eviction pass. Selected entries are deregistered and returned
    /// so the state machine can unload them.
    pub fn evict(&mut self, now_ms: u64) -> Vec<EvictionCandidate> {
        if !self.is_over_budget() {
            return Vec::new();
        }

        let keep_alive = self.budget.keep_alive_ms;
        let mut eligible: Vec<((TileId, Channel), BudgetEntry)> = self
            .entries
            .iter()
            .filter(|(_, e)| now_ms.saturating_sub(e.last_touched_ms) >= keep_alive)
            .map(|(k, e)| (*k, *e))
            .collect();
        eligible.sort_by(|a, b| {
            a.1.last_touched_ms
                .cmp(&b.1.last_touched_ms)
                .then_with(|| a.0.cmp(&b.0))
        });

        let threshold = self.threshold_bytes();
        let mut evicted = Vec::new();
        for ((tile, channel), entry) in eligible {
            if self.total_bytes <= threshold {
                break;
            }
            self.deregister(tile, channel);
            evicted.push(EvictionCandidate {
                tile,
                channel,
                generation: entry.generation,
                bytes: entry.bytes,
            });
        }
        self.evictions += evicted.len();

        if self.total_bytes > threshold {
            warn!(
                "Tile cache still over budget after eviction: {:.1}MB / {:.1}MB ({} entries inside keep-alive)",
                self.total_bytes as f64 / MIB as f64,
                threshold as f64 / MIB as f64,
                self.entries.len()
            );
        }

        evicted
    }
}
