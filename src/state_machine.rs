//! Per tile, per channel load state machine.
//!
//! ```text
//!   Unloaded --desired--> (queued) --budget--> Loading --complete--> Loaded
//!      ^                                          |                  |   ^
//!      |<------------- stall / failure ----------+                   |   | desired
//!      |                                                  undesired  v   |
//!      |<------------ evicted / caching off ------------------------ Cached
//! ```
//!
//! Loads start through a queue bounded by a per-tick wall-clock budget. A load
//! that does not complete within the progress timeout is abandoned: its
//! content is released and the channel falls back to `Unloaded`.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::budget::{EvictionCandidate, ExecutionContext, MemoryBudgetedCache};
use crate::content::{LoadProgress, TileContent};
use crate::error::{Result, StreamingError};
use crate::references::DesiredChange;
use crate::registry::TileRegistry;
use crate::tile::{Channel, LoadState, TileId};
use crate::timer::Timer;

/// What happened during one tick.
#[derive(Debug, Default)]
pub struct TickReport {
    pub reference_changes: usize,
    pub started: usize,
    pub completed: usize,
    pub cache_hits: usize,
    pub cached: usize,
    pub unloaded: usize,
    pub evicted: usize,
    pub queued: usize,
    /// Stalled or failed loads, recovered by reverting to `Unloaded`
    pub failures: Vec<StreamingError>,
    /// Set when the budget stays exceeded after the eviction pass
    pub over_budget: Option<StreamingError>,
}

impl TickReport {
    pub fn summary(&self) -> String {
        format!(
            "refs: {} | started: {} | done: {} | hits: {} | cached: {} | unloaded: {} | evicted: {} | queued: {} | failed: {}",
            self.reference_changes,
            self.started,
            self.completed,
            self.cache_hits,
            self.cached,
            self.unloaded,
            self.evicted,
            self.queued,
            self.failures.len()
        )
    }
}

pub struct LoadStateMachine {
    queue: VecDeque<(TileId, Channel)>,
    in_flight: Vec<(TileId, Channel)>,
    loading_time_threshold_ms: u64,
    progress_timeout_ms: u64,
    collider_only: bool,
    context: ExecutionContext,
}

impl LoadStateMachine {
    pub fn new(loading_time_threshold_ms: u64, progress_timeout_ms: u64, context: ExecutionContext) -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: Vec::new(),
            loading_time_threshold_ms,
            progress_timeout_ms,
            collider_only: false,
            context,
        }
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn set_context(&mut self, context: ExecutionContext) {
        self.context = context;
    }

    pub fn set_loading_time_threshold_ms(&mut self, ms: u64) {
        self.loading_time_threshold_ms = ms;
    }

    pub fn set_progress_timeout_ms(&mut self, ms: u64) {
        self.progress_timeout_ms = ms;
    }

    pub fn collider_only(&self) -> bool {
        self.collider_only
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Toggle collider-only loading. Rejected unless nothing is resident,
    /// loading, queued or referenced; callers must `unload_all` first.
    pub fn set_collider_only(&mut self, registry: &TileRegistry, enabled: bool) -> Result<()> {
        if enabled == self.collider_only {
            return Ok(());
        }
        let resident_channels = registry
            .iter()
            .flat_map(|t| t.channels.iter())
            .filter(|c| c.load != LoadState::Unloaded || c.queued || !c.holders.is_empty())
            .count();
        if resident_channels > 0 {
            return Err(StreamingError::ModeConflict { resident_channels });
        }
        info!("Collider-only loading {}", if enabled { "enabled" } else { "disabled" });
        self.collider_only = enabled;
        Ok(())
    }

    /// Apply desired-state flips collected by the reference tracker.
    pub fn apply_changes(
        &mut self,
        changes: &[DesiredChange],
        registry: &mut TileRegistry,
        budget: &mut MemoryBudgetedCache,
        content: &mut dyn TileContent,
        now_ms: u64,
        report: &mut TickReport,
    ) {
        for change in changes {
            let Some(tile) = registry.get_mut(change.tile) else {
                continue;
            };
            let state = tile.channel_mut(change.channel);
            // The holder set is authoritative; the event only says "look here"
            let active = !state.holders.is_empty();
            let (load, queued) = (state.load, state.queued);

            if active {
                match load {
                    LoadState::Unloaded if !queued => {
                        state.queued = true;
                        self.queue.push_back((change.tile, change.channel));
                    }
                    LoadState::Cached => {
                        budget.deregister(change.tile, change.channel);
                        state.transition(LoadState::Loaded);
                        state.last_touched_ms = now_ms;
                        report.cache_hits += 1;
                        debug!("Cache hit {} {}", change.tile, change.channel.name());
                    }
                    _ => {}
                }
            } else {
                match load {
                    LoadState::Unloaded if queued => {
                        state.queued = false;
                        self.queue
                            .retain(|&(t, c)| !(t == change.tile && c == change.channel));
                    }
                    LoadState::Loaded => {
                        self.settle_unreferenced(change.tile, change.channel, registry, budget, content, now_ms, report);
                    }
                    // Loading finishes first, then settles
                    _ => {}
                }
            }
        }
    }

    /// Poll in-flight loads for completion, failure or stall.
    pub fn poll_loading(
        &mut self,
        registry: &mut TileRegistry,
        budget: &mut MemoryBudgetedCache,
        content: &mut dyn TileContent,
        now_ms: u64,
        report: &mut TickReport,
    ) {
        let in_flight = std::mem::take(&mut self.in_flight);
        for (id, channel) in in_flight {
            let Some(tile) = registry.get_mut(id) else {
                continue;
            };
            let state = tile.channel_mut(channel);
            if state.load != LoadState::Loading {
                continue;
            }
            let since = state.loading_since_ms.unwrap_or(now_ms);

            match content.poll_load(id, channel) {
                LoadProgress::Complete { resident_bytes } => {
                    state.transition(LoadState::Loaded);
                    state.loading_since_ms = None;
                    state.estimated_bytes = resident_bytes.max(1);
                    state.last_touched_ms = now_ms;
                    report.completed += 1;
                    debug!("Loaded {} {} in {} ms", id, channel.name(), now_ms.saturating_sub(since));
                    if state.holders.is_empty() {
                        self.settle_unreferenced(id, channel, registry, budget, content, now_ms, report);
                    }
                }
                LoadProgress::Failed(reason) => {
                    warn!("Loading {} {} failed: {}", id, channel.name(), reason);
                    Self::drop_to_unloaded(registry, id, channel, content);
                    report.failures.push(StreamingError::LoadFailed {
                        tile: id,
                        channel,
                        reason,
                    });
                }
                LoadProgress::Pending => {
                    let elapsed_ms = now_ms.saturating_sub(since);
                    if elapsed_ms > self.progress_timeout_ms {
                        warn!(
                            "Loading {} {} made no progress for {} ms, abandoning",
                            id,
                            channel.name(),
                            elapsed_ms
                        );
                        Self::drop_to_unloaded(registry, id, channel, content);
                        report.failures.push(StreamingError::StallTimeout {
                            tile: id,
                            channel,
                            elapsed_ms,
                        });
                    } else {
                        self.in_flight.push((id, channel));
                    }
                }
            }
        }
    }

    /// Start queued loads until this tick's time budget is spent. At least one
    /// load starts per tick so the queue always drains.
    pub fn start_queued(
        &mut self,
        registry: &mut TileRegistry,
        content: &mut dyn TileContent,
        now_ms: u64,
        report: &mut TickReport,
    ) {
        let timer = Timer::started();
        let mut started = 0usize;

        while let Some((id, channel)) = self.queue.pop_front() {
            if started > 0 && timer.elapsed_ms() >= self.loading_time_threshold_ms {
                self.queue.push_front((id, channel));
                break;
            }
            let Some(tile) = registry.get_mut(id) else {
                continue;
            };
            let state = tile.channel_mut(channel);
            if !state.queued {
                continue;
            }
            state.queued = false;
            if state.load != LoadState::Unloaded || state.holders.is_empty() {
                continue;
            }

            match content.begin_load(id, channel) {
                Ok(()) => {
                    state.transition(LoadState::Loading);
                    state.loading_since_ms = Some(now_ms);
                    self.in_flight.push((id, channel));
                    started += 1;
                }
                Err(e) => {
                    warn!("Could not start loading {} {}: {}", id, channel.name(), e);
                    content.release(id, channel);
                    report.failures.push(e);
                }
            }
        }

        report.started += started;
        report.queued = self.queue.len();
    }

    /// Unload channels selected by the budget's eviction pass.
    pub fn apply_evictions(
        &mut self,
        candidates: &[EvictionCandidate],
        registry: &mut TileRegistry,
        content: &mut dyn TileContent,
        report: &mut TickReport,
    ) {
        for candidate in candidates {
            let Some(tile) = registry.get_mut(candidate.tile) else {
                continue;
            };
            let state = tile.channel(candidate.channel);
            // Re-referenced or re-cached since selection
            if state.load != LoadState::Cached || state.generation != candidate.generation {
                continue;
            }
            Self::drop_to_unloaded(registry, candidate.tile, candidate.channel, content);
            report.evicted += 1;
            debug!("Evicted {} {}", candidate.tile, candidate.channel.name());
        }
    }

    /// Synchronously release everything, including in-flight loads, and clear
    /// every holder.
    pub fn unload_all(
        &mut self,
        registry: &mut TileRegistry,
        budget: &mut MemoryBudgetedCache,
        content: &mut dyn TileContent,
    ) -> usize {
        let mut released = 0;
        for id in registry.ids() {
            for channel in Channel::ALL {
                let Some(tile) = registry.get_mut(id) else {
                    continue;
                };
                let state = tile.channel_mut(channel);
                state.holders.clear();
                state.desired = false;
                state.queued = false;
                if state.load != LoadState::Unloaded {
                    Self::drop_to_unloaded(registry, id, channel, content);
                    released += 1;
                }
            }
        }
        self.queue.clear();
        self.in_flight.clear();
        budget.clear();
        info!("Unloaded all tiles ({} channels released)", released);
        released
    }

    /// Release content for a tile that is about to leave the registry.
    pub fn forget_tile(
        &mut self,
        registry: &mut TileRegistry,
        budget: &mut MemoryBudgetedCache,
        content: &mut dyn TileContent,
        id: TileId,
    ) {
        for channel in Channel::ALL {
            budget.deregister(id, channel);
            let resident = registry
                .get(id)
                .map(|t| t.channel(channel).load != LoadState::Unloaded)
                .unwrap_or(false);
            if resident {
                Self::drop_to_unloaded(registry, id, channel, content);
            }
        }
        self.queue.retain(|&(t, _)| t != id);
        self.in_flight.retain(|&(t, _)| t != id);
    }

    /// A loaded channel lost its last holder: cache it or unload it.
    #[allow(clippy::too_many_arguments)]
    fn settle_unreferenced(
        &mut self,
        id: TileId,
        channel: Channel,
        registry: &mut TileRegistry,
        budget: &mut MemoryBudgetedCache,
        content: &mut dyn TileContent,
        now_ms: u64,
        report: &mut TickReport,
    ) {
        let cache = !self.collider_only && budget.budget().caching_enabled(self.context);
        if cache {
            if let Some(tile) = registry.get_mut(id) {
                let state = tile.channel_mut(channel);
                state.transition(LoadState::Cached);
                state.estimated_bytes = state.estimated_bytes.max(1);
                state.last_touched_ms = now_ms;
                budget.register(id, channel, state.estimated_bytes, state.generation, now_ms);
                report.cached += 1;
            }
        } else {
            Self::drop_to_unloaded(registry, id, channel, content);
            report.unloaded += 1;
        }
    }

    fn drop_to_unloaded(registry: &mut TileRegistry, id: TileId, channel: Channel, content: &mut dyn TileContent) {
        content.release(id, channel);
        if let Some(tile) = registry.get_mut(id) {
            let state = tile.channel_mut(channel);
            state.transition(LoadState::Unloaded);
            state.loading_since_ms = None;
            state.estimated_bytes = 0;
        }
    }
}
