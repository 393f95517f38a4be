//! The streaming context object.
//!
//! [`TerrainLoader`] owns the tile registry and every piece of streaming state
//! and advances them once per [`TerrainLoader::tick`]:
//!
//! 1. proximity diff into the reference tracker
//! 2. desired-state flips into the load state machine
//! 3. in-flight loads polled for completion or stall
//! 4. queued loads started within the per-tick time budget
//! 5. budget eviction pass

use std::path::Path;

use tracing::{debug, info};

use crate::auto_loader::{DistanceAutoLoader, ProximityRanges, ViewMode};
use crate::budget::{CacheThreshold, ExecutionContext, MemoryBudgetedCache};
use crate::config::StreamingConfig;
use crate::content::TileContent;
use crate::error::{Result, StreamingError};
use crate::masks::{BakeInputs, BakeKind, BakeRegistry, InvalidationTag, MaskBakeCache, MaskHandle, MaskKey};
use crate::references::ReferenceTracker;
use crate::registry::TileRegistry;
use crate::state_machine::{LoadStateMachine, TickReport};
use crate::tile::{Channel, HolderId, LoadState, TerrainSet, TileBounds, TileId};

pub struct TerrainLoader {
    config: StreamingConfig,
    registry: TileRegistry,
    tracker: ReferenceTracker,
    auto_loader: DistanceAutoLoader,
    machine: LoadStateMachine,
    budget: MemoryBudgetedCache,
    masks: MaskBakeCache,
    world_map: Option<TileId>,
    ticks: u64,
}

impl TerrainLoader {
    pub fn new(config: StreamingConfig) -> Self {
        Self::with_registry(config, TileRegistry::new())
    }

    pub fn with_registry(config: StreamingConfig, registry: TileRegistry) -> Self {
        let mut auto_loader = DistanceAutoLoader::new(config.ranges);
        auto_loader.set_mode(config.view_mode);
        Self {
            machine: LoadStateMachine::new(
                config.loading_time_threshold_ms,
                config.progress_timeout_ms,
                config.context,
            ),
            budget: MemoryBudgetedCache::new(config.budget),
            auto_loader,
            tracker: ReferenceTracker::new(),
            registry,
            masks: MaskBakeCache::new(),
            world_map: None,
            ticks: 0,
            config,
        }
    }

    /// Persist baked masks under `dir`.
    pub fn with_mask_storage<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.masks = MaskBakeCache::with_storage(dir);
        self
    }

    /// Rebuild from a saved manifest. Channels that were loaded when the
    /// manifest was written get a [`HolderId::Restored`] reference so they
    /// come back on the next tick. Returns `Ok(None)` if `dir` has no manifest.
    pub fn restore<P: AsRef<Path>>(config: StreamingConfig, dir: P) -> Result<Option<Self>> {
        let Some(registry) = TileRegistry::load(dir)? else {
            return Ok(None);
        };
        let mut loader = Self::with_registry(config, registry);
        let mut restored = 0;
        for id in loader.registry.ids() {
            let last_known = loader.registry.tile(id)?.last_known;
            for channel in Channel::ALL {
                if last_known[channel.index()] == LoadState::Loaded {
                    loader
                        .tracker
                        .add_reference(&mut loader.registry, id, channel, HolderId::Restored)?;
                    restored += 1;
                }
            }
        }
        info!("Restored {} tiles, {} channels requested", loader.registry.len(), restored);
        Ok(Some(loader))
    }

    /// Drop every [`HolderId::Restored`] reference, typically once proximity
    /// loading has taken over.
    pub fn release_restored(&mut self) {
        self.tracker
            .remove_holder_everywhere(&mut self.registry, HolderId::Restored);
    }

    pub fn save_manifest<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        self.registry.save(dir)
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn registry(&self) -> &TileRegistry {
        &self.registry
    }

    pub fn budget(&self) -> &MemoryBudgetedCache {
        &self.budget
    }

    pub fn state_machine(&self) -> &LoadStateMachine {
        &self.machine
    }

    pub fn auto_loader(&self) -> &DistanceAutoLoader {
        &self.auto_loader
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    // Tiles

    pub fn register_tile(&mut self, id: TileId, bounds: TileBounds, set: TerrainSet) -> Result<()> {
        self.registry.register(id, bounds, set)
    }

    /// Unload and forget a tile. Masks baked for it are invalidated.
    pub fn remove_tile(&mut self, id: TileId, content: &mut dyn TileContent) -> Result<()> {
        if !self.registry.contains(id) {
            return Err(StreamingError::UnknownTile(id));
        }
        self.machine
            .forget_tile(&mut self.registry, &mut self.budget, content, id);
        self.auto_loader.forget(id);
        self.registry.remove(id);
        if self.world_map == Some(id) {
            self.world_map = None;
        }
        let masks = self.masks.invalidate(&InvalidationTag::Tile(id));
        debug!("Removed tile {} ({} masks invalidated)", id, masks);
        Ok(())
    }

    pub fn channel_state(&self, tile: TileId, channel: Channel) -> Result<LoadState> {
        Ok(self.registry.tile(tile)?.channel(channel).load)
    }

    // References

    pub fn add_reference(&mut self, tile: TileId, channel: Channel, holder: HolderId) -> Result<()> {
        self.tracker.add_reference(&mut self.registry, tile, channel, holder)
    }

    pub fn remove_reference(&mut self, tile: TileId, channel: Channel, holder: HolderId) -> Result<()> {
        self.tracker
            .remove_reference(&mut self.registry, tile, channel, holder)
    }

    pub fn remove_all_references(&mut self, tile: TileId, channel: Channel) -> Result<()> {
        self.tracker
            .remove_all_references(&mut self.registry, tile, channel)
    }

    /// Holders of a channel, sorted.
    pub fn holders(&self, tile: TileId, channel: Channel) -> Result<Vec<HolderId>> {
        let mut holders: Vec<HolderId> = self
            .registry
            .tile(tile)?
            .channel(channel)
            .holders
            .iter()
            .copied()
            .collect();
        holders.sort();
        Ok(holders)
    }

    pub fn is_desired(&self, tile: TileId, channel: Channel) -> Result<bool> {
        self.tracker.is_desired(&self.registry, tile, channel)
    }

    /// Record a use of the channel's content, restarting its keep-alive
    /// window if it is cached.
    pub fn touch(&mut self, tile: TileId, channel: Channel, now_ms: u64) -> Result<()> {
        let state = self.registry.tile_mut(tile)?.channel_mut(channel);
        state.last_touched_ms = state.last_touched_ms.max(now_ms);
        self.budget.touch(tile, channel, now_ms);
        Ok(())
    }

    /// Hold every tile of the active terrain set. Returns the number of tiles
    /// referenced.
    pub fn load_all(&mut self) -> usize {
        let set = self.auto_loader.mode().terrain_set();
        let channel = if self.machine.collider_only() {
            Channel::Collider
        } else {
            Channel::Regular
        };
        let ids: Vec<TileId> = self
            .registry
            .iter()
            .filter(|t| t.set == set)
            .map(|t| t.id)
            .collect();
        for &id in &ids {
            // ids were just read from the registry
            let _ = self
                .tracker
                .add_reference(&mut self.registry, id, channel, HolderId::LoadAll);
        }
        info!("Load all: {} tiles requested on {}", ids.len(), channel.name());
        ids.len()
    }

    /// Release every channel and clear every holder, synchronously.
    pub fn unload_all(&mut self, content: &mut dyn TileContent) -> usize {
        let released = self
            .machine
            .unload_all(&mut self.registry, &mut self.budget, content);
        self.tracker.drain_changes();
        self.auto_loader.reset();
        released
    }

    pub fn set_collider_only(&mut self, enabled: bool) -> Result<()> {
        self.machine.set_collider_only(&self.registry, enabled)
    }

    pub fn collider_only(&self) -> bool {
        self.machine.collider_only()
    }

    // Proximity

    pub fn set_origin(&mut self, origin: Option<[f64; 3]>) {
        self.auto_loader.set_origin(origin);
    }

    pub fn origin(&self) -> Option<[f64; 3]> {
        self.auto_loader.origin()
    }

    pub fn set_ranges(&mut self, ranges: ProximityRanges) {
        self.config.ranges = ranges;
        self.auto_loader.set_ranges(ranges);
    }

    pub fn ranges(&self) -> ProximityRanges {
        self.auto_loader.ranges()
    }

    pub fn set_view_mode(&mut self, mode: ViewMode) {
        self.config.view_mode = mode;
        self.auto_loader.set_mode(mode);
    }

    pub fn view_mode(&self) -> ViewMode {
        self.auto_loader.mode()
    }

    pub fn set_auto_load_enabled(&mut self, enabled: bool) {
        self.auto_loader.set_enabled(enabled);
    }

    // Cache policy

    pub fn set_cache_in_runtime(&mut self, enabled: bool) {
        self.config.budget.cache_in_runtime = enabled;
        self.budget.budget_mut().cache_in_runtime = enabled;
    }

    pub fn set_cache_in_editor(&mut self, enabled: bool) {
        self.config.budget.cache_in_editor = enabled;
        self.budget.budget_mut().cache_in_editor = enabled;
    }

    pub fn set_threshold(&mut self, threshold: CacheThreshold) {
        self.config.budget.threshold = threshold;
        self.budget.budget_mut().threshold = threshold;
    }

    pub fn set_keep_alive_ms(&mut self, ms: u64) {
        self.config.budget.keep_alive_ms = ms;
        self.budget.budget_mut().keep_alive_ms = ms;
    }

    pub fn set_execution_context(&mut self, context: ExecutionContext) {
        self.config.context = context;
        self.machine.set_context(context);
    }

    pub fn set_loading_time_threshold_ms(&mut self, ms: u64) {
        self.config.loading_time_threshold_ms = ms;
        self.machine.set_loading_time_threshold_ms(ms);
    }

    pub fn set_progress_timeout_ms(&mut self, ms: u64) {
        self.config.progress_timeout_ms = ms;
        self.machine.set_progress_timeout_ms(ms);
    }

    // Masks

    pub fn masks(&self) -> &MaskBakeCache {
        &self.masks
    }

    pub fn masks_mut(&mut self) -> &mut MaskBakeCache {
        &mut self.masks
    }

    pub fn set_world_map(&mut self, tile: Option<TileId>) {
        self.world_map = tile;
    }

    pub fn world_map(&self) -> Option<TileId> {
        self.world_map
    }

    pub fn bake_inputs(&self) -> BakeInputs<'_> {
        BakeInputs::new(&self.registry, self.world_map)
    }

    /// Fetch or bake a mask with the registered baker for its kind.
    pub fn bake_mask(&mut self, key: &MaskKey, bakers: &BakeRegistry) -> Option<MaskHandle> {
        let inputs = BakeInputs::new(&self.registry, self.world_map);
        self.masks.get_or_bake_with(key, bakers, &inputs)
    }

    /// A spawn rule's parameters changed.
    pub fn spawn_rule_changed(&mut self, guid: &str) -> usize {
        self.masks.invalidate(&InvalidationTag::spawn_rule(guid))
    }

    /// Content on a collision layer changed.
    pub fn layer_changed(&mut self, bit: u32) -> usize {
        self.masks.invalidate(&InvalidationTag::LayerBit(bit))
    }

    /// The world biome map was edited.
    pub fn world_biome_edited(&mut self) -> usize {
        self.masks.invalidate(&InvalidationTag::Kind(BakeKind::WorldBiome))
    }

    // Tick

    pub fn tick(&mut self, now_ms: u64, content: &mut dyn TileContent) -> TickReport {
        let mut report = TickReport::default();
        self.ticks += 1;

        let collider_only = self.machine.collider_only();
        self.auto_loader
            .apply(&mut self.registry, &mut self.tracker, collider_only);

        let changes = self.tracker.drain_changes();
        report.reference_changes = changes.len();
        self.machine.apply_changes(
            &changes,
            &mut self.registry,
            &mut self.budget,
            content,
            now_ms,
            &mut report,
        );

        self.machine
            .poll_loading(&mut self.registry, &mut self.budget, content, now_ms, &mut report);
        self.machine
            .start_queued(&mut self.registry, content, now_ms, &mut report);

        let candidates = if self.budget.budget().caching_enabled(self.machine.context()) {
            self.budget.evict(now_ms)
        } else {
            // Caching was switched off for this context since these were cached
            self.budget.drain()
        };
        self.machine
            .apply_evictions(&candidates, &mut self.registry, content, &mut report);

        if self.budget.is_over_budget() {
            report.over_budget = Some(StreamingError::BudgetUnsatisfiable {
                total_bytes: self.budget.total_bytes(),
                threshold_bytes: self.budget.threshold_bytes(),
            });
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use super::*;
    use crate::budget::CacheBudget;
    use crate::content::LoadProgress;
    use crate::masks::MaskTexture;
    use crate::sim::SyntheticContent;

    const MIB: u64 = 1024 * 1024;

    /// Loads complete on the first poll unless the tile is marked as stuck.
    #[derive(Default)]
    struct ScriptedContent {
        resident: HashSet<(TileId, Channel)>,
        stuck: HashSet<TileId>,
        bytes: HashMap<TileId, u64>,
        begins: usize,
        releases: usize,
    }

    impl TileContent for ScriptedContent {
        fn begin_load(&mut self, _tile: TileId, _channel: Channel) -> Result<()> {
            self.begins += 1;
            Ok(())
        }

        fn poll_load(&mut self, tile: TileId, channel: Channel) -> LoadProgress {
            if self.stuck.contains(&tile) {
                return LoadProgress::Pending;
            }
            self.resident.insert((tile, channel));
            LoadProgress::Complete {
                resident_bytes: self.bytes.get(&tile).copied().unwrap_or(MIB),
            }
        }

        fn release(&mut self, tile: TileId, channel: Channel) {
            self.resident.remove(&(tile, channel));
            self.releases += 1;
        }
    }

    fn config() -> StreamingConfig {
        StreamingConfig {
            ranges: ProximityRanges {
                regular: 10.0,
                impostor: 150.0,
            },
            budget: CacheBudget {
                threshold: CacheThreshold::Custom(10 * MIB),
                keep_alive_ms: 1_000,
                cache_in_runtime: true,
                cache_in_editor: false,
            },
            loading_time_threshold_ms: 1_000,
            progress_timeout_ms: 500,
            context: ExecutionContext::runtime(),
            view_mode: ViewMode::World,
            tile_size: 100.0,
            tile_height: 10.0,
        }
    }

    fn loader_with_grid(n: i32) -> TerrainLoader {
        let cfg = config();
        let mut loader = TerrainLoader::new(cfg.clone());
        for x in 0..n {
            for y in 0..n {
                let id = TileId::new(x, y);
                loader
                    .register_tile(id, TileBounds::from_grid(id, cfg.tile_size, cfg.tile_height), TerrainSet::World)
                    .unwrap();
            }
        }
        loader
    }

    #[test]
    fn test_reference_loads_then_caches() {
        let mut loader = loader_with_grid(2);
        let mut content = ScriptedContent::default();
        let tile = TileId::new(0, 0);

        loader.add_reference(tile, Channel::Regular, HolderId::External(1)).unwrap();
        let report = loader.tick(0, &mut content);
        assert_eq!(report.started, 1);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Loading);

        let report = loader.tick(10, &mut content);
        assert_eq!(report.completed, 1);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Loaded);

        loader.remove_reference(tile, Channel::Regular, HolderId::External(1)).unwrap();
        let report = loader.tick(20, &mut content);
        assert_eq!(report.cached, 1);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Cached);
        assert_eq!(loader.budget().total_bytes(), MIB);

        // Re-referencing a cached channel does not reload it
        loader.add_reference(tile, Channel::Regular, HolderId::External(2)).unwrap();
        let report = loader.tick(30, &mut content);
        assert_eq!(report.cache_hits, 1);
        assert_eq!(report.started, 0);
        assert_eq!(content.begins, 1);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Loaded);
        assert!(loader.budget().is_empty());
    }

    #[test]
    fn test_unloaded_never_jumps_to_resident() {
        let mut loader = loader_with_grid(3);
        let mut content = ScriptedContent::default();
        let mut seen: HashMap<(TileId, Channel), LoadState> = HashMap::new();

        for step in 0..12u64 {
            let x = (step % 3) as f64 * 100.0 + 50.0;
            loader.set_origin(Some([x, 5.0, 50.0]));
            loader.tick(step * 100, &mut content);
            for tile in loader.registry().iter() {
                for channel in Channel::ALL {
                    let now = tile.channel(channel).load;
                    let before = seen.insert((tile.id, channel), now).unwrap_or_default();
                    assert!(
                        !(before == LoadState::Unloaded && now.is_resident()),
                        "{} {} jumped from Unloaded to {:?}",
                        tile.id,
                        channel.name(),
                        now
                    );
                }
            }
        }
    }

    #[test]
    fn test_origin_move_swaps_regular_for_impostor_in_one_tick() {
        let mut loader = loader_with_grid(3);
        let mut content = ScriptedContent::default();
        let tile = TileId::new(0, 0);

        loader.set_origin(Some([50.0, 5.0, 50.0]));
        loader.tick(0, &mut content);
        loader.tick(10, &mut content);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Loaded);
        assert_eq!(loader.holders(tile, Channel::Impostor).unwrap(), vec![]);

        // Tile (0, 0) is now 40 units away: outside regular, inside impostor
        loader.set_origin(Some([140.0, 5.0, 50.0]));
        loader.tick(20, &mut content);
        assert_eq!(loader.holders(tile, Channel::Regular).unwrap(), vec![]);
        assert_eq!(loader.holders(tile, Channel::Impostor).unwrap(), vec![HolderId::Proximity]);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Cached);
        assert_eq!(loader.channel_state(tile, Channel::Impostor).unwrap(), LoadState::Loading);
    }

    #[test]
    fn test_collider_only_requires_unload_all() {
        let mut loader = loader_with_grid(2);
        let mut content = ScriptedContent::default();
        let tile = TileId::new(1, 1);
        loader.add_reference(tile, Channel::Regular, HolderId::External(7)).unwrap();
        loader.tick(0, &mut content);
        loader.tick(10, &mut content);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Loaded);

        let err = loader.set_collider_only(true).unwrap_err();
        assert!(matches!(err, StreamingError::ModeConflict { resident_channels: 1 }));
        assert!(!loader.collider_only());
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Loaded);
        assert_eq!(loader.holders(tile, Channel::Regular).unwrap(), vec![HolderId::External(7)]);

        assert_eq!(loader.unload_all(&mut content), 1);
        assert!(content.resident.is_empty());
        loader.set_collider_only(true).unwrap();

        // Proximity now drives the collider channel and unloads skip the cache
        loader.set_origin(Some([150.0, 5.0, 150.0]));
        loader.tick(20, &mut content);
        loader.tick(30, &mut content);
        assert_eq!(loader.channel_state(tile, Channel::Collider).unwrap(), LoadState::Loaded);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Unloaded);
        loader.set_origin(None);
        let report = loader.tick(40, &mut content);
        assert_eq!(report.cached, 0);
        assert_eq!(loader.channel_state(tile, Channel::Collider).unwrap(), LoadState::Unloaded);
    }

    #[test]
    fn test_stalled_load_reverts_to_unloaded() {
        let mut loader = loader_with_grid(1);
        let mut content = ScriptedContent::default();
        let tile = TileId::new(0, 0);
        content.stuck.insert(tile);

        loader.add_reference(tile, Channel::Regular, HolderId::External(1)).unwrap();
        loader.tick(0, &mut content);
        let report = loader.tick(400, &mut content);
        assert!(report.failures.is_empty());
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Loading);

        let report = loader.tick(600, &mut content);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0],
            StreamingError::StallTimeout { elapsed_ms: 600, .. }
        ));
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Unloaded);
        assert_eq!(content.releases, 1);
    }

    #[test]
    fn test_zero_time_budget_starts_one_load_per_tick() {
        let mut loader = loader_with_grid(2);
        loader.set_loading_time_threshold_ms(0);
        let mut content = ScriptedContent::default();
        for id in loader.registry().ids() {
            content.stuck.insert(id);
        }
        assert_eq!(loader.load_all(), 4);

        let report = loader.tick(0, &mut content);
        assert_eq!(report.started, 1);
        assert_eq!(report.queued, 3);
        let report = loader.tick(1, &mut content);
        assert_eq!(report.started, 1);
        assert_eq!(report.queued, 2);
    }

    #[test]
    fn test_tick_evicts_aged_cache_entries() {
        let mut loader = loader_with_grid(3);
        let mut content = ScriptedContent::default();
        let ids = [TileId::new(0, 0), TileId::new(1, 0), TileId::new(2, 0)];
        for id in ids {
            content.bytes.insert(id, 4 * MIB);
        }

        // Cache three 4MB channels, the last one much later than the others
        for (i, &id) in ids.iter().enumerate() {
            let t = if i < 2 { i as u64 * 10 } else { 5_000 };
            loader.add_reference(id, Channel::Regular, HolderId::External(1)).unwrap();
            loader.tick(t, &mut content);
            loader.tick(t + 1, &mut content);
            loader.remove_reference(id, Channel::Regular, HolderId::External(1)).unwrap();
            loader.tick(t + 2, &mut content);
        }
        assert_eq!(loader.budget().len(), 2);
        assert_eq!(loader.channel_state(ids[0], Channel::Regular).unwrap(), LoadState::Unloaded);
        assert_eq!(loader.channel_state(ids[1], Channel::Regular).unwrap(), LoadState::Cached);
        assert_eq!(loader.channel_state(ids[2], Channel::Regular).unwrap(), LoadState::Cached);
    }

    #[test]
    fn test_fresh_cache_entries_keep_budget_exceeded() {
        let mut loader = loader_with_grid(3);
        loader.set_threshold(CacheThreshold::Custom(MIB));
        let mut content = ScriptedContent::default();
        for id in [TileId::new(0, 0), TileId::new(0, 1)] {
            loader.add_reference(id, Channel::Regular, HolderId::External(3)).unwrap();
        }
        loader.tick(10, &mut content);
        loader.tick(11, &mut content);
        for id in [TileId::new(0, 0), TileId::new(0, 1)] {
            loader.remove_reference(id, Channel::Regular, HolderId::External(3)).unwrap();
        }
        let report = loader.tick(12, &mut content);
        assert_eq!(report.cached, 2);
        assert!(matches!(report.over_budget, Some(StreamingError::BudgetUnsatisfiable { .. })));
        assert_eq!(report.evicted, 0);
    }

    #[test]
    fn test_disabling_cache_context_flushes_cached() {
        let mut loader = loader_with_grid(1);
        let mut content = ScriptedContent::default();
        let tile = TileId::new(0, 0);
        loader.add_reference(tile, Channel::Regular, HolderId::External(1)).unwrap();
        loader.tick(0, &mut content);
        loader.tick(1, &mut content);
        loader.remove_reference(tile, Channel::Regular, HolderId::External(1)).unwrap();
        loader.tick(2, &mut content);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Cached);

        loader.set_execution_context(ExecutionContext::editor());
        let report = loader.tick(3, &mut content);
        assert_eq!(report.evicted, 1);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Unloaded);
    }

    #[test]
    fn test_restore_requests_previously_loaded_channels() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = loader_with_grid(2);
        let mut content = ScriptedContent::default();
        let tile = TileId::new(1, 0);
        loader.add_reference(tile, Channel::Impostor, HolderId::External(1)).unwrap();
        loader.tick(0, &mut content);
        loader.tick(1, &mut content);
        loader.save_manifest(dir.path()).unwrap();

        let mut restored = TerrainLoader::restore(config(), dir.path()).unwrap().unwrap();
        assert_eq!(restored.registry().len(), 4);
        assert_eq!(restored.holders(tile, Channel::Impostor).unwrap(), vec![HolderId::Restored]);
        let mut content = ScriptedContent::default();
        restored.tick(0, &mut content);
        restored.tick(1, &mut content);
        assert_eq!(restored.channel_state(tile, Channel::Impostor).unwrap(), LoadState::Loaded);

        restored.release_restored();
        assert!(!restored.is_desired(tile, Channel::Impostor).unwrap());
    }

    #[test]
    fn test_remove_tile_invalidates_masks() {
        let mut loader = loader_with_grid(2);
        let mut content = ScriptedContent::default();
        let tile = TileId::new(0, 1);
        let key = MaskKey::layers(tile, 1, 4);
        let other = MaskKey::layers(TileId::new(1, 1), 1, 4);
        for k in [&key, &other] {
            loader
                .masks_mut()
                .get_or_bake(k, |_| Ok(MaskTexture::new_with(4, 4, 1)))
                .unwrap();
        }

        loader.remove_tile(tile, &mut content).unwrap();
        assert!(!loader.masks().contains(&key));
        assert!(loader.masks().contains(&other));
        assert!(matches!(
            loader.channel_state(tile, Channel::Regular),
            Err(StreamingError::UnknownTile(_))
        ));
        assert_eq!(loader.layer_changed(0), 1);
    }

    #[test]
    fn test_bake_mask_uses_world_map() {
        let mut loader = loader_with_grid(2);
        let mut content = ScriptedContent::default();
        let world = TileId::new(0, 0);
        loader.set_world_map(Some(world));

        let mut bakers = BakeRegistry::new();
        bakers.register_fn(BakeKind::WorldBiome, |_: &MaskKey, inputs: &BakeInputs<'_>| {
            inputs.require_world_map()?;
            Ok(MaskTexture::new_with(2, 2, 255))
        });
        let key = MaskKey::biome(TileId::new(1, 1), "savanna", 2);
        assert!(loader.bake_mask(&key, &bakers).is_none());

        loader.add_reference(world, Channel::Regular, HolderId::External(1)).unwrap();
        loader.tick(0, &mut content);
        loader.tick(1, &mut content);
        let handle = loader.bake_mask(&key, &bakers).unwrap();
        assert!(loader.masks().is_current(&handle));

        assert_eq!(loader.world_biome_edited(), 1);
        assert!(!loader.masks().is_current(&handle));
    }

    #[test]
    fn test_untouched_reference_blocks_collider_only() {
        let mut loader = loader_with_grid(2);
        let mut content = ScriptedContent::default();
        let tile = TileId::new(0, 1);

        // Referenced but not yet queued: nothing has ticked since
        loader.add_reference(tile, Channel::Regular, HolderId::External(1)).unwrap();
        let err = loader.set_collider_only(true).unwrap_err();
        assert!(matches!(err, StreamingError::ModeConflict { resident_channels: 1 }));
        assert!(!loader.collider_only());

        loader.tick(0, &mut content);
        loader.tick(10, &mut content);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Loaded);

        // Proximity holders count too
        loader.unload_all(&mut content);
        loader.set_origin(Some([50.0, 5.0, 50.0]));
        loader.tick(20, &mut content);
        assert!(loader.set_collider_only(true).is_err());
        loader.unload_all(&mut content);
        loader.set_collider_only(true).unwrap();
    }

    #[test]
    fn test_reregistered_tile_gets_proximity_again() {
        let mut loader = loader_with_grid(1);
        let mut content = ScriptedContent::default();
        let tile = TileId::new(0, 0);
        loader.set_origin(Some([50.0, 5.0, 50.0]));
        loader.tick(0, &mut content);
        loader.tick(10, &mut content);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Loaded);

        loader.remove_tile(tile, &mut content).unwrap();
        assert!(!loader.auto_loader().is_held(tile, Channel::Regular));
        let cfg = config();
        loader
            .register_tile(tile, TileBounds::from_grid(tile, cfg.tile_size, cfg.tile_height), TerrainSet::World)
            .unwrap();

        loader.tick(20, &mut content);
        assert_eq!(loader.holders(tile, Channel::Regular).unwrap(), vec![HolderId::Proximity]);
        loader.tick(30, &mut content);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Loaded);
    }

    #[test]
    fn test_failed_load_reverts_to_unloaded() {
        let mut loader = loader_with_grid(2);
        let mut content = SyntheticContent::new(1, [MIB; 3]);
        let tile = TileId::new(1, 0);
        content.broken.insert(tile);

        loader.add_reference(tile, Channel::Regular, HolderId::External(4)).unwrap();
        loader.tick(0, &mut content);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Loading);

        let report = loader.tick(10, &mut content);
        assert_eq!(report.completed, 0);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            &report.failures[0],
            StreamingError::LoadFailed { tile: t, channel: Channel::Regular, .. } if *t == tile
        ));
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Unloaded);
        assert_eq!(content.releases, 1);
        assert!(!content.is_resident(tile, Channel::Regular));

        // Not retried behind the caller's back
        let report = loader.tick(20, &mut content);
        assert!(report.failures.is_empty());
        assert_eq!(content.loads_started, 1);
        assert_eq!(content.releases, 1);
    }

    #[test]
    fn test_unload_all_cancels_in_flight_loads() {
        let mut loader = loader_with_grid(2);
        let mut content = SyntheticContent::new(5, [MIB; 3]);
        let tile = TileId::new(1, 1);

        loader.add_reference(tile, Channel::Regular, HolderId::External(2)).unwrap();
        loader.tick(0, &mut content);
        loader.tick(10, &mut content);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Loading);
        assert_eq!(content.pending_count(), 1);

        assert_eq!(loader.unload_all(&mut content), 1);
        assert_eq!(content.pending_count(), 0);
        assert_eq!(content.releases, 1);
        assert_eq!(loader.state_machine().in_flight_len(), 0);
        assert_eq!(loader.state_machine().queued_len(), 0);
        assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Unloaded);

        for step in 2..10u64 {
            let report = loader.tick(step * 10, &mut content);
            assert_eq!(report.completed, 0);
            assert!(report.failures.is_empty());
            assert_eq!(loader.channel_state(tile, Channel::Regular).unwrap(), LoadState::Unloaded);
        }
        assert_eq!(content.loads_started, 1);
        assert!(!content.is_resident(tile, Channel::Regular));
    }
}
