//! Distance driven proximity references.
//!
//! Every tick the loader computes which tiles should carry the reserved
//! [`HolderId::Proximity`] reference on each channel and emits only the
//! difference against the previous tick. Adds and removes of one update are
//! applied together before the state machine runs, so re-centering never
//! leaves a tile transiently unreferenced.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::references::ReferenceTracker;
use crate::registry::TileRegistry;
use crate::tile::{Channel, HolderId, TerrainSet, TileId};

/// Which terrain set proximity loading looks at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewMode {
    #[default]
    World,
    Local,
}

impl ViewMode {
    pub fn terrain_set(self) -> TerrainSet {
        match self {
            ViewMode::World => TerrainSet::World,
            ViewMode::Local => TerrainSet::Local,
        }
    }
}

/// Proximity ranges in world units.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProximityRanges {
    /// Tiles within this distance get full detail
    pub regular: f64,
    /// Tiles beyond `regular` but within this distance get an impostor
    pub impostor: f64,
}

impl Default for ProximityRanges {
    fn default() -> Self {
        Self {
            regular: 1024.0,
            impostor: 4096.0,
        }
    }
}

/// Result of one proximity update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProximityDiff {
    pub added: Vec<(TileId, Channel)>,
    pub removed: Vec<(TileId, Channel)>,
}

impl ProximityDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len()
    }
}

pub struct DistanceAutoLoader {
    origin: Option<[f64; 3]>,
    ranges: ProximityRanges,
    mode: ViewMode,
    enabled: bool,
    held: HashSet<(TileId, Channel)>,
}

impl DistanceAutoLoader {
    pub fn new(ranges: ProximityRanges) -> Self {
        Self {
            origin: None,
            ranges,
            mode: ViewMode::World,
            enabled: true,
            held: HashSet::new(),
        }
    }

    pub fn origin(&self) -> Option<[f64; 3]> {
        self.origin
    }

    pub fn set_origin(&mut self, origin: Option<[f64; 3]>) {
        self.origin = origin;
    }

    pub fn ranges(&self) -> ProximityRanges {
        self.ranges
    }

    pub fn set_ranges(&mut self, ranges: ProximityRanges) {
        self.ranges = ranges;
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    /// Takes effect on the next update; proximity references of the old set
    /// are dropped in the same diff that adds the new set's.
    pub fn set_mode(&mut self, mode: ViewMode) {
        self.mode = mode;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_held(&self, tile: TileId, channel: Channel) -> bool {
        self.held.contains(&(tile, channel))
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Forget held references without emitting removals. Used after an
    /// unload-all has already cleared every holder.
    pub fn reset(&mut self) {
        self.held.clear();
    }

    /// Drop every held pair of a tile that left the registry, so a tile
    /// registered again under the same id is picked up on the next update.
    pub fn forget(&mut self, tile: TileId) {
        self.held.retain(|&(t, _)| t != tile);
    }

    /// Tile/channel pairs that should hold a proximity reference right now.
    pub fn desired(&self, registry: &TileRegistry, collider_only: bool) -> HashSet<(TileId, Channel)> {
        let mut wanted = HashSet::new();
        if !self.enabled {
            return wanted;
        }
        let Some(origin) = self.origin else {
            return wanted;
        };

        let set = self.mode.terrain_set();
        let near_channel = if collider_only {
            Channel::Collider
        } else {
            Channel::Regular
        };
        for tile in registry.iter().filter(|t| t.set == set) {
            let distance = tile.bounds.distance_to(origin);
            if distance <= self.ranges.regular {
                wanted.insert((tile.id, near_channel));
            } else if !collider_only && distance <= self.ranges.impostor {
                wanted.insert((tile.id, Channel::Impostor));
            }
        }
        wanted
    }

    /// Diff against the previous update and record the new held set.
    pub fn update(&mut self, registry: &TileRegistry, collider_only: bool) -> ProximityDiff {
        let wanted = self.desired(registry, collider_only);
        let mut diff = ProximityDiff {
            added: wanted.difference(&self.held).copied().collect(),
            removed: self.held.difference(&wanted).copied().collect(),
        };
        diff.added.sort();
        diff.removed.sort();
        self.held = wanted;
        diff
    }

    /// Update and push the diff into the reference tracker. Returns the number
    /// of reference changes emitted.
    pub fn apply(
        &mut self,
        registry: &mut TileRegistry,
        tracker: &mut ReferenceTracker,
        collider_only: bool,
    ) -> usize {
        let diff = self.update(registry, collider_only);
        for &(tile, channel) in &diff.added {
            // Ids were read from the registry this very update
            let _ = tracker.add_reference(registry, tile, channel, HolderId::Proximity);
        }
        for &(tile, channel) in &diff.removed {
            // The tile may have been removed from the world since it was held
            let _ = tracker.remove_reference(registry, tile, channel, HolderId::Proximity);
        }
        if !diff.is_empty() {
            debug!(
                "Proximity update: +{} -{} (holding {})",
                diff.added.len(),
                diff.removed.len(),
                self.held.len()
            );
        }
        diff.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::TileBounds;

    fn grid(n: i32, set: TerrainSet) -> TileRegistry {
        let mut reg = TileRegistry::new();
        for x in 0..n {
            for y in 0..n {
                let id = TileId::new(x, y);
                reg.register(id, TileBounds::from_grid(id, 100.0, 10.0), set).unwrap();
            }
        }
        reg
    }

    #[test]
    fn test_rings() {
        let reg = grid(5, TerrainSet::World);
        let mut loader = DistanceAutoLoader::new(ProximityRanges {
            regular: 10.0,
            impostor: 150.0,
        });
        loader.set_origin(Some([50.0, 5.0, 50.0]));
        let wanted = loader.desired(&reg, false);
        assert!(wanted.contains(&(TileId::new(0, 0), Channel::Regular)));
        assert!(!wanted.contains(&(TileId::new(0, 0), Channel::Impostor)));
        assert!(wanted.contains(&(TileId::new(1, 1), Channel::Impostor)));
        assert!(wanted.contains(&(TileId::new(2, 0), Channel::Impostor)));
        assert!(!wanted.iter().any(|&(t, _)| t == TileId::new(3, 0)));
    }

    #[test]
    fn test_recenter_diffs_in_one_step() {
        let mut reg = grid(4, TerrainSet::World);
        let mut refs = ReferenceTracker::new();
        let mut loader = DistanceAutoLoader::new(ProximityRanges {
            regular: 10.0,
            impostor: 10.0,
        });
        // On the shared edge of (0,0) and (1,0)
        loader.set_origin(Some([100.0, 5.0, 50.0]));
        loader.apply(&mut reg, &mut refs, false);
        refs.drain_changes();

        // Move to the edge shared by (1,0) and (2,0)
        loader.set_origin(Some([200.0, 5.0, 50.0]));
        let diff = loader.update(&reg, false);
        assert!(diff.added.contains(&(TileId::new(2, 0), Channel::Regular)));
        assert!(diff.removed.contains(&(TileId::new(0, 0), Channel::Regular)));
        assert!(!diff.removed.contains(&(TileId::new(1, 0), Channel::Regular)));
        assert!(!diff.added.contains(&(TileId::new(1, 0), Channel::Regular)));
    }

    #[test]
    fn test_view_mode_keeps_explicit_holders() {
        let mut reg = grid(2, TerrainSet::World);
        let local = TileId::new(10, 10);
        reg.register(local, TileBounds::new([0.0; 3], [200.0, 10.0, 200.0]), TerrainSet::Local)
            .unwrap();
        let mut refs = ReferenceTracker::new();
        let explicit = HolderId::External(42);
        refs.add_reference(&mut reg, TileId::new(0, 0), Channel::Regular, explicit)
            .unwrap();

        let mut loader = DistanceAutoLoader::new(ProximityRanges {
            regular: 50.0,
            impostor: 50.0,
        });
        loader.set_origin(Some([50.0, 5.0, 50.0]));
        loader.apply(&mut reg, &mut refs, false);
        assert!(refs.holds(&reg, TileId::new(0, 0), Channel::Regular, HolderId::Proximity));

        loader.set_mode(ViewMode::Local);
        loader.apply(&mut reg, &mut refs, false);
        assert!(!refs.holds(&reg, TileId::new(0, 0), Channel::Regular, HolderId::Proximity));
        assert!(refs.holds(&reg, TileId::new(0, 0), Channel::Regular, explicit));
        assert!(refs.holds(&reg, local, Channel::Regular, HolderId::Proximity));
    }

    #[test]
    fn test_collider_only_targets_collider_channel() {
        let reg = grid(3, TerrainSet::World);
        let mut loader = DistanceAutoLoader::new(ProximityRanges {
            regular: 10.0,
            impostor: 500.0,
        });
        loader.set_origin(Some([50.0, 5.0, 50.0]));
        let wanted = loader.desired(&reg, true);
        assert_eq!(wanted.len(), 1);
        assert!(wanted.contains(&(TileId::new(0, 0), Channel::Collider)));
    }

    #[test]
    fn test_disable_releases_everything() {
        let mut reg = grid(2, TerrainSet::World);
        let mut refs = ReferenceTracker::new();
        let mut loader = DistanceAutoLoader::new(ProximityRanges::default());
        loader.set_origin(Some([0.0, 0.0, 0.0]));
        assert_eq!(loader.apply(&mut reg, &mut refs, false), 4);
        loader.set_enabled(false);
        assert_eq!(loader.apply(&mut reg, &mut refs, false), 4);
        assert_eq!(loader.held_count(), 0);
    }
}
