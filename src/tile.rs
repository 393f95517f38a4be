//! Tile identity, bounds and per-channel load state.
//!
//! A tile is a spatial unit of terrain. Each tile carries three independent
//! load channels (full detail, impostor and collider-only) which are driven by
//! their own reference holders.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable tile identifier: the tile's integer grid coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId {
    pub x: i32,
    pub y: i32,
}

impl TileId {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// World-space axis aligned box. Double precision so open worlds far from the
/// origin keep sub-meter accuracy.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileBounds {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl TileBounds {
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self { min, max }
    }

    /// Bounds of the grid cell `id` for square tiles of `tile_size` meters,
    /// spanning `height` meters vertically from y = 0.
    pub fn from_grid(id: TileId, tile_size: f64, height: f64) -> Self {
        let min_x = id.x as f64 * tile_size;
        let min_z = id.y as f64 * tile_size;
        Self {
            min: [min_x, 0.0, min_z],
            max: [min_x + tile_size, height, min_z + tile_size],
        }
    }

    pub fn contains(&self, point: [f64; 3]) -> bool {
        (0..3).all(|i| point[i] >= self.min[i] && point[i] <= self.max[i])
    }

    /// Distance from `point` to the closest point of the box (0 inside).
    pub fn distance_to(&self, point: [f64; 3]) -> f64 {
        let mut sq = 0.0;
        for i in 0..3 {
            let d = if point[i] < self.min[i] {
                self.min[i] - point[i]
            } else if point[i] > self.max[i] {
                point[i] - self.max[i]
            } else {
                0.0
            };
            sq += d * d;
        }
        sq.sqrt()
    }

    pub fn intersects_sphere(&self, center: [f64; 3], radius: f64) -> bool {
        radius >= 0.0 && self.distance_to(center) <= radius
    }
}

/// Which terrain set a tile belongs to. Only tiles of the active set are
/// eligible for proximity loading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerrainSet {
    /// Tiles of the full open world
    World,
    /// Tiles of a local, zoomed-in terrain scene
    Local,
}

/// Load fidelity tracked independently per tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    /// Full renderable terrain content
    Regular,
    /// Low cost stand-in shown at distance
    Impostor,
    /// Collision geometry only
    Collider,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Regular, Channel::Impostor, Channel::Collider];

    pub fn index(self) -> usize {
        match self {
            Channel::Regular => 0,
            Channel::Impostor => 1,
            Channel::Collider => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Regular => "regular",
            Channel::Impostor => "impostor",
            Channel::Collider => "collider",
        }
    }
}

/// Residency state of one channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    /// No longer referenced but kept in memory until the budget evicts it
    Cached,
}

impl LoadState {
    pub fn is_resident(self) -> bool {
        matches!(self, LoadState::Loaded | LoadState::Cached)
    }
}

/// One reason a channel must stay loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HolderId {
    /// Reserved for the distance auto loader
    Proximity,
    /// Reserved for `load_all`
    LoadAll,
    /// Re-created from persisted last-known state
    Restored,
    /// Any caller supplied reason
    External(u64),
}

/// Per-channel bookkeeping.
#[derive(Clone, Debug, Default)]
pub struct ChannelState {
    pub load: LoadState,
    pub holders: HashSet<HolderId>,
    /// Desired value last reported to the state machine
    pub desired: bool,
    /// Waiting in the load queue (state is still `Unloaded`)
    pub queued: bool,
    pub last_touched_ms: u64,
    pub loading_since_ms: Option<u64>,
    pub estimated_bytes: u64,
    /// Bumped on every load state transition
    pub generation: u64,
}

impl ChannelState {
    /// Move to `next`, bumping the generation. Returns the previous state.
    pub(crate) fn transition(&mut self, next: LoadState) -> LoadState {
        let prev = self.load;
        debug_assert!(
            !(prev == LoadState::Unloaded && next.is_resident()),
            "channel must pass through Loading before becoming resident"
        );
        self.load = next;
        self.generation += 1;
        prev
    }
}

/// A registered spatial terrain tile.
#[derive(Clone, Debug)]
pub struct Tile {
    pub id: TileId,
    pub bounds: TileBounds,
    pub set: TerrainSet,
    pub channels: [ChannelState; 3],
    /// Channel states read from the persisted manifest
    pub last_known: [LoadState; 3],
}

impl Tile {
    pub fn new(id: TileId, bounds: TileBounds, set: TerrainSet) -> Self {
        Self {
            id,
            bounds,
            set,
            channels: Default::default(),
            last_known: [LoadState::Unloaded; 3],
        }
    }

    pub fn channel(&self, channel: Channel) -> &ChannelState {
        &self.channels[channel.index()]
    }

    pub fn channel_mut(&mut self, channel: Channel) -> &mut ChannelState {
        &mut self.channels[channel.index()]
    }

    pub fn load_states(&self) -> [LoadState; 3] {
        [
            self.channels[0].load,
            self.channels[1].load,
            self.channels[2].load,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_to_box() {
        let b = TileBounds::new([0.0, 0.0, 0.0], [10.0, 10.0, 10.0]);
        assert_eq!(b.distance_to([5.0, 5.0, 5.0]), 0.0);
        assert_eq!(b.distance_to([13.0, 5.0, 5.0]), 3.0);
        assert_eq!(b.distance_to([13.0, 14.0, 5.0]), 5.0);
        assert!(b.intersects_sphere([15.0, 5.0, 5.0], 5.0));
        assert!(!b.intersects_sphere([15.0, 5.0, 5.0], 4.9));
    }

    #[test]
    fn test_grid_bounds_far_from_origin() {
        let id = TileId::new(1_000_000, -3);
        let b = TileBounds::from_grid(id, 1024.0, 600.0);
        assert_eq!(b.min[0], 1_024_000_000.0);
        assert_eq!(b.max[2], -2048.0);
        assert!(b.contains([1_024_000_000.5, 10.0, -2048.5]));
    }

    #[test]
    fn test_channel_index_order() {
        for (i, c) in Channel::ALL.iter().enumerate() {
            assert_eq!(c.index(), i);
        }
    }
}
