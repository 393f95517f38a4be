//! Per tile, per channel reference holders.
//!
//! A channel is desired active iff its holder set is non-empty. Every mutation
//! recomputes that flag and queues a [`DesiredChange`] when it flips; the load
//! state machine drains the queue once per tick.

use tracing::trace;

use crate::error::Result;
use crate::registry::TileRegistry;
use crate::tile::{Channel, HolderId, TileId};

/// Desired state flip for one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DesiredChange {
    pub tile: TileId,
    pub channel: Channel,
    pub active: bool,
}

#[derive(Default)]
pub struct ReferenceTracker {
    changes: Vec<DesiredChange>,
}

impl ReferenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `holder` to the channel. Adding an existing holder has no effect.
    pub fn add_reference(
        &mut self,
        registry: &mut TileRegistry,
        tile: TileId,
        channel: Channel,
        holder: HolderId,
    ) -> Result<()> {
        let state = registry.tile_mut(tile)?.channel_mut(channel);
        if state.holders.insert(holder) {
            trace!("{} {} += {:?}", tile, channel.name(), holder);
        }
        self.recompute(registry, tile, channel)
    }

    /// Remove `holder` from the channel. Removing an absent holder is a no-op.
    pub fn remove_reference(
        &mut self,
        registry: &mut TileRegistry,
        tile: TileId,
        channel: Channel,
        holder: HolderId,
    ) -> Result<()> {
        let state = registry.tile_mut(tile)?.channel_mut(channel);
        if state.holders.remove(&holder) {
            trace!("{} {} -= {:?}", tile, channel.name(), holder);
        }
        self.recompute(registry, tile, channel)
    }

    pub fn remove_all_references(
        &mut self,
        registry: &mut TileRegistry,
        tile: TileId,
        channel: Channel,
    ) -> Result<()> {
        registry.tile_mut(tile)?.channel_mut(channel).holders.clear();
        self.recompute(registry, tile, channel)
    }

    /// Remove `holder` from every channel of every tile.
    pub fn remove_holder_everywhere(&mut self, registry: &mut TileRegistry, holder: HolderId) {
        for id in registry.ids() {
            for channel in Channel::ALL {
                // ids come from the registry itself
                let _ = self.remove_reference(registry, id, channel, holder);
            }
        }
    }

    pub fn is_desired(&self, registry: &TileRegistry, tile: TileId, channel: Channel) -> Result<bool> {
        Ok(!registry.tile(tile)?.channel(channel).holders.is_empty())
    }

    pub fn holder_count(&self, registry: &TileRegistry, tile: TileId, channel: Channel) -> Result<usize> {
        Ok(registry.tile(tile)?.channel(channel).holders.len())
    }

    pub fn holds(&self, registry: &TileRegistry, tile: TileId, channel: Channel, holder: HolderId) -> bool {
        registry
            .get(tile)
            .map(|t| t.channel(channel).holders.contains(&holder))
            .unwrap_or(false)
    }

    /// Pending desired flips, oldest first.
    pub fn drain_changes(&mut self) -> Vec<DesiredChange> {
        std::mem::take(&mut self.changes)
    }

    pub fn has_pending(&self) -> bool {
        !self.changes.is_empty()
    }

    fn recompute(&mut self, registry: &mut TileRegistry, tile: TileId, channel: Channel) -> Result<()> {
        let state = registry.tile_mut(tile)?.channel_mut(channel);
        let active = !state.holders.is_empty();
        if active != state.desired {
            state.desired = active;
            // A flip back before the state machine ran cancels the pending one
            if let Some(pos) = self
                .changes
                .iter()
                .position(|c| c.tile == tile && c.channel == channel)
            {
                self.changes.remove(pos);
            } else {
                self.changes.push(DesiredChange {
                    tile,
                    channel,
                    active,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{TerrainSet, TileBounds};

    fn setup() -> (TileRegistry, ReferenceTracker, TileId) {
        let mut reg = TileRegistry::new();
        let id = TileId::new(0, 0);
        reg.register(id, TileBounds::from_grid(id, 10.0, 10.0), TerrainSet::World)
            .unwrap();
        (reg, ReferenceTracker::new(), id)
    }

    #[test]
    fn test_add_is_idempotent() {
        let (mut reg, mut refs, id) = setup();
        let h = HolderId::External(7);
        refs.add_reference(&mut reg, id, Channel::Regular, h).unwrap();
        refs.add_reference(&mut reg, id, Channel::Regular, h).unwrap();
        assert_eq!(refs.holder_count(&reg, id, Channel::Regular).unwrap(), 1);
        assert_eq!(
            refs.drain_changes(),
            vec![DesiredChange {
                tile: id,
                channel: Channel::Regular,
                active: true
            }]
        );
    }

    #[test]
    fn test_add_then_remove_restores_membership() {
        let (mut reg, mut refs, id) = setup();
        let keep = HolderId::External(1);
        refs.add_reference(&mut reg, id, Channel::Impostor, keep).unwrap();
        refs.drain_changes();
        let before = reg.tile(id).unwrap().channel(Channel::Impostor).holders.clone();

        let h = HolderId::External(2);
        refs.add_reference(&mut reg, id, Channel::Impostor, h).unwrap();
        refs.remove_reference(&mut reg, id, Channel::Impostor, h).unwrap();

        assert_eq!(reg.tile(id).unwrap().channel(Channel::Impostor).holders, before);
        assert!(refs.drain_changes().is_empty());
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let (mut reg, mut refs, id) = setup();
        refs.remove_reference(&mut reg, id, Channel::Collider, HolderId::Proximity)
            .unwrap();
        assert!(!refs.has_pending());
        assert!(!refs.is_desired(&reg, id, Channel::Collider).unwrap());
    }

    #[test]
    fn test_flip_and_flip_back_cancels() {
        let (mut reg, mut refs, id) = setup();
        refs.add_reference(&mut reg, id, Channel::Regular, HolderId::LoadAll).unwrap();
        refs.remove_all_references(&mut reg, id, Channel::Regular).unwrap();
        assert!(refs.drain_changes().is_empty());
        assert!(!reg.tile(id).unwrap().channel(Channel::Regular).desired);
    }

    #[test]
    fn test_unknown_tile() {
        let (mut reg, mut refs, _) = setup();
        assert!(refs
            .add_reference(&mut reg, TileId::new(9, 9), Channel::Regular, HolderId::LoadAll)
            .is_err());
    }
}
