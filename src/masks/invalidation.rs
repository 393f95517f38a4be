//! Reverse index from dependencies to cached mask keys.

use std::collections::{BTreeSet, HashMap};

use super::key::{BakeKind, InvalidationTag, MaskKey};
use crate::tile::TileId;

/// Canonical keys indexed by tile and by bake kind. Structured tags resolve
/// through the index; fragment and layer tags scan every known key.
#[derive(Default)]
pub struct InvalidationIndex {
    keys: HashMap<String, MaskKey>,
    by_tile: HashMap<TileId, BTreeSet<String>>,
    by_kind: HashMap<BakeKind, BTreeSet<String>>,
}

impl InvalidationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &MaskKey) {
        let canonical = key.canonical();
        self.by_tile.entry(key.tile).or_default().insert(canonical.clone());
        self.by_kind.entry(key.kind).or_default().insert(canonical.clone());
        self.keys.insert(canonical, key.clone());
    }

    pub fn remove(&mut self, canonical: &str) -> Option<MaskKey> {
        let key = self.keys.remove(canonical)?;
        if let Some(set) = self.by_tile.get_mut(&key.tile) {
            set.remove(canonical);
            if set.is_empty() {
                self.by_tile.remove(&key.tile);
            }
        }
        if let Some(set) = self.by_kind.get_mut(&key.kind) {
            set.remove(canonical);
            if set.is_empty() {
                self.by_kind.remove(&key.kind);
            }
        }
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.by_tile.clear();
        self.by_kind.clear();
    }

    /// Canonical keys matching `tag`, sorted.
    pub fn matching(&self, tag: &InvalidationTag) -> Vec<String> {
        match tag {
            InvalidationTag::Tile(tile) => self
                .by_tile
                .get(tile)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default(),
            InvalidationTag::Kind(kind) => self
                .by_kind
                .get(kind)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default(),
            _ => {
                let mut found: Vec<String> = self
                    .keys
                    .iter()
                    .filter(|(_, key)| tag.matches(key))
                    .map(|(canonical, _)| canonical.clone())
                    .collect();
                found.sort();
                found
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_lookup_and_removal() {
        let mut index = InvalidationIndex::new();
        let a = MaskKey::layers(TileId::new(0, 0), 1, 8);
        let b = MaskKey::biome(TileId::new(0, 0), "tundra", 8);
        let c = MaskKey::layers(TileId::new(1, 0), 2, 8);
        for key in [&a, &b, &c] {
            index.insert(key);
        }

        assert_eq!(index.matching(&InvalidationTag::Tile(TileId::new(0, 0))).len(), 2);
        assert_eq!(
            index.matching(&InvalidationTag::Kind(BakeKind::LayerCollision)),
            vec![a.canonical(), c.canonical()]
        );
        assert_eq!(index.matching(&InvalidationTag::LayerBit(1)), vec![c.canonical()]);

        index.remove(&a.canonical());
        assert_eq!(index.matching(&InvalidationTag::Tile(TileId::new(0, 0))), vec![b.canonical()]);
        assert_eq!(index.len(), 2);
    }
}
