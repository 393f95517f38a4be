//! Authoritative set of known tiles.
//!
//! Tiles live in an arena indexed by slot; a map from [`TileId`] to slot gives
//! stable-id lookup. The registry can be persisted as a JSON manifest next to
//! the world data: `{dir}/tiles.json`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, StreamingError};
use crate::tile::{LoadState, TerrainSet, Tile, TileBounds, TileId};

/// Manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// Persisted form of a single tile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileRecord {
    pub id: TileId,
    pub bounds: TileBounds,
    pub set: TerrainSet,
    /// Regular, impostor, collider
    pub last_known: [LoadState; 3],
}

/// Persisted list of tiles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TileManifest {
    pub version: u32,
    /// RFC 3339 timestamp of the save
    pub saved_at: String,
    pub tiles: Vec<TileRecord>,
}

#[derive(Default)]
pub struct TileRegistry {
    slots: Vec<Option<Tile>>,
    free: Vec<usize>,
    index: HashMap<TileId, usize>,
}

impl TileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: TileId, bounds: TileBounds, set: TerrainSet) -> Result<()> {
        if self.index.contains_key(&id) {
            return Err(StreamingError::DuplicateTile(id));
        }
        let tile = Tile::new(id, bounds, set);
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(tile);
                slot
            }
            None => {
                self.slots.push(Some(tile));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);
        Ok(())
    }

    /// Remove a tile from the world. The caller is responsible for releasing
    /// any resident content first.
    pub fn remove(&mut self, id: TileId) -> Option<Tile> {
        let slot = self.index.remove(&id)?;
        let tile = self.slots[slot].take();
        self.free.push(slot);
        tile
    }

    pub fn get(&self, id: TileId) -> Option<&Tile> {
        self.index.get(&id).and_then(|&slot| self.slots[slot].as_ref())
    }

    pub fn get_mut(&mut self, id: TileId) -> Option<&mut Tile> {
        match self.index.get(&id) {
            Some(&slot) => self.slots[slot].as_mut(),
            None => None,
        }
    }

    pub fn tile(&self, id: TileId) -> Result<&Tile> {
        self.get(id).ok_or(StreamingError::UnknownTile(id))
    }

    pub fn tile_mut(&mut self, id: TileId) -> Result<&mut Tile> {
        self.get_mut(id).ok_or(StreamingError::UnknownTile(id))
    }

    pub fn contains(&self, id: TileId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tile> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// Ids in ascending order, for deterministic iteration.
    pub fn ids(&self) -> Vec<TileId> {
        let mut ids: Vec<TileId> = self.index.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn records(&self) -> Vec<TileRecord> {
        let mut records: Vec<TileRecord> = self
            .iter()
            .map(|t| TileRecord {
                id: t.id,
                bounds: t.bounds,
                set: t.set,
                last_known: t.load_states(),
            })
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Build a registry from persisted records. Live state starts unloaded;
    /// the persisted states are kept in [`Tile::last_known`].
    pub fn from_records(records: &[TileRecord]) -> Result<Self> {
        let mut registry = Self::new();
        for record in records {
            registry.register(record.id, record.bounds, record.set)?;
            if let Some(tile) = registry.get_mut(record.id) {
                tile.last_known = record.last_known;
            }
        }
        Ok(registry)
    }

    /// Write `tiles.json` into `dir`.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        fs::create_dir_all(dir.as_ref())?;
        let manifest = TileManifest {
            version: MANIFEST_VERSION,
            saved_at: Local::now().to_rfc3339(),
            tiles: self.records(),
        };
        let path = dir.as_ref().join("tiles.json");
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, &manifest)?;
        info!("Saved {} tile records to {}", manifest.tiles.len(), path.display());
        Ok(())
    }

    /// Read `tiles.json` from `dir`. Returns `Ok(None)` if there is no manifest.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Option<Self>> {
        let path = dir.as_ref().join("tiles.json");
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&path)?);
        let manifest: TileManifest = serde_json::from_reader(reader)?;
        info!(
            "Loaded {} tile records saved at {}",
            manifest.tiles.len(),
            manifest.saved_at
        );
        Self::from_records(&manifest.tiles).map(Some)
    }
}
