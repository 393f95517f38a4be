//! Bake functions and the world state they may read.

use std::collections::HashMap;

use super::key::{BakeKind, MaskKey};
use super::MaskTexture;
use crate::error::{Result, StreamingError};
use crate::registry::TileRegistry;
use crate::tile::{Tile, TileId};

/// Read-only view of the world handed to bake functions.
pub struct BakeInputs<'a> {
    pub registry: &'a TileRegistry,
    /// Tile holding the world biome map, if the world has one
    pub world_map: Option<TileId>,
}

impl<'a> BakeInputs<'a> {
    pub fn new(registry: &'a TileRegistry, world_map: Option<TileId>) -> Self {
        Self { registry, world_map }
    }

    /// The tile, provided at least one of its channels is resident.
    pub fn require_resident(&self, id: TileId) -> Result<&'a Tile> {
        let tile = self
            .registry
            .get(id)
            .ok_or_else(|| StreamingError::MissingDependency(format!("tile {} does not exist", id)))?;
        if !tile.channels.iter().any(|c| c.load.is_resident()) {
            return Err(StreamingError::MissingDependency(format!("tile {} is not loaded", id)));
        }
        Ok(tile)
    }

    pub fn require_world_map(&self) -> Result<&'a Tile> {
        let id = self
            .world_map
            .ok_or_else(|| StreamingError::MissingDependency("no world map tile".to_string()))?;
        self.require_resident(id)
    }
}

/// A deterministic function from key and world state to a mask.
pub trait MaskBaker {
    fn bake(&self, key: &MaskKey, inputs: &BakeInputs<'_>) -> Result<MaskTexture>;
}

impl<F> MaskBaker for F
where
    F: Fn(&MaskKey, &BakeInputs<'_>) -> Result<MaskTexture>,
{
    fn bake(&self, key: &MaskKey, inputs: &BakeInputs<'_>) -> Result<MaskTexture> {
        self(key, inputs)
    }
}

/// Bake functions by kind.
#[derive(Default)]
pub struct BakeRegistry {
    bakers: HashMap<BakeKind, Box<dyn MaskBaker>>,
}

impl BakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<B: MaskBaker + 'static>(&mut self, kind: BakeKind, baker: B) {
        self.bakers.insert(kind, Box::new(baker));
    }

    /// Register a closure as the baker for `kind`.
    pub fn register_fn<F>(&mut self, kind: BakeKind, baker: F)
    where
        F: Fn(&MaskKey, &BakeInputs<'_>) -> Result<MaskTexture> + 'static,
    {
        self.register(kind, baker);
    }

    pub fn get(&self, kind: BakeKind) -> Option<&dyn MaskBaker> {
        self.bakers.get(&kind).map(|b| b.as_ref())
    }

    pub fn bake(&self, key: &MaskKey, inputs: &BakeInputs<'_>) -> Result<MaskTexture> {
        let baker = self
            .get(key.kind)
            .ok_or_else(|| StreamingError::MissingDependency(format!("no baker for {}", key.kind.token())))?;
        baker.bake(key, inputs)
    }
}
