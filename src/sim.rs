//! Synthetic collaborators for the command line tools and tests.
//!
//! Nothing here is needed to embed the loader: a real engine supplies its own
//! [`TileContent`] and bake functions. These stand-ins let the streaming core
//! run headless with deterministic, seeded behavior.

use std::collections::{HashMap, HashSet};

use noise::{NoiseFn, Perlin, Seedable};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::content::{LoadProgress, TileContent};
use crate::error::{Result, StreamingError};
use crate::manager::TerrainLoader;
use crate::masks::{BakeInputs, BakeKind, BakeRegistry, MaskKey};
use crate::tile::{Channel, TerrainSet, TileBounds, TileId};
use crate::tilemap::Tilemap;

const DEFAULT_MASK_RESOLUTION: usize = 64;
/// World biome map resolution, in cells per tile edge
const BIOME_CELLS_PER_TILE: usize = 8;

/// Content provider whose loads finish after a fixed number of polls.
pub struct SyntheticContent {
    /// Polls before a load completes
    pub latency_polls: u32,
    /// Resident size reported per channel (regular, impostor, collider)
    pub channel_bytes: [u64; 3],
    /// Tiles whose loads never complete
    pub stalled: HashSet<TileId>,
    /// Tiles whose loads fail on completion
    pub broken: HashSet<TileId>,
    pending: HashMap<(TileId, Channel), u32>,
    resident: HashMap<(TileId, Channel), u64>,
    pub loads_started: usize,
    pub releases: usize,
}

impl SyntheticContent {
    pub fn new(latency_polls: u32, channel_bytes: [u64; 3]) -> Self {
        Self {
            latency_polls,
            channel_bytes,
            stalled: HashSet::new(),
            broken: HashSet::new(),
            pending: HashMap::new(),
            resident: HashMap::new(),
            loads_started: 0,
            releases: 0,
        }
    }

    pub fn is_resident(&self, tile: TileId, channel: Channel) -> bool {
        self.resident.contains_key(&(tile, channel))
    }

    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident.values().sum()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for SyntheticContent {
    fn default() -> Self {
        const MIB: u64 = 1024 * 1024;
        Self::new(2, [48 * MIB, 6 * MIB, 12 * MIB])
    }
}

impl TileContent for SyntheticContent {
    fn begin_load(&mut self, tile: TileId, channel: Channel) -> Result<()> {
        self.pending.insert((tile, channel), 0);
        self.loads_started += 1;
        Ok(())
    }

    fn poll_load(&mut self, tile: TileId, channel: Channel) -> LoadProgress {
        let Some(polls) = self.pending.get_mut(&(tile, channel)) else {
            return LoadProgress::Failed("load was never started".to_string());
        };
        if self.stalled.contains(&tile) {
            return LoadProgress::Pending;
        }
        *polls += 1;
        if *polls < self.latency_polls {
            return LoadProgress::Pending;
        }
        self.pending.remove(&(tile, channel));
        if self.broken.contains(&tile) {
            return LoadProgress::Failed(format!("content for {} is corrupt", tile));
        }
        let bytes = self.channel_bytes[channel.index()];
        self.resident.insert((tile, channel), bytes);
        LoadProgress::Complete { resident_bytes: bytes }
    }

    fn release(&mut self, tile: TileId, channel: Channel) {
        self.pending.remove(&(tile, channel));
        self.resident.remove(&(tile, channel));
        self.releases += 1;
    }
}

/// Register a `(2 * radius) x (2 * radius)` grid of tiles centered on the
/// origin, sized by the loader's config. Returns the number of tiles added.
pub fn populate_grid(loader: &mut TerrainLoader, radius: i32, set: TerrainSet) -> Result<usize> {
    let tile_size = loader.config().tile_size;
    let tile_height = loader.config().tile_height;
    let mut count = 0;
    for y in -radius..radius {
        for x in -radius..radius {
            let id = TileId::new(x, y);
            loader.register_tile(id, TileBounds::from_grid(id, tile_size, tile_height), set)?;
            count += 1;
        }
    }
    Ok(count)
}

/// Seeded camera path through random waypoints at constant speed.
pub struct FlightPath {
    waypoints: Vec<[f64; 3]>,
    /// World units per millisecond
    speed: f64,
}

impl FlightPath {
    /// `extent` bounds the waypoints to `[-extent, extent]` on both ground axes.
    pub fn generate(seed: u64, waypoints: usize, extent: f64, altitude: f64, speed: f64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut points = vec![[0.0, altitude, 0.0]];
        for _ in 1..waypoints.max(2) {
            points.push([
                rng.gen_range(-extent..=extent),
                altitude,
                rng.gen_range(-extent..=extent),
            ]);
        }
        Self {
            waypoints: points,
            speed: speed.max(f64::EPSILON),
        }
    }

    pub fn waypoints(&self) -> &[[f64; 3]] {
        &self.waypoints
    }

    /// Total length of the path in world units.
    pub fn length(&self) -> f64 {
        self.waypoints.windows(2).map(|w| distance(w[0], w[1])).sum()
    }

    /// Time to fly the whole path.
    pub fn duration_ms(&self) -> u64 {
        (self.length() / self.speed).ceil() as u64
    }

    /// Position after `t_ms`; clamps to the last waypoint.
    pub fn position(&self, t_ms: u64) -> [f64; 3] {
        let mut remaining = t_ms as f64 * self.speed;
        for w in self.waypoints.windows(2) {
            let leg = distance(w[0], w[1]);
            if remaining <= leg && leg > 0.0 {
                let t = remaining / leg;
                return [
                    w[0][0] + (w[1][0] - w[0][0]) * t,
                    w[0][1] + (w[1][1] - w[0][1]) * t,
                    w[0][2] + (w[1][2] - w[0][2]) * t,
                ];
            }
            remaining -= leg;
        }
        self.waypoints[self.waypoints.len() - 1]
    }
}

fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

/// Stable 32-bit hash for seeding from key text.
fn text_seed(text: &str) -> u32 {
    text.bytes()
        .fold(2166136261u32, |h, b| (h ^ b as u32).wrapping_mul(16777619))
}

/// Fill a `res x res` field of 0..1 weights row by row in parallel.
fn bake_field<F>(res: usize, texel: F) -> Result<Tilemap<f32>>
where
    F: Fn(usize, usize) -> f32 + Sync,
{
    let mut data = vec![0.0f32; res * res];
    data.par_chunks_mut(res).enumerate().for_each(|(y, row)| {
        for (x, value) in row.iter_mut().enumerate() {
            *value = texel(x, y);
        }
    });
    Tilemap::from_vec(res, res, data)
        .ok_or_else(|| StreamingError::MissingDependency(format!("invalid mask resolution {}", res)))
}

/// Coarse biome weights for the 3x3 tiles around `tile`.
fn world_biome_region(noise: &Perlin, tile: TileId) -> Tilemap<f32> {
    let size = BIOME_CELLS_PER_TILE * 3;
    let mut region = Tilemap::new(size, size);
    for y in 0..size {
        for x in 0..size {
            let wx = (tile.x - 1) as f64 + x as f64 / BIOME_CELLS_PER_TILE as f64;
            let wy = (tile.y - 1) as f64 + y as f64 / BIOME_CELLS_PER_TILE as f64;
            let v = (noise.get([wx * 0.5, wy * 0.5]) * 0.5 + 0.5).clamp(0.0, 1.0);
            region.set(x, y, v as f32);
        }
    }
    region
}

/// Demo bakers for every mask kind, driven by seeded Perlin noise.
///
/// - radius: discs of the key's radius around scattered points
/// - layer: noise thresholded once per layer bit
/// - biome: coarse biome weights cropped to the tile and upsampled; needs
///   the world map tile
pub fn demo_bakers(seed: u64) -> BakeRegistry {
    let mut bakers = BakeRegistry::new();

    bakers.register_fn(BakeKind::RadiusCollision, move |key: &MaskKey, inputs: &BakeInputs<'_>| {
        inputs.require_resident(key.tile)?;
        let res = key.resolution().unwrap_or(DEFAULT_MASK_RESOLUTION);
        let radius = key.float().unwrap_or(1.0).max(0.0);
        let rule = key.text().map(text_seed).unwrap_or(0);
        let tile_seed = seed
            ^ ((key.tile.x as u64) << 32)
            ^ (key.tile.y as u32 as u64)
            ^ ((rule as u64) << 16);
        let mut rng = ChaCha8Rng::seed_from_u64(tile_seed);
        let count = rng.gen_range(4..16);
        let points: Vec<(f64, f64)> = (0..count)
            .map(|_| (rng.gen_range(0.0..res as f64), rng.gen_range(0.0..res as f64)))
            .collect();
        let field = bake_field(res, |x, y| {
            let hit = points.iter().any(|&(px, py)| {
                let dx = x as f64 + 0.5 - px;
                let dy = y as f64 + 0.5 - py;
                (dx * dx + dy * dy).sqrt() <= radius
            });
            if hit {
                1.0
            } else {
                0.0
            }
        })?;
        Ok(field.to_mask())
    });

    bakers.register_fn(BakeKind::LayerCollision, move |key: &MaskKey, inputs: &BakeInputs<'_>| {
        inputs.require_resident(key.tile)?;
        let res = key.resolution().unwrap_or(DEFAULT_MASK_RESOLUTION);
        let bits = key.layer_bits().unwrap_or(0);
        let layers: Vec<Perlin> = (0..32u32)
            .filter(|bit| bits & (1 << bit) != 0)
            .map(|bit| Perlin::new(1).set_seed((seed as u32).wrapping_add(bit * 101)))
            .collect();
        let field = bake_field(res, |x, y| {
            let nx = key.tile.x as f64 + x as f64 / res as f64;
            let ny = key.tile.y as f64 + y as f64 / res as f64;
            let solid = layers.iter().any(|n| n.get([nx * 4.0, ny * 4.0]) > 0.35);
            if solid {
                1.0
            } else {
                0.0
            }
        })?;
        Ok(field.to_mask())
    });

    bakers.register_fn(BakeKind::WorldBiome, move |key: &MaskKey, inputs: &BakeInputs<'_>| {
        inputs.require_world_map()?;
        let res = key.resolution().unwrap_or(DEFAULT_MASK_RESOLUTION);
        let biome = key.text().map(text_seed).unwrap_or(0);
        let noise = Perlin::new(1).set_seed((seed as u32).wrapping_add(biome));
        // One extra row and column so the last texels interpolate inside the tile
        let cells = BIOME_CELLS_PER_TILE;
        let local = world_biome_region(&noise, key.tile).crop(cells, cells, cells + 1, cells + 1);
        let scale = cells as f32 / res as f32;
        let field = bake_field(res, |x, y| {
            local.sample_bilinear((x as f32 + 0.5) * scale, (y as f32 + 0.5) * scale)
        })?;
        Ok(field.to_mask())
    });

    bakers
}
