//! Derived mask baking and caching.
//!
//! Masks (collision masks around trees and tagged objects, orthographic layer
//! bakes, cropped world biome masks) are expensive to produce, so results are
//! cached under a canonical string key that doubles as the on-disk filename.
//! Invalidation tags purge every entry sharing a dependency.

pub mod bake;
pub mod cache;
pub mod invalidation;
pub mod key;
pub mod storage;

pub use bake::{BakeInputs, BakeRegistry, MaskBaker};
pub use cache::{MaskBakeCache, MaskCacheStats, MaskHandle};
pub use invalidation::InvalidationIndex;
pub use key::{BakeKind, InvalidationTag, MaskKey, MaskParam};
pub use storage::{MaskStorage, MaskStorageError};

use crate::tilemap::Tilemap;

/// Baked mask payload: one 8-bit value per texel.
pub type MaskTexture = Tilemap<u8>;
