//! Terrain tile streaming library
//!
//! Reference-counted tile loading with distance based proximity references, a
//! memory-budgeted cache with keep-alive eviction, and a content-addressed
//! cache of baked masks. Re-exports modules for use by binaries and tools.

pub mod auto_loader;
pub mod budget;
pub mod config;
pub mod content;
pub mod error;
pub mod manager;
pub mod masks;
pub mod references;
pub mod registry;
pub mod sim;
pub mod state_machine;
pub mod tile;
pub mod tilemap;
pub mod timer;

pub use auto_loader::{DistanceAutoLoader, ProximityRanges, ViewMode};
pub use budget::{CacheBudget, CacheThreshold, ExecutionContext, MemoryBudgetedCache};
pub use config::StreamingConfig;
pub use content::{LoadProgress, TileContent};
pub use error::{Result, StreamingError};
pub use manager::TerrainLoader;
pub use masks::{InvalidationTag, MaskBakeCache, MaskHandle, MaskKey};
pub use state_machine::TickReport;
pub use tile::{Channel, HolderId, LoadState, TerrainSet, TileBounds, TileId};
