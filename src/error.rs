//! Error types shared by the streaming core.
//!
//! Every variant is locally recoverable: at worst a single tile's content or a
//! single mask is unavailable for a while.

use std::fmt;

use crate::masks::MaskStorageError;
use crate::tile::{Channel, TileId};

/// A convenient result type wrapping [`StreamingError`].
pub type Result<T> = std::result::Result<T, StreamingError>;

#[derive(Debug)]
pub enum StreamingError {
    /// The tile id is not present in the registry.
    UnknownTile(TileId),
    /// A tile with this id was already registered.
    DuplicateTile(TileId),
    /// A load stayed in `Loading` longer than the progress timeout.
    StallTimeout {
        tile: TileId,
        channel: Channel,
        elapsed_ms: u64,
    },
    /// The content provider reported that a load could not complete.
    LoadFailed {
        tile: TileId,
        channel: Channel,
        reason: String,
    },
    /// A bake could not find its source data.
    MissingDependency(String),
    /// Cached bytes remain above the threshold after every eligible eviction.
    BudgetUnsatisfiable { total_bytes: u64, threshold_bytes: u64 },
    /// Collider-only mode cannot be toggled while anything is resident or referenced.
    ModeConflict { resident_channels: usize },
    Io(std::io::Error),
    Json(serde_json::Error),
    Storage(MaskStorageError),
}

impl fmt::Display for StreamingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamingError::UnknownTile(id) => write!(f, "Unknown tile {}", id),
            StreamingError::DuplicateTile(id) => write!(f, "Tile {} is already registered", id),
            StreamingError::StallTimeout {
                tile,
                channel,
                elapsed_ms,
            } => write!(
                f,
                "Loading {} ({}) stalled for {} ms and was abandoned",
                tile,
                channel.name(),
                elapsed_ms
            ),
            StreamingError::LoadFailed {
                tile,
                channel,
                reason,
            } => write!(f, "Loading {} ({}) failed: {}", tile, channel.name(), reason),
            StreamingError::MissingDependency(what) => write!(f, "Missing bake dependency: {}", what),
            StreamingError::BudgetUnsatisfiable {
                total_bytes,
                threshold_bytes,
            } => write!(
                f,
                "Cache holds {:.1}MB, above the {:.1}MB threshold, with nothing evictable",
                *total_bytes as f64 / (1024.0 * 1024.0),
                *threshold_bytes as f64 / (1024.0 * 1024.0)
            ),
            StreamingError::ModeConflict { resident_channels } => write!(
                f,
                "Cannot toggle collider-only loading while {} channel(s) are loaded or referenced; unload all first",
                resident_channels
            ),
            StreamingError::Io(e) => write!(f, "IO error: {}", e),
            StreamingError::Json(e) => write!(f, "JSON error: {}", e),
            StreamingError::Storage(e) => write!(f, "Mask storage error: {}", e),
        }
    }
}

impl std::error::Error for StreamingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamingError::Io(e) => Some(e),
            StreamingError::Json(e) => Some(e),
            StreamingError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StreamingError {
    fn from(e: std::io::Error) -> Self {
        StreamingError::Io(e)
    }
}

impl From<serde_json::Error> for StreamingError {
    fn from(e: serde_json::Error) -> Self {
        StreamingError::Json(e)
    }
}

impl From<MaskStorageError> for StreamingError {
    fn from(e: MaskStorageError) -> Self {
        StreamingError::Storage(e)
    }
}
