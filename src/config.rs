//! Streaming configuration.
//!
//! Loaded from a JSON file or built from one of the presets; the command line
//! tools apply their flags on top.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auto_loader::{ProximityRanges, ViewMode};
use crate::budget::{CacheBudget, CacheThreshold, ExecutionContext};
use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub ranges: ProximityRanges,
    pub budget: CacheBudget,
    /// Wall-clock time per tick spent starting queued loads
    pub loading_time_threshold_ms: u64,
    /// A load with no progress for this long is abandoned
    pub progress_timeout_ms: u64,
    pub context: ExecutionContext,
    pub view_mode: ViewMode,
    /// Edge length of one grid tile in world units
    pub tile_size: f64,
    /// Vertical extent of tile bounds
    pub tile_height: f64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            ranges: ProximityRanges::default(),
            budget: CacheBudget::default(),
            loading_time_threshold_ms: 10,
            progress_timeout_ms: 10_000,
            context: ExecutionContext::runtime(),
            view_mode: ViewMode::World,
            tile_size: 1024.0,
            tile_height: 512.0,
        }
    }
}

impl StreamingConfig {
    /// Large world at play time: wide impostor ring, generous cache.
    pub fn open_world() -> Self {
        Self {
            ranges: ProximityRanges {
                regular: 2048.0,
                impostor: 8192.0,
            },
            budget: CacheBudget {
                threshold: CacheThreshold::High,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Editing session: short ranges, no caching outside play mode.
    pub fn editor_preview() -> Self {
        Self {
            ranges: ProximityRanges {
                regular: 512.0,
                impostor: 2048.0,
            },
            budget: CacheBudget {
                threshold: CacheThreshold::Low,
                keep_alive_ms: 5_000,
                cache_in_runtime: true,
                cache_in_editor: false,
            },
            loading_time_threshold_ms: 4,
            context: ExecutionContext::editor(),
            ..Default::default()
        }
    }

    pub fn from_preset(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "default" => Some(Self::default()),
            "open_world" | "open-world" => Some(Self::open_world()),
            "editor" | "editor_preview" | "editor-preview" => Some(Self::editor_preview()),
            _ => None,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&text)?;
        info!("Loaded streaming config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
