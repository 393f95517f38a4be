//! Hooks into whatever physically instantiates tile content.

use crate::error::Result;
use crate::tile::{Channel, TileId};

/// Progress of an in-flight load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadProgress {
    Pending,
    /// Finished; `resident_bytes` is the estimated memory held by the content
    Complete { resident_bytes: u64 },
    Failed(String),
}

/// Content provider driven by the load state machine.
///
/// Loads are asynchronous: `begin_load` only starts the work and `poll_load`
/// is asked once per tick until it reports completion. A load abandoned after
/// a stall timeout is released with `release` and never polled again, so the
/// provider must tolerate its work being orphaned.
pub trait TileContent {
    fn begin_load(&mut self, tile: TileId, channel: Channel) -> Result<()>;

    fn poll_load(&mut self, tile: TileId, channel: Channel) -> LoadProgress;

    /// Release everything held for the channel, including partially acquired
    /// resources of an unfinished load. Must return synchronously.
    fn release(&mut self, tile: TileId, channel: Channel);
}
