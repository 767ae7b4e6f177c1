use crate::types::config::Rect;
use crate::types::error::Result;
use crate::types::video_frame::RawVideoFrame;

pub mod audio;
pub mod mixer;
pub mod video;

/// Message used to shut down a PipeWire loop thread.
pub struct Terminate;

/// Hands out the most recent captured frame of a bounded screen region.
///
/// `acquire_latest` never blocks longer than one short polling interval;
/// the pacing clock, not the compositor, decides when it is called.
pub trait FrameSource: Send {
    /// The newest frame produced since the last call, a cached repeat of
    /// the previous frame when the compositor reported nothing new, or
    /// `None` when neither is available. Fatal capture errors (device
    /// lost, stream invalidated) surface as `Err`.
    fn acquire_latest(&mut self) -> Result<Option<RawVideoFrame>>;

    /// Change the capture crop. Dimensions are rounded down to even
    /// pixels; a rect outside the capture surface is rejected with
    /// [`crate::types::error::ReplayError::RegionOutOfBounds`].
    fn set_region(&mut self, rect: Rect) -> Result<()>;

    /// The active crop within the capture surface.
    fn region(&self) -> Rect;

    /// Full size of the capture surface in pixels.
    fn capture_size(&self) -> (u32, u32);

    /// Best-known display refresh rate; an FPS cap hint only.
    fn refresh_rate(&self) -> u32;

    /// Tear down the capture stream and join its thread.
    fn stop(&mut self);
}
