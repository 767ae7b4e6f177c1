use std::ptr::{null, null_mut};

use ffmpeg_next::{
    self as ffmpeg,
    ffi::{
        av_buffer_ref, av_buffer_unref, av_hwdevice_ctx_create, av_hwframe_ctx_alloc,
        AVBufferRef, AVHWDeviceType,
    },
    Rational,
};

use crate::types::config::QualityPreset;
use crate::types::error::{ReplayError, Result};
use crate::types::video_frame::EncodedVideoFrame;
use crate::utils::TICKS_PER_SECOND;

/// Keyframe cadence. Kept short so evicting from the front of the replay
/// window never strands more than a fraction of a second of undecodable
/// frames.
pub const GOP_SIZE: u32 = 30;

/// The timebase every encoder and the muxer agree on: one tick = 100 ns.
pub fn tick_timebase() -> Rational {
    Rational::new(1, TICKS_PER_SECOND as i32)
}

/// Coarse quality preset to target bitrate:
/// `clamp(width * height * fps * bpp, 1 Mbps, 50 Mbps)`.
pub fn target_bitrate(width: u32, height: u32, fps: u32, quality: QualityPreset) -> u64 {
    let bpp = match quality {
        QualityPreset::Low => 0.1,
        QualityPreset::Medium => 0.2,
        QualityPreset::High => 0.4,
        QualityPreset::Lossless => 1.0,
    };
    let raw = width as f64 * height as f64 * fps as f64 * bpp;
    raw.clamp(1_000_000.0, 50_000_000.0) as u64
}

/// A consumer of finished frames. Invoked on the encoder's pump thread,
/// potentially in parallel with `submit` calls from the capture thread;
/// the sink takes ownership of each frame.
pub trait VideoFrameSink: Send {
    fn accept(&mut self, frame: EncodedVideoFrame);
}

/// Asynchronous hardware video encoder.
///
/// Input textures go in at the pacing rate via [`VideoEncoder::submit`];
/// finished frames come out on an internal pump thread through the
/// registered sink. Submission never blocks longer than a GPU fence wait.
pub trait VideoEncoder: Send {
    /// Codec parameter bytes the muxer embeds in the container, once
    /// initialization has produced them.
    fn sequence_header(&self) -> Option<Vec<u8>>;

    /// Install the sink finished frames are handed to. Exactly one sink
    /// is active at a time; must be called before any submit.
    fn set_sink(&mut self, sink: Box<dyn VideoFrameSink>) -> Result<()>;

    /// Enqueue one input texture with its presentation timestamp in
    /// ticks. Returns [`ReplayError::Backpressure`] when the input queue
    /// is full; the caller decides whether to drop the frame.
    fn submit(&mut self, texture: ffmpeg::frame::Video, pts: i64) -> Result<()>;

    /// Emit everything still buffered through the sink before returning.
    fn flush(&mut self) -> Result<()>;

    /// Stop the pump, drain, and release encoder resources.
    fn destroy(&mut self) -> Result<()>;
}

/// Shared, refcounted handle to a hardware device context. The encoder
/// creates the device; the color converter holds a read-only reference.
pub struct HwDevice {
    ptr: *mut AVBufferRef,
}

// AVBufferRef refcounting is thread-safe; the underlying VAAPI device is
// only mutated through the encoder.
unsafe impl Send for HwDevice {}
unsafe impl Sync for HwDevice {}

impl HwDevice {
    /// Wrap an owned reference (takes over one refcount).
    pub(crate) fn from_owned(ptr: *mut AVBufferRef) -> Self {
        Self { ptr }
    }

    pub(crate) fn as_ptr(&self) -> *mut AVBufferRef {
        self.ptr
    }
}

impl Clone for HwDevice {
    fn clone(&self) -> Self {
        Self {
            ptr: unsafe { av_buffer_ref(self.ptr) },
        }
    }
}

impl Drop for HwDevice {
    fn drop(&mut self) {
        unsafe {
            av_buffer_unref(&mut self.ptr);
        }
    }
}

pub(crate) fn create_hw_device(kind: AVHWDeviceType) -> Result<*mut AVBufferRef> {
    unsafe {
        let mut device: *mut AVBufferRef = null_mut();
        let err = av_hwdevice_ctx_create(&mut device, kind, null(), null_mut(), 0);
        if err < 0 {
            return Err(ReplayError::DeviceInit(format!(
                "could not create hardware device context: {err}"
            )));
        }
        Ok(device)
    }
}

pub(crate) fn create_hw_frame_ctx(device: *mut AVBufferRef) -> Result<*mut AVBufferRef> {
    unsafe {
        let frame_ctx = av_hwframe_ctx_alloc(device);
        if frame_ctx.is_null() {
            return Err(ReplayError::EncoderInit(
                "could not allocate hardware frame context".into(),
            ));
        }
        Ok(frame_ctx)
    }
}
