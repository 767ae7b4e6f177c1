use std::os::fd::RawFd;

/// One compressed video frame as produced by the encoder output pump.
///
/// Whoever holds the frame owns the payload: the pump produces it, a
/// sample store takes ownership on insert, and snapshots deep-copy it.
#[derive(Debug, Clone)]
pub struct EncodedVideoFrame {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
    /// Presentation timestamp in ticks (100 ns), relative to pipeline start
    pub pts: i64,
    /// Display duration in ticks
    pub duration: i64,
}

/// A frame as handed out by a frame source: either mapped pixel bytes,
/// a DMA-BUF file descriptor, or both.
#[derive(Debug, Clone)]
pub struct RawVideoFrame {
    pub data: Vec<u8>,
    /// Capture timestamp in ticks, relative to pipeline start
    pub timestamp: i64,
    pub dmabuf_fd: Option<RawFd>,
    pub stride: i32,
    pub offset: u32,
    pub size: u32,
    pub width: u32,
    pub height: u32,
}

impl RawVideoFrame {
    /// True when the frame can be resubmitted later as a cached repeat.
    ///
    /// DMA-BUF frames cannot: the compositor may recycle the buffer behind
    /// the fd once it has been requeued.
    pub fn repeatable(&self) -> bool {
        self.dmabuf_fd.is_none() && !self.data.is_empty()
    }
}
