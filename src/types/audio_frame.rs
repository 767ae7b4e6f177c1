/// One compressed audio frame. Same ownership rules as
/// [`super::video_frame::EncodedVideoFrame`].
#[derive(Debug, Clone)]
pub struct EncodedAudioFrame {
    pub data: Vec<u8>,
    /// Presentation timestamp in ticks (100 ns), relative to pipeline start
    pub pts: i64,
    /// Frame duration in ticks: samples-per-frame / sample-rate
    pub duration: i64,
}
