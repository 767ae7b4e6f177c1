use crate::types::audio_frame::EncodedAudioFrame;
use crate::types::error::Result;

/// Consumer of finished audio frames; invoked on whichever thread feeds
/// the encoder. Takes ownership of each frame.
pub trait AudioFrameSink: Send {
    fn accept(&mut self, frame: EncodedAudioFrame);
}

/// Compresses canonical PCM into fixed-size encoded frames with
/// predictable timestamps.
pub trait AudioEncoder: Send {
    /// Install the sink finished frames are handed to. Must be called
    /// before any feed.
    fn set_sink(&mut self, sink: Box<dyn AudioFrameSink>);

    /// Append canonical PCM bytes and emit one encoded frame per complete
    /// block. `origin_ts` is the tick timestamp the oldest byte in this
    /// batch was captured at; the first non-zero value anchors the audio
    /// timeline.
    fn feed(&mut self, pcm: &[u8], origin_ts: i64) -> Result<()>;

    /// Pad the trailing partial block with silence, emit it, and drain
    /// the codec.
    fn flush(&mut self) -> Result<()>;

    /// Codec configuration bytes the muxer embeds in the container.
    fn codec_config_header(&self) -> Option<Vec<u8>>;
}
