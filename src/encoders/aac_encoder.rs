use std::collections::VecDeque;

use ffmpeg_next::{self as ffmpeg, ffi::AV_CODEC_FLAG_GLOBAL_HEADER, Rational};

use crate::types::audio_frame::EncodedAudioFrame;
use crate::types::error::{ReplayError, Result};
use crate::utils::{CANONICAL_FRAME_BYTES, CANONICAL_SAMPLE_RATE, TICKS_PER_SECOND};

use super::audio::{AudioEncoder, AudioFrameSink};

/// Canonical sample frames per encoded frame; fixed by the codec.
pub const SAMPLES_PER_FRAME: usize = 1024;
/// Canonical PCM bytes that make up one encoded frame.
pub const FRAME_PCM_BYTES: usize = SAMPLES_PER_FRAME * CANONICAL_FRAME_BYTES;
/// Exact tick duration of one encoded frame.
pub const FRAME_DURATION_TICKS: i64 =
    (SAMPLES_PER_FRAME as i64 * TICKS_PER_SECOND as i64) / CANONICAL_SAMPLE_RATE as i64;

pub const AUDIO_BITRATE: usize = 192_000;

/// One complete PCM block ready for the codec, with its assigned
/// presentation timestamp.
struct PcmBlock {
    pts: i64,
    /// Interleaved canonical samples, exactly `SAMPLES_PER_FRAME * 2`
    samples: Vec<i16>,
}

/// Accumulates canonical PCM bytes and cuts them into codec-sized blocks.
///
/// The first non-zero origin timestamp anchors the stream; every block
/// after that advances by exactly one frame duration, so the emitted
/// sequence is independent of how the input bytes were partitioned.
struct PcmChunker {
    pending: VecDeque<u8>,
    base_ts: Option<i64>,
    blocks_out: i64,
}

impl PcmChunker {
    fn new() -> Self {
        Self {
            pending: VecDeque::with_capacity(FRAME_PCM_BYTES * 2),
            base_ts: None,
            blocks_out: 0,
        }
    }

    fn push(&mut self, bytes: &[u8], origin_ts: i64) -> Vec<PcmBlock> {
        if self.base_ts.is_none() && origin_ts != 0 {
            self.base_ts = Some(origin_ts);
        }
        self.pending.extend(bytes);

        let mut blocks = Vec::new();
        while self.pending.len() >= FRAME_PCM_BYTES {
            let raw: Vec<u8> = self.pending.drain(..FRAME_PCM_BYTES).collect();
            blocks.push(self.block_from(&raw));
        }
        blocks
    }

    /// Zero-pad whatever is left into a final block.
    fn flush(&mut self) -> Option<PcmBlock> {
        if self.pending.is_empty() {
            return None;
        }
        let mut raw: Vec<u8> = self.pending.drain(..).collect();
        raw.resize(FRAME_PCM_BYTES, 0);
        Some(self.block_from(&raw))
    }

    fn block_from(&mut self, raw: &[u8]) -> PcmBlock {
        let samples = raw
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        let pts = self.base_ts.unwrap_or(0) + self.blocks_out * FRAME_DURATION_TICKS;
        self.blocks_out += 1;
        PcmBlock { pts, samples }
    }
}

/// AAC encoder emitting fixed 1024-sample frames through a sink.
pub struct AacEncoder {
    encoder: Option<ffmpeg::codec::encoder::Audio>,
    chunker: PcmChunker,
    sink: Option<Box<dyn AudioFrameSink>>,
    /// Assigned tick timestamps for frames in flight inside the codec
    pending_pts: VecDeque<i64>,
    /// Sample counter driving the codec-side pts (1/48000 timebase)
    samples_sent: i64,
    codec_config: Option<Vec<u8>>,
}

impl AacEncoder {
    pub fn new() -> Result<Self> {
        let encoder = Self::create_encoder()?;
        let codec_config = unsafe {
            let ptr = (*encoder.as_ptr()).extradata;
            let len = (*encoder.as_ptr()).extradata_size;
            if ptr.is_null() || len <= 0 {
                None
            } else {
                Some(std::slice::from_raw_parts(ptr, len as usize).to_vec())
            }
        };

        Ok(Self {
            encoder: Some(encoder),
            chunker: PcmChunker::new(),
            sink: None,
            pending_pts: VecDeque::with_capacity(8),
            samples_sent: 0,
            codec_config,
        })
    }

    fn create_encoder() -> Result<ffmpeg::codec::encoder::Audio> {
        let encoder_codec = ffmpeg::codec::encoder::find(ffmpeg::codec::Id::AAC)
            .ok_or(ffmpeg::Error::EncoderNotFound)
            .map_err(|_| ReplayError::EncoderInit("AAC encoder not available".into()))?;

        let mut encoder_ctx = ffmpeg::codec::context::Context::new_with_codec(encoder_codec)
            .encoder()
            .audio()?;

        encoder_ctx.set_rate(CANONICAL_SAMPLE_RATE as i32);
        encoder_ctx.set_bit_rate(AUDIO_BITRATE);
        encoder_ctx.set_format(ffmpeg::format::Sample::F32(
            ffmpeg::format::sample::Type::Planar,
        ));
        encoder_ctx.set_time_base(Rational::new(1, CANONICAL_SAMPLE_RATE as i32));
        encoder_ctx.set_channel_layout(ffmpeg::channel_layout::ChannelLayout::STEREO);
        unsafe {
            // The muxer wants the AudioSpecificConfig out of band.
            (*encoder_ctx.as_mut_ptr()).flags |= AV_CODEC_FLAG_GLOBAL_HEADER as i32;
        }

        let encoder = encoder_ctx
            .open()
            .map_err(|e| ReplayError::EncoderInit(format!("AAC refused configuration: {e}")))?;
        Ok(encoder)
    }

    fn encode_block(&mut self, block: PcmBlock) -> Result<()> {
        let encoder = match self.encoder {
            Some(ref mut enc) => enc,
            None => return Ok(()),
        };

        let mut frame = ffmpeg::frame::Audio::new(
            encoder.format(),
            SAMPLES_PER_FRAME,
            encoder.channel_layout(),
        );
        frame.set_rate(CANONICAL_SAMPLE_RATE);

        // Deinterleave canonical i16 stereo into the codec's planar f32.
        {
            let (left, right) = {
                let mut left = Vec::with_capacity(SAMPLES_PER_FRAME);
                let mut right = Vec::with_capacity(SAMPLES_PER_FRAME);
                for pair in block.samples.chunks_exact(2) {
                    left.push(pair[0] as f32 / 32_768.0);
                    right.push(pair[1] as f32 / 32_768.0);
                }
                (left, right)
            };
            frame.plane_mut(0).copy_from_slice(&left);
            frame.plane_mut(1).copy_from_slice(&right);
        }

        frame.set_pts(Some(self.samples_sent));
        self.samples_sent += SAMPLES_PER_FRAME as i64;
        self.pending_pts.push_back(block.pts);

        encoder.send_frame(&frame)?;
        self.receive_packets()
    }

    fn receive_packets(&mut self) -> Result<()> {
        let encoder = match self.encoder {
            Some(ref mut enc) => enc,
            None => return Ok(()),
        };
        let mut packet = ffmpeg::codec::packet::Packet::empty();
        while encoder.receive_packet(&mut packet).is_ok() {
            if let Some(data) = packet.data() {
                let pts = self.pending_pts.pop_front().unwrap_or(0);
                let frame = EncodedAudioFrame {
                    data: data.to_vec(),
                    pts,
                    duration: FRAME_DURATION_TICKS,
                };
                match self.sink {
                    Some(ref mut sink) => sink.accept(frame),
                    None => log::error!("encoded audio frame dropped: no sink installed"),
                }
            }
            packet = ffmpeg::codec::packet::Packet::empty();
        }
        Ok(())
    }
}

impl AudioEncoder for AacEncoder {
    fn set_sink(&mut self, sink: Box<dyn AudioFrameSink>) {
        self.sink = Some(sink);
    }

    fn feed(&mut self, pcm: &[u8], origin_ts: i64) -> Result<()> {
        for block in self.chunker.push(pcm, origin_ts) {
            self.encode_block(block)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(tail) = self.chunker.flush() {
            self.encode_block(tail)?;
        }
        if let Some(ref mut encoder) = self.encoder {
            encoder.send_eof()?;
        }
        self.receive_packets()?;
        self.encoder.take();
        Ok(())
    }

    fn codec_config_header(&self) -> Option<Vec<u8>> {
        self.codec_config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(bytes: usize, value: u8) -> Vec<u8> {
        vec![value; bytes]
    }

    #[test]
    fn frame_duration_is_exact() {
        assert_eq!(
            FRAME_DURATION_TICKS,
            SAMPLES_PER_FRAME as i64 * 10_000_000 / 48_000
        );
        assert_eq!(FRAME_DURATION_TICKS, 213_333);
    }

    #[test]
    fn chunker_emits_one_block_per_complete_frame() {
        let mut c = PcmChunker::new();
        let blocks = c.push(&pcm(FRAME_PCM_BYTES * 2 + 100, 1), 5_000);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].pts, 5_000);
        assert_eq!(blocks[1].pts, 5_000 + FRAME_DURATION_TICKS);
        assert_eq!(blocks[0].samples.len(), SAMPLES_PER_FRAME * 2);
    }

    #[test]
    fn chunker_anchor_is_first_nonzero_ts() {
        let mut c = PcmChunker::new();
        assert!(c.push(&pcm(100, 0), 0).is_empty());
        let blocks = c.push(&pcm(FRAME_PCM_BYTES, 0), 777);
        assert_eq!(blocks[0].pts, 777);
    }

    #[test]
    fn chunker_partitioning_is_irrelevant() {
        // Feed the same 3.5 frames of data in very different chunkings and
        // expect identical block timestamps and payloads.
        let total = FRAME_PCM_BYTES * 7 / 2;
        let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

        let collect = |splits: &[usize]| {
            let mut c = PcmChunker::new();
            let mut out = Vec::new();
            let mut offset = 0;
            for &n in splits {
                out.extend(c.push(&data[offset..offset + n], 1_000));
                offset += n;
            }
            out.extend(c.push(&data[offset..], 1_000));
            out
        };

        let one_shot = collect(&[]);
        let dribble = collect(&[1, 2, 3, 500, FRAME_PCM_BYTES, 7]);
        assert_eq!(one_shot.len(), 3);
        assert_eq!(one_shot.len(), dribble.len());
        for (a, b) in one_shot.iter().zip(&dribble) {
            assert_eq!(a.pts, b.pts);
            assert_eq!(a.samples, b.samples);
        }
    }

    #[test]
    fn chunker_flush_pads_with_silence() {
        let mut c = PcmChunker::new();
        c.push(&pcm(FRAME_PCM_BYTES / 2, 0x7F), 42);
        let tail = c.flush().expect("partial block present");
        assert_eq!(tail.samples.len(), SAMPLES_PER_FRAME * 2);
        assert!(tail.samples[SAMPLES_PER_FRAME..].iter().all(|&s| s == 0));
        assert!(c.flush().is_none());
    }

    #[test]
    fn total_duration_matches_bytes_fed() {
        let mut c = PcmChunker::new();
        let fed = FRAME_PCM_BYTES * 5 + 123;
        let blocks = c.push(&pcm(fed, 9), 10);
        let total: i64 = blocks.len() as i64 * FRAME_DURATION_TICKS;
        assert_eq!(total, (fed / FRAME_PCM_BYTES) as i64 * FRAME_DURATION_TICKS);
    }
}
