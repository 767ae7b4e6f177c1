use std::collections::VecDeque;

use crate::types::audio_frame::EncodedAudioFrame;
use crate::utils::TICKS_PER_SECOND;

/// Upper bound on stored audio frames regardless of the time window.
pub const MAX_AUDIO_SAMPLES: usize = 32_768;

/// Time-bounded list of encoded audio frames; the audio sibling of
/// [`crate::stores::video::VideoSampleStore`]. Bounded by the replay
/// window and by [`MAX_AUDIO_SAMPLES`]; backing storage grows in
/// powers of two up to that cap.
pub struct AudioSampleStore {
    frames: VecDeque<EncodedAudioFrame>,
    max_span: u64,
    payload_bytes: u64,
    codec_config: Option<Vec<u8>>,
}

impl AudioSampleStore {
    pub fn new(window_secs: u32) -> Self {
        Self {
            frames: VecDeque::with_capacity(256),
            max_span: window_secs as u64 * TICKS_PER_SECOND,
            payload_bytes: 0,
            codec_config: None,
        }
    }

    pub fn insert(&mut self, frame: EncodedAudioFrame) {
        debug_assert!(!frame.data.is_empty());
        if frame.data.is_empty() {
            return;
        }

        while let Some(oldest) = self.frames.front() {
            if frame.pts.saturating_sub(oldest.pts) > self.max_span as i64 {
                self.pop_oldest();
            } else {
                break;
            }
        }
        if self.frames.len() == MAX_AUDIO_SAMPLES {
            self.pop_oldest();
        }

        self.payload_bytes += frame.data.len() as u64;
        self.frames.push_back(frame);
    }

    fn pop_oldest(&mut self) {
        if let Some(old) = self.frames.pop_front() {
            self.payload_bytes -= old.data.len() as u64;
        }
    }

    pub fn span_ticks(&self) -> u64 {
        match (self.frames.front(), self.frames.back()) {
            (Some(oldest), Some(newest)) => newest.pts.saturating_sub(oldest.pts) as u64,
            _ => 0,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.payload_bytes
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Owned copies rebased so the first frame's timestamp is 0.
    pub fn snapshot(&self) -> Vec<EncodedAudioFrame> {
        let base = match self.frames.front() {
            Some(f) => f.pts,
            None => return Vec::new(),
        };
        self.frames
            .iter()
            .map(|f| EncodedAudioFrame {
                data: f.data.clone(),
                pts: f.pts - base,
                duration: f.duration,
            })
            .collect()
    }

    /// Codec configuration blob the muxer embeds in the audio track.
    pub fn set_codec_config(&mut self, config: Vec<u8>) {
        self.codec_config = Some(config);
    }

    pub fn codec_config(&self) -> Option<&[u8]> {
        self.codec_config.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME_DURATION: i64 = 213_333;

    fn frame(pts: i64) -> EncodedAudioFrame {
        EncodedAudioFrame {
            data: vec![0x5A; 64],
            pts,
            duration: FRAME_DURATION,
        }
    }

    #[test]
    fn span_bounded_by_window() {
        let mut s = AudioSampleStore::new(2);
        for i in 0..1_000 {
            s.insert(frame(i * FRAME_DURATION));
            assert!(s.span_ticks() <= 2 * TICKS_PER_SECOND);
        }
        // ~94 frames fit in 2 s at 1024 samples / 48 kHz.
        assert!(s.len() >= 90 && s.len() <= 95, "len = {}", s.len());
    }

    #[test]
    fn count_cap_holds_when_timestamps_stall() {
        let mut s = AudioSampleStore::new(3_600);
        for _ in 0..MAX_AUDIO_SAMPLES + 100 {
            s.insert(frame(7));
        }
        assert_eq!(s.len(), MAX_AUDIO_SAMPLES);
    }

    #[test]
    fn snapshot_rebases() {
        let mut s = AudioSampleStore::new(5);
        for i in 0..4 {
            s.insert(frame(900_000 + i * FRAME_DURATION));
        }
        let snap = s.snapshot();
        assert_eq!(snap[0].pts, 0);
        for (i, f) in snap.iter().enumerate() {
            assert_eq!(f.pts, i as i64 * FRAME_DURATION);
            assert_eq!(f.duration, FRAME_DURATION);
        }
    }

    #[test]
    fn snapshot_is_independent_of_eviction() {
        let mut s = AudioSampleStore::new(1);
        s.insert(frame(0));
        let snap = s.snapshot();
        for i in 1..200 {
            s.insert(frame(i * TICKS_PER_SECOND as i64));
        }
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].data, vec![0x5A; 64]);
    }

    #[test]
    fn codec_config_round_trip() {
        let mut s = AudioSampleStore::new(5);
        assert!(s.codec_config().is_none());
        s.set_codec_config(vec![0x12, 0x10]);
        assert_eq!(s.codec_config(), Some(&[0x12u8, 0x10][..]));
    }
}
