use std::collections::VecDeque;

use crate::types::video_frame::EncodedVideoFrame;
use crate::utils::TICKS_PER_SECOND;

const MIN_SLOTS: usize = 100;
const MAX_SLOTS: usize = 100_000;

/// Time-bounded circular store of encoded video frames.
///
/// Holds at most the configured window's worth of frames by timestamp,
/// with a slot cap and a hard byte ceiling underneath so that neither a
/// stalled clock nor pathological frame sizes can grow the buffer without
/// bound. All access is serialized by the owner behind one lock; eviction
/// happens only inside [`VideoSampleStore::insert`].
pub struct VideoSampleStore {
    frames: VecDeque<EncodedVideoFrame>,
    /// Replay window in ticks
    max_span: u64,
    max_slots: usize,
    byte_ceiling: u64,
    payload_bytes: u64,
    sequence_header: Option<Vec<u8>>,
    evicted: u64,
}

impl VideoSampleStore {
    pub fn new(window_secs: u32, fps_hint: u32, byte_ceiling: u64) -> Self {
        // 1.5x headroom over the nominal frame count so a saved clip keeps
        // the full window even when the encoder briefly runs hot.
        let slots = ((window_secs as u64 * fps_hint as u64 * 3).div_ceil(2) as usize)
            .clamp(MIN_SLOTS, MAX_SLOTS);
        Self {
            frames: VecDeque::with_capacity(slots.min(4096)),
            max_span: window_secs as u64 * TICKS_PER_SECOND,
            max_slots: slots,
            byte_ceiling,
            payload_bytes: 0,
            sequence_header: None,
            evicted: 0,
        }
    }

    /// Insert one frame, taking ownership of its payload.
    ///
    /// Frames must arrive with non-decreasing timestamps; the incoming
    /// frame's timestamp is the window's "newest" edge for eviction.
    pub fn insert(&mut self, frame: EncodedVideoFrame) {
        debug_assert!(!frame.data.is_empty());
        if frame.data.is_empty() {
            log::warn!("discarding empty encoded frame at pts {}", frame.pts);
            return;
        }

        while let Some(oldest) = self.frames.front() {
            if frame.pts.saturating_sub(oldest.pts) > self.max_span as i64 {
                self.pop_oldest();
            } else {
                break;
            }
        }
        if self.frames.len() == self.max_slots {
            self.pop_oldest();
        }
        while self.payload_bytes + frame.data.len() as u64 > self.byte_ceiling
            && !self.frames.is_empty()
        {
            self.pop_oldest();
        }

        self.payload_bytes += frame.data.len() as u64;
        self.frames.push_back(frame);
    }

    fn pop_oldest(&mut self) {
        if let Some(old) = self.frames.pop_front() {
            self.payload_bytes -= old.data.len() as u64;
            self.evicted += 1;
        }
    }

    /// Newest minus oldest stored timestamp, 0 when empty.
    pub fn span_ticks(&self) -> u64 {
        match (self.frames.front(), self.frames.back()) {
            (Some(oldest), Some(newest)) => newest.pts.saturating_sub(oldest.pts) as u64,
            _ => 0,
        }
    }

    /// Sum of stored payload lengths.
    pub fn bytes(&self) -> u64 {
        self.payload_bytes
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames_evicted(&self) -> u64 {
        self.evicted
    }

    /// Owned deep copies of all stored frames, timestamps rebased so the
    /// first frame sits at 0. The returned frames survive any subsequent
    /// insert or eviction.
    pub fn snapshot(&self) -> Vec<EncodedVideoFrame> {
        let base = match self.frames.front() {
            Some(f) => f.pts,
            None => return Vec::new(),
        };
        self.frames
            .iter()
            .map(|f| EncodedVideoFrame {
                data: f.data.clone(),
                is_keyframe: f.is_keyframe,
                pts: f.pts - base,
                duration: f.duration,
            })
            .collect()
    }

    /// Codec parameter header the muxer embeds in the container.
    /// Overwrites any prior value.
    pub fn set_sequence_header(&mut self, header: Vec<u8>) {
        self.sequence_header = Some(header);
    }

    pub fn sequence_header(&self) -> Option<&[u8]> {
        self.sequence_header.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(pts: i64, bytes: usize) -> EncodedVideoFrame {
        EncodedVideoFrame {
            data: vec![0xAB; bytes],
            is_keyframe: pts == 0,
            pts,
            duration: 166_667,
        }
    }

    fn store(window_secs: u32) -> VideoSampleStore {
        VideoSampleStore::new(window_secs, 60, u64::MAX)
    }

    #[test]
    fn insert_into_empty_store() {
        let mut s = store(5);
        s.insert(frame(1_000, 10));
        assert_eq!(s.len(), 1);
        assert_eq!(s.span_ticks(), 0);
        assert_eq!(s.bytes(), 10);
    }

    #[test]
    fn span_stays_within_window() {
        let mut s = store(2);
        let max_span = 2 * TICKS_PER_SECOND;
        // 10 seconds of 30 fps frames.
        let step = TICKS_PER_SECOND as i64 / 30;
        for i in 0..300 {
            s.insert(frame(i * step, 100));
            assert!(s.span_ticks() <= max_span, "span after insert {i}");
        }
        // Slots are 1.5x nominal: count settles between window and headroom.
        assert!(s.len() >= 50 && s.len() <= 100, "len = {}", s.len());
    }

    #[test]
    fn insert_at_exact_window_edge_does_not_evict() {
        let mut s = store(2);
        s.insert(frame(0, 10));
        s.insert(frame(2 * TICKS_PER_SECOND as i64, 10));
        assert_eq!(s.len(), 2);
        s.insert(frame(2 * TICKS_PER_SECOND as i64 + 1, 10));
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn equal_timestamps_do_not_evict() {
        let mut s = store(2);
        s.insert(frame(500, 10));
        s.insert(frame(500, 10));
        assert_eq!(s.len(), 2);
        assert_eq!(s.span_ticks(), 0);
    }

    #[test]
    fn byte_ceiling_holds_when_timestamps_stall() {
        let mut s = VideoSampleStore::new(30, 60, 1_000);
        for _ in 0..50 {
            s.insert(frame(42, 100));
        }
        assert!(s.bytes() <= 1_000);
        assert_eq!(s.len(), 10);
    }

    #[test]
    fn slot_cap_holds_when_timestamps_stall() {
        let mut s = store(30);
        // Window of 30 s at 60 fps hint: 2700 slots.
        for i in 0..5_000 {
            s.insert(frame(i % 7, 1));
        }
        assert_eq!(s.len(), 2_700);
    }

    #[test]
    fn snapshot_rebases_and_preserves_payloads() {
        let mut s = store(5);
        for i in 0..5 {
            let mut f = frame(1_000_000 + i * 166_667, 8);
            f.data = vec![i as u8; 8];
            s.insert(f);
        }
        let snap = s.snapshot();
        assert_eq!(snap.len(), 5);
        assert_eq!(snap[0].pts, 0);
        for (i, f) in snap.iter().enumerate() {
            assert!(f.pts >= 0);
            assert_eq!(f.data, vec![i as u8; 8]);
        }
    }

    #[test]
    fn snapshot_survives_eviction() {
        let mut s = store(1);
        s.insert(frame(0, 4));
        s.insert(frame(100, 4));
        let snap = s.snapshot();
        // Push the original frames out of the window.
        for i in 0..100 {
            s.insert(frame(5 * TICKS_PER_SECOND as i64 + i, 4));
        }
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].data, vec![0xAB; 4]);
        assert_eq!(snap[1].pts - snap[0].pts, 100);
    }

    #[test]
    fn empty_snapshot() {
        assert!(store(5).snapshot().is_empty());
    }

    #[test]
    fn sequence_header_overwrites() {
        let mut s = store(5);
        s.set_sequence_header(vec![1, 2]);
        s.set_sequence_header(vec![3]);
        assert_eq!(s.sequence_header(), Some(&[3u8][..]));
    }

    proptest! {
        // Property: after every insert, newest - oldest <= window, stored
        // timestamps are non-decreasing, and byte accounting matches.
        #[test]
        fn span_and_ordering_invariants(deltas in prop::collection::vec(0i64..500_000, 1..200)) {
            let mut s = store(2);
            let mut pts = 0i64;
            for d in deltas {
                pts += d;
                s.insert(frame(pts, 16));
                prop_assert!(s.span_ticks() <= 2 * TICKS_PER_SECOND);
                let snap = s.snapshot();
                for pair in snap.windows(2) {
                    prop_assert!(pair[0].pts <= pair[1].pts);
                }
                prop_assert_eq!(s.bytes(), s.len() as u64 * 16);
            }
        }
    }
}
