use std::time::{Duration, Instant};

use crate::types::config::{AspectRatio, Rect};

/// 100-nanosecond ticks per second; every timestamp and duration in the
/// pipeline is counted in these.
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Canonical PCM everything downstream of a capture device speaks:
/// 48 kHz, 16-bit signed, two interleaved channels.
pub const CANONICAL_SAMPLE_RATE: u32 = 48_000;
pub const CANONICAL_CHANNELS: u16 = 2;
/// Bytes per canonical sample frame (one i16 per channel).
pub const CANONICAL_FRAME_BYTES: usize = 4;
/// Canonical bytes per second of wall-clock audio.
pub const CANONICAL_BYTE_RATE: u64 =
    CANONICAL_SAMPLE_RATE as u64 * CANONICAL_FRAME_BYTES as u64;

/// Ticks elapsed since `start`, for stamping submits against the pacing clock.
pub fn ticks_since(start: Instant) -> i64 {
    (start.elapsed().as_nanos() / 100) as i64
}

pub fn ticks_from_duration(d: Duration) -> u64 {
    (d.as_nanos() / 100) as u64
}

pub fn duration_from_ticks(ticks: u64) -> Duration {
    Duration::from_nanos(ticks * 100)
}

/// Round a dimension down to the nearest even pixel (4:2:0 requirement).
pub fn even(v: u32) -> u32 {
    v & !1
}

/// The largest `rw:rh` rectangle centered inside `bounds`, dimensions
/// rounded down to even pixels.
pub fn aspect_crop(bounds: Rect, rw: u32, rh: u32) -> Rect {
    debug_assert!(rw > 0 && rh > 0);
    let (mut w, mut h);
    // Compare bounds ratio against rw:rh without going through floats.
    if (bounds.width as u64) * (rh as u64) >= (bounds.height as u64) * (rw as u64) {
        // Wider than the target ratio: height limits.
        h = bounds.height;
        w = ((h as u64 * rw as u64) / rh as u64) as u32;
    } else {
        w = bounds.width;
        h = ((w as u64 * rh as u64) / rw as u64) as u32;
    }
    w = even(w.min(bounds.width));
    h = even(h.min(bounds.height));
    Rect {
        x: bounds.x + ((bounds.width - w) / 2) as i32,
        y: bounds.y + ((bounds.height - h) / 2) as i32,
        width: w,
        height: h,
    }
}

/// The rectangle the pipeline actually captures: the saved rect when it is
/// valid inside `bounds`, otherwise the aspect crop (or the full bounds
/// for a native ratio). Dimensions always come out even.
pub fn effective_capture_rect(bounds: Rect, ratio: AspectRatio, saved: Option<Rect>) -> Rect {
    if let Some(rect) = saved {
        if !rect.is_empty() && bounds.contains(&rect) {
            return Rect {
                width: even(rect.width),
                height: even(rect.height),
                ..rect
            };
        }
    }
    match ratio.units() {
        Some((rw, rh)) => aspect_crop(bounds, rw, rh),
        None => Rect {
            width: even(bounds.width),
            height: even(bounds.height),
            ..bounds
        },
    }
}

/// Informational RAM estimate for a replay window, per the reference curve
/// of 75 Mbps at 3.7 MP and 60 fps, scaled linearly by megapixels
/// (clamped 0.5x-2.5x) and frame rate (clamped 0.5x-2.0x).
pub fn estimate_buffer_bytes(width: u32, height: u32, fps: u32, duration_secs: u32) -> u64 {
    const REFERENCE_MBPS: f64 = 75.0;
    const REFERENCE_MEGAPIXELS: f64 = 3.7;

    let megapixels = (width as f64 * height as f64) / 1_000_000.0;
    let mp_scale = (megapixels / REFERENCE_MEGAPIXELS).clamp(0.5, 2.5);
    let fps_scale = (fps as f64 / 60.0).clamp(0.5, 2.0);
    let mbps = REFERENCE_MBPS * mp_scale * fps_scale;
    ((mbps * 1_000_000.0 * duration_secs as f64) / 8.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_rounds_down() {
        assert_eq!(even(1921), 1920);
        assert_eq!(even(1080), 1080);
        assert_eq!(even(1), 0);
    }

    #[test]
    fn aspect_crop_of_matching_rect_is_identity() {
        let m = Rect::new(0, 0, 1920, 1080);
        assert_eq!(aspect_crop(m, 16, 9), m);
    }

    #[test]
    fn aspect_crop_is_centered_and_even() {
        // 9:16 portrait crop out of a 1920x1080 landscape monitor.
        let m = Rect::new(0, 0, 1920, 1080);
        let r = aspect_crop(m, 9, 16);
        assert_eq!(r.height, 1080);
        assert_eq!(r.width, 606); // floor(1080 * 9 / 16) = 607, evened
        assert_eq!(r.x, (1920 - 606) as i32 / 2);
        assert_eq!(r.y, 0);
    }

    #[test]
    fn aspect_crop_ultrawide() {
        let m = Rect::new(100, 50, 2560, 1440);
        let r = aspect_crop(m, 32, 9);
        assert_eq!(r.width, 2560);
        assert_eq!(r.height, 720);
        assert_eq!(r.y, 50 + (1440 - 720) as i32 / 2);
    }

    #[test]
    fn saved_rect_wins_when_valid() {
        let m = Rect::new(0, 0, 1920, 1080);
        let saved = Rect::new(10, 10, 640, 480);
        assert_eq!(
            effective_capture_rect(m, AspectRatio::R16x9, Some(saved)),
            saved
        );
    }

    #[test]
    fn invalid_saved_rect_falls_back_to_crop() {
        let m = Rect::new(0, 0, 1920, 1080);
        let outside = Rect::new(1900, 0, 640, 480);
        let r = effective_capture_rect(m, AspectRatio::R16x9, Some(outside));
        assert_eq!(r, aspect_crop(m, 16, 9));

        let empty = Rect::new(0, 0, 0, 0);
        let r = effective_capture_rect(m, AspectRatio::Native, Some(empty));
        assert_eq!(r, m);
    }

    #[test]
    fn estimate_matches_reference_point() {
        // 2560x1440 ~= 3.7 MP at 60 fps for 30 s: the unscaled 75 Mbps case.
        let bytes = estimate_buffer_bytes(2560, 1440, 60, 30);
        let expected = (75.0_f64 * 1_000_000.0 * 30.0 / 8.0) as u64;
        let tolerance = expected / 100;
        assert!(bytes.abs_diff(expected) < tolerance, "{bytes} vs {expected}");
    }

    #[test]
    fn estimate_clamps_extremes() {
        // Tiny capture at low fps clamps both scales to 0.5.
        let small = estimate_buffer_bytes(640, 360, 30, 10);
        let expected = (75.0_f64 * 0.5 * 0.5 * 1_000_000.0 * 10.0 / 8.0) as u64;
        assert_eq!(small, expected);

        // 8K at 120 fps clamps to 2.5 x 2.0.
        let big = estimate_buffer_bytes(7680, 4320, 120, 10);
        let expected = (75.0_f64 * 2.5 * 2.0 * 1_000_000.0 * 10.0 / 8.0) as u64;
        assert_eq!(big, expected);
    }

    #[test]
    fn tick_round_trips() {
        let d = Duration::from_millis(16);
        assert_eq!(duration_from_ticks(ticks_from_duration(d)), d);
        assert_eq!(ticks_from_duration(Duration::from_secs(1)), TICKS_PER_SECOND);
    }
}
