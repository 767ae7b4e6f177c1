//! End-to-end pipeline runs against fake capture/encode/mux components.
//! The fakes plug into the same traits the PipeWire/VAAPI set uses, so
//! these exercise the state machine, pacing, stores, and save path
//! without needing a compositor or GPU.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use ffmpeg_next as ffmpeg;
use replaycap_rs::{
    capture::FrameSource,
    encoders::converter::ColorConverter,
    encoders::video::{VideoEncoder, VideoFrameSink},
    mux::{AudioTrackParams, Muxer, VideoTrackParams},
    types::{
        audio_frame::EncodedAudioFrame,
        config::{Rect, ReplayConfig},
        error::{ReplayError, Result},
        video_frame::{EncodedVideoFrame, RawVideoFrame},
    },
    utils::{ticks_since, TICKS_PER_SECOND},
    PipelineParts, PipelineState, ReplayPipeline,
};

const SIZE: u32 = 64;

struct FakeSource {
    start: Instant,
    region: Rect,
}

impl FakeSource {
    fn new(start: Instant) -> Self {
        Self {
            start,
            region: Rect::new(0, 0, SIZE, SIZE),
        }
    }
}

impl FrameSource for FakeSource {
    fn acquire_latest(&mut self) -> Result<Option<RawVideoFrame>> {
        Ok(Some(RawVideoFrame {
            data: vec![0x80; (SIZE * SIZE * 4) as usize],
            timestamp: ticks_since(self.start),
            dmabuf_fd: None,
            stride: (SIZE * 4) as i32,
            offset: 0,
            size: SIZE * SIZE * 4,
            width: SIZE,
            height: SIZE,
        }))
    }

    fn set_region(&mut self, rect: Rect) -> Result<()> {
        self.region = rect;
        Ok(())
    }

    fn region(&self) -> Rect {
        self.region
    }

    fn capture_size(&self) -> (u32, u32) {
        (SIZE, SIZE)
    }

    fn refresh_rate(&self) -> u32 {
        60
    }

    fn stop(&mut self) {}
}

struct PassthroughConverter;

impl ColorConverter for PassthroughConverter {
    fn convert(&mut self, _frame: &RawVideoFrame) -> Result<Option<ffmpeg::frame::Video>> {
        Ok(Some(ffmpeg::frame::Video::new(
            ffmpeg::format::Pixel::NV12,
            SIZE,
            SIZE,
        )))
    }
}

/// Synchronous stand-in for the hardware encoder: every submit becomes
/// one finished frame handed straight to the sink.
struct FakeEncoder {
    sink: Option<Box<dyn VideoFrameSink>>,
    frames: u64,
}

impl FakeEncoder {
    fn new() -> Self {
        Self {
            sink: None,
            frames: 0,
        }
    }
}

impl VideoEncoder for FakeEncoder {
    fn sequence_header(&self) -> Option<Vec<u8>> {
        Some(vec![0, 0, 0, 1, 0x67])
    }

    fn set_sink(&mut self, sink: Box<dyn VideoFrameSink>) -> Result<()> {
        self.sink = Some(sink);
        Ok(())
    }

    fn submit(&mut self, _texture: ffmpeg::frame::Video, pts: i64) -> Result<()> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| ReplayError::Validation("no sink".into()))?;
        sink.accept(EncodedVideoFrame {
            data: vec![0xAB; 1_500],
            is_keyframe: self.frames % 30 == 0,
            pts,
            duration: (TICKS_PER_SECOND / 60) as i64,
        });
        self.frames += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MuxRecord {
    path: PathBuf,
    video_frames: usize,
    first_pts: i64,
    span_ticks: u64,
    had_audio: bool,
}

/// Records what it was asked to write and drops a marker file, optionally
/// after a configurable delay (to exercise stop-during-save).
struct RecordingMuxer {
    log: Arc<Mutex<Vec<MuxRecord>>>,
    delay: Duration,
}

impl Muxer for RecordingMuxer {
    fn write(
        &mut self,
        path: &Path,
        video: &[EncodedVideoFrame],
        _video_params: &VideoTrackParams,
        audio: Option<(&[EncodedAudioFrame], &AudioTrackParams)>,
    ) -> Result<()> {
        std::thread::sleep(self.delay);
        let first_pts = video.first().map(|f| f.pts).unwrap_or(-1);
        let span = match (video.first(), video.last()) {
            (Some(first), Some(last)) => (last.pts - first.pts) as u64,
            _ => 0,
        };
        self.log.lock().unwrap().push(MuxRecord {
            path: path.to_path_buf(),
            video_frames: video.len(),
            first_pts,
            span_ticks: span,
            had_audio: audio.is_some(),
        });
        std::fs::write(path, b"clip").map_err(ReplayError::from)
    }
}

fn fake_parts(delay: Duration) -> (PipelineParts, Arc<Mutex<Vec<MuxRecord>>>) {
    let start = Instant::now();
    let log = Arc::new(Mutex::new(Vec::new()));
    let parts = PipelineParts {
        frame_source: Box::new(FakeSource::new(start)),
        converter: Box::new(PassthroughConverter),
        video_encoder: Box::new(FakeEncoder::new()),
        audio: None,
        muxer: Box::new(RecordingMuxer {
            log: Arc::clone(&log),
            delay,
        }),
        start_time: start,
    };
    (parts, log)
}

fn config(duration_secs: u32, fps: u32) -> ReplayConfig {
    ReplayConfig {
        duration_secs,
        fps,
        ..Default::default()
    }
}

fn out_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("replaycap-test-{name}-{}", std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

#[test]
fn save_immediately_after_start_is_too_early() {
    let (parts, _log) = fake_parts(Duration::ZERO);
    let pipeline = ReplayPipeline::launch(&config(5, 60), parts).expect("launch");
    let path = out_path("too-early");

    match pipeline.save(&path) {
        Err(ReplayError::SaveTooEarly { have, need }) => {
            assert!(have < need);
            assert_eq!(need, 60);
        }
        other => panic!("expected SaveTooEarly, got {other:?}"),
    }
    assert!(!path.exists());

    pipeline.stop().expect("stop");
    assert_eq!(pipeline.status().state, PipelineState::Stopped);
}

#[test]
fn window_is_evicted_while_capturing() {
    let (parts, log) = fake_parts(Duration::ZERO);
    let pipeline = ReplayPipeline::launch(&config(2, 30), parts).expect("launch");

    // Run long enough that the first second of frames must be evicted.
    std::thread::sleep(Duration::from_millis(3_600));

    let status = pipeline.status();
    assert_eq!(status.state, PipelineState::Capturing);
    assert!(status.memory_bytes > 0);

    let path = out_path("eviction");
    pipeline.save(&path).expect("save");
    assert!(path.exists());

    let log = log.lock().unwrap();
    let record = log.last().expect("one mux record");
    assert_eq!(record.path, path);
    assert!(
        record.video_frames >= 50 && record.video_frames <= 100,
        "stored {} frames",
        record.video_frames
    );
    assert_eq!(record.first_pts, 0, "snapshot must be rebased");
    assert!(
        record.span_ticks <= 2 * TICKS_PER_SECOND + TICKS_PER_SECOND / 10,
        "span {} exceeds the window",
        record.span_ticks
    );
    assert!(!record.had_audio);
    drop(log);

    let _ = std::fs::remove_file(&path);
    pipeline.stop().expect("stop");
}

#[test]
fn stop_waits_for_in_flight_save() {
    let (parts, log) = fake_parts(Duration::from_millis(400));
    let pipeline = Arc::new(ReplayPipeline::launch(&config(1, 60), parts).expect("launch"));

    // Fill the buffer past the save precondition.
    std::thread::sleep(Duration::from_millis(1_500));

    let path = out_path("stop-during-save");
    let saver = {
        let pipeline = Arc::clone(&pipeline);
        let path = path.clone();
        std::thread::spawn(move || {
            let result = pipeline.save(&path);
            (result, Instant::now())
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    let stop_called_at = Instant::now();
    pipeline.stop().expect("stop");
    let stop_took = stop_called_at.elapsed();

    let (save_result, _saved_at) = saver.join().expect("saver thread");
    save_result.expect("save must complete despite the stop");
    // The mux had ~350 ms left when stop was issued; stop may only return
    // after it completed.
    assert!(
        stop_took >= Duration::from_millis(300),
        "stop returned after {stop_took:?}, before the in-flight save finished"
    );
    assert_eq!(pipeline.status().state, PipelineState::Stopped);
    assert_eq!(log.lock().unwrap().len(), 1);
    assert!(path.exists());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn save_after_stop_is_refused() {
    let (parts, _log) = fake_parts(Duration::ZERO);
    let pipeline = ReplayPipeline::launch(&config(1, 30), parts).expect("launch");
    std::thread::sleep(Duration::from_millis(1_500));
    pipeline.stop().expect("stop");

    let path = out_path("after-stop");
    assert!(matches!(
        pipeline.save(&path),
        Err(ReplayError::Validation(_))
    ));
    assert!(!path.exists());
}

#[test]
fn status_tracks_submissions() {
    let (parts, _log) = fake_parts(Duration::ZERO);
    let pipeline = ReplayPipeline::launch(&config(2, 30), parts).expect("launch");
    std::thread::sleep(Duration::from_millis(500));

    let status = pipeline.status();
    assert_eq!(status.state, PipelineState::Capturing);
    assert_eq!(status.window_secs, 2);
    assert!(status.frames_submitted > 0);
    assert_eq!(status.frames_buffered as u64, status.frames_submitted);

    pipeline.stop().expect("stop");
}
