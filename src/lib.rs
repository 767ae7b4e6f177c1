//! # replaycap-rs
//!
//! `replaycap-rs` is an instant-replay screen recorder core for
//! Wayland-based Linux systems: a continuously running, bounded-RAM
//! pipeline that captures frames through PipeWire, encodes them on the
//! GPU, mixes audio from multiple devices, keeps the most recent N
//! seconds of encoded media in memory, and muxes that rolling window
//! into a playable MP4 on demand without re-encoding.
//!
//! ## Features
//!
//! - Hardware-accelerated H.264 encoding (VAAPI) with an async output pump
//! - GPU-side color conversion and region cropping, DMA-BUF capable
//! - Up to three mixed audio sources with per-source volume
//! - Time-bounded in-memory stores: the buffer never outgrows the window
//! - Passthrough save: the clip on disk is the buffer, not a re-encode
//!
//! ## Example
//!
//! ```no_run
//! use replaycap_rs::pipeline::builder::ReplayBuilder;
//! use replaycap_rs::types::config::QualityPreset;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let replay = ReplayBuilder::new()
//!         .with_duration_secs(30)
//!         .with_quality_preset(QualityPreset::Medium)
//!         .with_audio()
//!         .build()?;
//!
//!     // ... later, on the user's hotkey:
//!     replay.save("clip.mp4")?;
//!
//!     replay.stop()?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};

use capture::mixer::AudioMixer;
use capture::FrameSource;
use encoders::audio::{AudioEncoder, AudioFrameSink};
use encoders::converter::ColorConverter;
use encoders::video::{VideoEncoder, VideoFrameSink};
use mux::{AudioTrackParams, Muxer, VideoTrackParams};
use stores::audio::AudioSampleStore;
use stores::video::VideoSampleStore;
use types::audio_frame::EncodedAudioFrame;
use types::config::{QualityPreset, ReplayConfig};
use types::error::{ReplayError, Result};
use types::video_frame::EncodedVideoFrame;
use utils::{ticks_since, CANONICAL_BYTE_RATE, TICKS_PER_SECOND};

pub mod capture;
pub mod encoders;
pub mod mux;
pub mod pipeline;
pub mod stores;
pub mod types;
pub mod utils;

pub use crate::encoders::vaapi_encoder::VaapiEncoder;
pub use crate::pipeline::builder::ReplayBuilder;

/// How long an external save call waits for the mux before giving up.
const SAVE_DEADLINE: Duration = Duration::from_secs(30);

/// How long the pacing loop waits for commands per iteration.
const COMMAND_WAIT: Duration = Duration::from_millis(1);

/// Canonical bytes pulled from the mixer per pacing iteration.
const MIX_READ_CHUNK: usize = 16_384;

/// Cadence of the periodic health log.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Replay pipeline lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninit,
    Starting,
    Capturing,
    Saving,
    Stopping,
    Error,
    Stopped,
}

/// Cross-thread pipeline state: the state machine cell, the stop event,
/// and the transient-failure counters behind the periodic health stats.
pub struct PipelineControls {
    state: Mutex<PipelineState>,
    stop_flag: AtomicBool,
    saving_flag: AtomicBool,
    frames_submitted: AtomicU64,
    frames_dropped: AtomicU64,
    acquire_misses: AtomicU64,
    convert_misses: AtomicU64,
}

impl PipelineControls {
    fn new() -> Self {
        Self {
            state: Mutex::new(PipelineState::Uninit),
            stop_flag: AtomicBool::new(false),
            saving_flag: AtomicBool::new(false),
            frames_submitted: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            acquire_misses: AtomicU64::new(0),
            convert_misses: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.lock().unwrap() = state;
    }

    /// Transition only when the current state matches; returns whether
    /// the transition happened.
    fn transition(&self, from: PipelineState, to: PipelineState) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// The stop event: once set it stays set for the pipeline's lifetime.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    pub fn is_saving(&self) -> bool {
        self.saving_flag.load(Ordering::Acquire)
    }
}

/// Point-in-time pipeline status for UIs and callers.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub window_secs: u32,
    pub memory_bytes: u64,
    pub frames_buffered: usize,
    pub frames_submitted: u64,
    pub frames_dropped: u64,
}

enum Command {
    Save {
        path: PathBuf,
        done: Sender<Result<()>>,
    },
}

/// The components a pipeline runs on. The builder assembles the real
/// PipeWire/VAAPI set; alternative backends plug in through the same
/// traits.
pub struct PipelineParts {
    pub frame_source: Box<dyn FrameSource>,
    pub converter: Box<dyn ColorConverter>,
    pub video_encoder: Box<dyn VideoEncoder>,
    pub audio: Option<AudioParts>,
    pub muxer: Box<dyn Muxer>,
    /// The pipeline's t=0; all timestamps are ticks since this instant.
    pub start_time: Instant,
}

pub struct AudioParts {
    pub mixer: AudioMixer,
    pub encoder: Box<dyn AudioEncoder>,
}

/// Sink the encoder pump writes finished video frames into.
struct VideoStoreSink {
    store: Arc<Mutex<VideoSampleStore>>,
    controls: Arc<PipelineControls>,
}

impl VideoFrameSink for VideoStoreSink {
    fn accept(&mut self, frame: EncodedVideoFrame) {
        self.controls.frames_submitted.fetch_add(1, Ordering::Relaxed);
        self.store.lock().unwrap().insert(frame);
    }
}

struct AudioStoreSink {
    store: Arc<Mutex<AudioSampleStore>>,
}

impl AudioFrameSink for AudioStoreSink {
    fn accept(&mut self, frame: EncodedAudioFrame) {
        self.store.lock().unwrap().insert(frame);
    }
}

/// Owner of the whole replay pipeline: the state machine, the capture
/// pacing thread, and the save coordination.
pub struct ReplayPipeline {
    controls: Arc<PipelineControls>,
    cmd_tx: Sender<Command>,
    capture_thread: Mutex<Option<JoinHandle<Result<()>>>>,
    video_store: Arc<Mutex<VideoSampleStore>>,
    audio_store: Option<Arc<Mutex<AudioSampleStore>>>,
    window_secs: u32,
    min_frames_for_save: usize,
}

impl ReplayPipeline {
    /// Build the real capture/encode component set from `config` and
    /// start capturing. Shorthand for
    /// [`ReplayBuilder`](pipeline::builder::ReplayBuilder).
    pub fn start(config: &ReplayConfig) -> Result<Self> {
        pipeline::builder::build_pipeline(config)
    }

    /// Start a pipeline on an explicit component set.
    ///
    /// On return the pipeline is in `Capturing`; failures during
    /// construction leave it in `Error` and drop every part.
    pub fn launch(config: &ReplayConfig, parts: PipelineParts) -> Result<Self> {
        config.validate()?;

        let controls = Arc::new(PipelineControls::new());
        controls.set_state(PipelineState::Starting);

        let fps = config.clamped_fps();
        let window_secs = config.duration_secs;
        let min_frames_for_save = fps as usize;

        let PipelineParts {
            frame_source,
            converter,
            mut video_encoder,
            mut audio,
            muxer,
            start_time,
        } = parts;

        let crop = frame_source.region();
        let byte_ceiling =
            2 * utils::estimate_buffer_bytes(crop.width, crop.height, fps, window_secs).max(
                64 * 1024 * 1024,
            );
        let video_store = Arc::new(Mutex::new(VideoSampleStore::new(
            window_secs,
            fps,
            byte_ceiling,
        )));
        if let Some(header) = video_encoder.sequence_header() {
            video_store.lock().unwrap().set_sequence_header(header);
        }
        video_encoder.set_sink(Box::new(VideoStoreSink {
            store: Arc::clone(&video_store),
            controls: Arc::clone(&controls),
        }))?;

        let audio_store = match audio {
            Some(ref mut parts) => {
                let store = Arc::new(Mutex::new(AudioSampleStore::new(window_secs)));
                if let Some(config_bytes) = parts.encoder.codec_config_header() {
                    store.lock().unwrap().set_codec_config(config_bytes);
                }
                parts.encoder.set_sink(Box::new(AudioStoreSink {
                    store: Arc::clone(&store),
                }));
                parts.mixer.start()?;
                Some(store)
            }
            None => None,
        };

        let (cmd_tx, cmd_rx) = bounded::<Command>(4);

        let worker = CaptureWorker {
            source: frame_source,
            converter,
            encoder: video_encoder,
            audio,
            muxer,
            video_store: Arc::clone(&video_store),
            audio_store: audio_store.clone(),
            controls: Arc::clone(&controls),
            cmd_rx,
            start_time,
            fps,
            quality: config.quality,
            min_frames_for_save,
        };

        let capture_thread = std::thread::Builder::new()
            .name("replay-capture".into())
            .spawn(move || worker.run())
            .map_err(|e| {
                controls.set_state(PipelineState::Error);
                ReplayError::Fatal(format!("could not spawn capture thread: {e}"))
            })?;

        controls.set_state(PipelineState::Capturing);
        log::info!(
            "replay pipeline capturing: {}s window at {} fps",
            window_secs,
            fps
        );

        Ok(Self {
            controls,
            cmd_tx,
            capture_thread: Mutex::new(Some(capture_thread)),
            video_store,
            audio_store,
            window_secs,
            min_frames_for_save,
        })
    }

    /// Write the current replay window to `path`.
    ///
    /// Runs on the capture thread; this call blocks until the mux
    /// finishes or the 30-second deadline passes. Rejected unless the
    /// pipeline is capturing and the buffer holds at least one second's
    /// worth of frames.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if self.controls.state() != PipelineState::Capturing {
            return Err(ReplayError::Validation(format!(
                "cannot save in state {:?}",
                self.controls.state()
            )));
        }
        let have = self.video_store.lock().unwrap().len();
        if have < self.min_frames_for_save {
            return Err(ReplayError::SaveTooEarly {
                have,
                need: self.min_frames_for_save,
            });
        }

        let (done_tx, done_rx) = bounded(1);
        self.cmd_tx
            .send(Command::Save {
                path: path.as_ref().to_path_buf(),
                done: done_tx,
            })
            .map_err(|_| ReplayError::Fatal("capture thread is gone".into()))?;

        match done_rx.recv_timeout(SAVE_DEADLINE) {
            Ok(result) => result,
            Err(_) => Err(ReplayError::SaveTimeout),
        }
    }

    /// Stop capturing. Any save in flight completes first; returns once
    /// every pipeline thread has been joined and components are dropped.
    pub fn stop(&self) -> Result<()> {
        let state = self.controls.state();
        if matches!(state, PipelineState::Stopped | PipelineState::Stopping) {
            return Ok(());
        }
        if state != PipelineState::Error {
            self.controls.set_state(PipelineState::Stopping);
        }
        self.controls.stop();

        let handle = self.capture_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("capture thread exited with error: {e}");
                    self.controls.set_state(PipelineState::Error);
                    return Err(e);
                }
                Err(_) => {
                    self.controls.set_state(PipelineState::Error);
                    return Err(ReplayError::Fatal("capture thread panicked".into()));
                }
            }
        }

        self.controls.transition(PipelineState::Stopping, PipelineState::Stopped);
        log::info!("replay pipeline stopped");
        Ok(())
    }

    pub fn status(&self) -> PipelineStatus {
        let video = self.video_store.lock().unwrap();
        let audio_bytes = self
            .audio_store
            .as_ref()
            .map(|s| s.lock().unwrap().bytes())
            .unwrap_or(0);
        PipelineStatus {
            state: self.controls.state(),
            window_secs: self.window_secs,
            memory_bytes: video.bytes() + audio_bytes,
            frames_buffered: video.len(),
            frames_submitted: self.controls.frames_submitted.load(Ordering::Relaxed),
            frames_dropped: self.controls.frames_dropped.load(Ordering::Relaxed),
        }
    }

    /// Shared view of the pipeline's state machine and health counters.
    pub fn controls(&self) -> Arc<PipelineControls> {
        Arc::clone(&self.controls)
    }
}

impl Drop for ReplayPipeline {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Everything the capture thread owns for the life of the pipeline.
struct CaptureWorker {
    source: Box<dyn FrameSource>,
    converter: Box<dyn ColorConverter>,
    encoder: Box<dyn VideoEncoder>,
    audio: Option<AudioParts>,
    muxer: Box<dyn Muxer>,
    video_store: Arc<Mutex<VideoSampleStore>>,
    audio_store: Option<Arc<Mutex<AudioSampleStore>>>,
    controls: Arc<PipelineControls>,
    cmd_rx: Receiver<Command>,
    start_time: Instant,
    fps: u32,
    quality: QualityPreset,
    min_frames_for_save: usize,
}

impl CaptureWorker {
    fn run(mut self) -> Result<()> {
        let result = self.pacing_loop();
        if let Err(ref e) = result {
            log::error!("capture loop failed: {e}");
            self.controls.set_state(PipelineState::Error);
            self.controls.stop();
        }
        self.teardown();
        result
    }

    /// The pacing loop: wait briefly for commands, feed audio, and
    /// acquire/convert/submit one frame whenever the frame clock is due.
    fn pacing_loop(&mut self) -> Result<()> {
        let frame_interval = Duration::from_nanos(1_000_000_000 / self.fps as u64);
        let mut next_frame_due = Instant::now();
        let mut last_health_log = Instant::now();

        loop {
            match self.cmd_rx.recv_timeout(COMMAND_WAIT) {
                Ok(Command::Save { path, done }) => {
                    let result = self.handle_save(&path);
                    if let Err(ref e) = result {
                        log::warn!("save to {} failed: {e}", path.display());
                    }
                    let _ = done.send(result);
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if self.controls.is_stopped() {
                break;
            }

            self.pump_audio()?;

            let now = Instant::now();
            if now >= next_frame_due {
                next_frame_due += frame_interval;
                if now.saturating_duration_since(next_frame_due) > 2 * frame_interval {
                    // Far behind: restart the cadence instead of bursting
                    // to catch up.
                    next_frame_due = now;
                }
                self.capture_one_frame()?;
            }

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                last_health_log = Instant::now();
                log::debug!(
                    "replay health: submitted={} dropped={} acquire_misses={} convert_misses={}",
                    self.controls.frames_submitted.load(Ordering::Relaxed),
                    self.controls.frames_dropped.load(Ordering::Relaxed),
                    self.controls.acquire_misses.load(Ordering::Relaxed),
                    self.controls.convert_misses.load(Ordering::Relaxed),
                );
            }
        }
        Ok(())
    }

    fn pump_audio(&mut self) -> Result<()> {
        let Some(ref mut audio) = self.audio else {
            return Ok(());
        };
        let bytes = audio.mixer.read(MIX_READ_CHUNK);
        if bytes.is_empty() {
            return Ok(());
        }
        // Anchor the batch at the capture time of its oldest byte.
        let span_ticks = bytes.len() as u64 * TICKS_PER_SECOND / CANONICAL_BYTE_RATE;
        let origin_ts = (ticks_since(self.start_time) - span_ticks as i64).max(1);
        audio.encoder.feed(&bytes, origin_ts)
    }

    fn capture_one_frame(&mut self) -> Result<()> {
        let raw = match self.source.acquire_latest()? {
            Some(frame) => frame,
            None => {
                self.controls.acquire_misses.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        let texture = match self.converter.convert(&raw) {
            Ok(Some(texture)) => texture,
            Ok(None) => {
                self.controls.convert_misses.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // Scheduling and stream timestamps both come from the pacing
        // clock; the compositor's clock never reaches the encoded stream.
        let pts = ticks_since(self.start_time);
        match self.encoder.submit(texture, pts) {
            Ok(()) => Ok(()),
            Err(ReplayError::Backpressure) => {
                self.controls.frames_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn handle_save(&mut self, path: &Path) -> Result<()> {
        let have = self.video_store.lock().unwrap().len();
        if have < self.min_frames_for_save {
            return Err(ReplayError::SaveTooEarly {
                have,
                need: self.min_frames_for_save,
            });
        }
        if !self
            .controls
            .transition(PipelineState::Capturing, PipelineState::Saving)
        {
            return Err(ReplayError::Validation(format!(
                "cannot save in state {:?}",
                self.controls.state()
            )));
        }
        self.controls.saving_flag.store(true, Ordering::Release);
        log::info!("saving replay window to {}", path.display());

        let result = self.mux_snapshot(path);

        self.controls.saving_flag.store(false, Ordering::Release);
        self.controls
            .transition(PipelineState::Saving, PipelineState::Capturing);
        if result.is_ok() {
            log::info!("replay saved to {}", path.display());
        }
        result
    }

    fn mux_snapshot(&mut self, path: &Path) -> Result<()> {
        let (video_snapshot, sequence_header) = {
            let store = self.video_store.lock().unwrap();
            (
                store.snapshot(),
                store.sequence_header().map(|h| h.to_vec()).unwrap_or_default(),
            )
        };
        let crop = self.source.region();
        let video_params = VideoTrackParams {
            width: crop.width,
            height: crop.height,
            fps: self.fps,
            quality: self.quality,
            sequence_header,
        };

        let audio_data = self.audio_store.as_ref().map(|store| {
            let store = store.lock().unwrap();
            let params = AudioTrackParams {
                sample_rate: utils::CANONICAL_SAMPLE_RATE,
                channels: utils::CANONICAL_CHANNELS,
                bitrate: encoders::aac_encoder::AUDIO_BITRATE as u64,
                codec_config: store.codec_config().map(|c| c.to_vec()).unwrap_or_default(),
            };
            (store.snapshot(), params)
        });

        match audio_data {
            Some((ref frames, ref params)) if !frames.is_empty() => {
                self.muxer
                    .write(path, &video_snapshot, &video_params, Some((frames, params)))
            }
            _ => self.muxer.write(path, &video_snapshot, &video_params, None),
        }
    }

    /// Flush and release every component; called exactly once, on the
    /// capture thread, after the loop exits.
    fn teardown(&mut self) {
        if let Err(e) = self.encoder.flush() {
            log::error!("error flushing video encoder: {e}");
        }
        if let Err(e) = self.encoder.destroy() {
            log::error!("error destroying video encoder: {e}");
        }
        if let Some(ref mut audio) = self.audio {
            if let Err(e) = audio.encoder.flush() {
                log::error!("error flushing audio encoder: {e}");
            }
            audio.mixer.stop();
        }
        self.source.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_transitions_only_fire_from_the_expected_state() {
        let controls = PipelineControls::new();
        controls.set_state(PipelineState::Capturing);

        assert!(controls.transition(PipelineState::Capturing, PipelineState::Saving));
        assert_eq!(controls.state(), PipelineState::Saving);

        // A stop that lands mid-save wins over the save's return path.
        controls.set_state(PipelineState::Stopping);
        assert!(!controls.transition(PipelineState::Saving, PipelineState::Capturing));
        assert_eq!(controls.state(), PipelineState::Stopping);
    }

    #[test]
    fn stop_event_is_sticky() {
        let controls = PipelineControls::new();
        assert!(!controls.is_stopped());
        controls.stop();
        controls.stop();
        assert!(controls.is_stopped());
    }
}
