use std::time::Instant;

use portal_screencast_waycap::{CursorMode, ScreenCast, SourceType};

use crate::{
    capture::{audio::AudioSource, mixer::AudioMixer, video::PipewireFrameSource, FrameSource},
    encoders::{aac_encoder::AacEncoder, converter::VaapiConverter, vaapi_encoder::VaapiEncoder},
    mux::Mp4Muxer,
    types::{
        config::{
            AspectRatio, AudioSourceConfig, CaptureSource, QualityPreset, Rect, ReplayConfig,
        },
        error::{ReplayError, Result},
    },
    utils::effective_capture_rect,
    AudioParts, PipelineParts, ReplayPipeline,
};

/// Fluent configuration for a replay pipeline.
///
/// ```no_run
/// use replaycap_rs::pipeline::builder::ReplayBuilder;
/// use replaycap_rs::types::config::QualityPreset;
///
/// # fn main() -> replaycap_rs::types::error::Result<()> {
/// let replay = ReplayBuilder::new()
///     .with_duration_secs(30)
///     .with_fps(60)
///     .with_quality_preset(QualityPreset::High)
///     .with_audio()
///     .build()?;
/// # Ok(()) }
/// ```
pub struct ReplayBuilder {
    config: ReplayConfig,
}

impl Default for ReplayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayBuilder {
    pub fn new() -> Self {
        Self {
            config: ReplayConfig::default(),
        }
    }

    /// Length of the rolling replay window, in seconds.
    pub fn with_duration_secs(mut self, secs: u32) -> Self {
        self.config.duration_secs = secs;
        self
    }

    /// Optional: Set a target FPS for the buffer.
    /// Default: 60fps
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.config.fps = fps;
        self
    }

    pub fn with_quality_preset(mut self, quality: QualityPreset) -> Self {
        self.config.quality = quality;
        self
    }

    pub fn with_capture_source(mut self, source: CaptureSource) -> Self {
        self.config.capture_source = source;
        self
    }

    pub fn with_aspect_ratio(mut self, ratio: AspectRatio) -> Self {
        self.config.aspect_ratio = ratio;
        self
    }

    /// Saved capture rect, preferred over the aspect crop when valid.
    pub fn with_area_rect(mut self, rect: Rect) -> Self {
        self.config.area_rect = Some(rect);
        self
    }

    /// Mix the default loopback device into the replay.
    pub fn with_audio(mut self) -> Self {
        self.config.audio_enabled = true;
        self
    }

    /// Mix a specific device into the replay (up to three).
    pub fn with_audio_source(mut self, source: AudioSourceConfig) -> Self {
        self.config.audio_enabled = true;
        self.config.audio_sources.push(source);
        self
    }

    pub fn with_cursor_shown(mut self) -> Self {
        self.config.show_cursor = true;
        self
    }

    pub fn with_cursor_hidden(mut self) -> Self {
        self.config.show_cursor = false;
        self
    }

    pub fn build(self) -> Result<ReplayPipeline> {
        build_pipeline(&self.config)
    }
}

/// Assemble the PipeWire + VAAPI component set for `config` and launch it.
pub fn build_pipeline(config: &ReplayConfig) -> Result<ReplayPipeline> {
    config.validate()?;
    if !config.enabled {
        return Err(ReplayError::Config("replay buffer is disabled".into()));
    }

    ffmpeg_next::init()?;

    // t=0: the moment just before the first captured frame can arrive.
    let start_time = Instant::now();

    let mut screen_cast = ScreenCast::new()?;
    screen_cast.set_source_types(match config.capture_source {
        CaptureSource::Window(_) => SourceType::WINDOW,
        _ => SourceType::MONITOR,
    });
    screen_cast.set_cursor_mode(if config.show_cursor {
        CursorMode::EMBEDDED
    } else {
        CursorMode::HIDDEN
    });
    let active_cast = screen_cast.start(None)?;

    let mut frame_source = PipewireFrameSource::connect(active_cast, start_time)?;

    // Resolve the capture rect against the negotiated surface.
    let (surface_w, surface_h) = frame_source.capture_size();
    let bounds = Rect::new(0, 0, surface_w, surface_h);
    let saved_rect = match config.capture_source {
        CaptureSource::Region(rect) => Some(rect),
        _ => config.area_rect,
    };
    let crop = effective_capture_rect(bounds, config.aspect_ratio, saved_rect);
    frame_source.set_region(crop)?;

    let fps = config.clamped_fps();
    let video_encoder = VaapiEncoder::create(crop.width, crop.height, fps, config.quality)?;
    let converter = VaapiConverter::new(video_encoder.device(), surface_w, surface_h, crop)?;

    let audio = if config.audio_enabled {
        let source_configs = if config.audio_sources.is_empty() {
            // Nothing configured: record what the machine is playing.
            vec![AudioSourceConfig {
                device_id: None,
                loopback: true,
                volume: 100,
            }]
        } else {
            config.audio_sources.clone()
        };
        let sources = source_configs.iter().map(AudioSource::create).collect();
        Some(AudioParts {
            mixer: AudioMixer::new(sources),
            encoder: Box::new(AacEncoder::new()?),
        })
    } else {
        None
    };

    ReplayPipeline::launch(
        config,
        PipelineParts {
            frame_source: Box::new(frame_source),
            converter: Box::new(converter),
            video_encoder: Box::new(video_encoder),
            audio,
            muxer: Box::new(Mp4Muxer::new()),
            start_time,
        },
    )
}
