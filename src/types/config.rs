use crate::types::error::{ReplayError, Result};

/// Maximum number of simultaneously mixed audio sources.
pub const MAX_AUDIO_SOURCES: usize = 3;

/// An axis-aligned capture rectangle in monitor coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// True when `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x.saturating_add(other.width as i32)
                <= self.x.saturating_add(self.width as i32)
            && other.y.saturating_add(other.height as i32)
                <= self.y.saturating_add(self.height as i32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityPreset {
    Low,
    Medium,
    High,
    Lossless,
}

/// What the replay buffer records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    /// A single monitor, by index into the compositor's output list
    Monitor(u32),
    /// The union of all monitors
    AllMonitors,
    /// A single window, by compositor handle
    Window(u64),
    /// A fixed rectangle in desktop coordinates
    Region(Rect),
}

/// Aspect ratios the capture rect can be cropped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatio {
    Native,
    R16x9,
    R9x16,
    R1x1,
    R4x5,
    R16x10,
    R4x3,
    R21x9,
    R32x9,
}

impl AspectRatio {
    /// Ratio as (width, height) units, or `None` for native.
    pub fn units(&self) -> Option<(u32, u32)> {
        match self {
            AspectRatio::Native => None,
            AspectRatio::R16x9 => Some((16, 9)),
            AspectRatio::R9x16 => Some((9, 16)),
            AspectRatio::R1x1 => Some((1, 1)),
            AspectRatio::R4x5 => Some((4, 5)),
            AspectRatio::R16x10 => Some((16, 10)),
            AspectRatio::R4x3 => Some((4, 3)),
            AspectRatio::R21x9 => Some((21, 9)),
            AspectRatio::R32x9 => Some((32, 9)),
        }
    }
}

/// One capture device feeding the mixer.
#[derive(Debug, Clone)]
pub struct AudioSourceConfig {
    /// PipeWire node id of the device, or `None` for the default
    pub device_id: Option<u32>,
    /// Capture what the device is playing rather than recording
    pub loopback: bool,
    /// Mix volume, 0-100
    pub volume: u32,
}

/// Replay pipeline configuration, as handed over by the config loader.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub enabled: bool,
    /// Length of the rolling window, in seconds (>= 1)
    pub duration_secs: u32,
    pub capture_source: CaptureSource,
    pub monitor_index: u32,
    pub aspect_ratio: AspectRatio,
    /// Saved capture rect; preferred over the aspect crop when valid
    pub area_rect: Option<Rect>,
    /// Target frame rate; clamped to [30, 120]
    pub fps: u32,
    pub quality: QualityPreset,
    pub audio_enabled: bool,
    pub audio_sources: Vec<AudioSourceConfig>,
    pub show_cursor: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            duration_secs: 30,
            capture_source: CaptureSource::Monitor(0),
            monitor_index: 0,
            aspect_ratio: AspectRatio::Native,
            area_rect: None,
            fps: 60,
            quality: QualityPreset::Medium,
            audio_enabled: false,
            audio_sources: Vec::new(),
            show_cursor: true,
        }
    }
}

impl ReplayConfig {
    /// Reject configurations no pipeline could run with. Called before any
    /// device is opened.
    pub fn validate(&self) -> Result<()> {
        if self.duration_secs < 1 {
            return Err(ReplayError::Config(
                "replay duration must be at least one second".into(),
            ));
        }
        if self.audio_sources.len() > MAX_AUDIO_SOURCES {
            return Err(ReplayError::Config(format!(
                "at most {MAX_AUDIO_SOURCES} audio sources are supported, got {}",
                self.audio_sources.len()
            )));
        }
        for src in &self.audio_sources {
            if src.volume > 100 {
                return Err(ReplayError::Config(format!(
                    "audio volume must be 0-100, got {}",
                    src.volume
                )));
            }
        }
        if let CaptureSource::Region(rect) = self.capture_source {
            if rect.is_empty() {
                return Err(ReplayError::Config("capture region is empty".into()));
            }
        }
        Ok(())
    }

    /// Target fps with the supported range applied.
    pub fn clamped_fps(&self) -> u32 {
        self.fps.clamp(30, 120)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ReplayConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_duration_rejected() {
        let cfg = ReplayConfig {
            duration_secs: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ReplayError::Config(_))));
    }

    #[test]
    fn too_many_sources_rejected() {
        let src = AudioSourceConfig {
            device_id: None,
            loopback: false,
            volume: 100,
        };
        let cfg = ReplayConfig {
            audio_sources: vec![src.clone(), src.clone(), src.clone(), src],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fps_clamped_to_supported_range() {
        let cfg = ReplayConfig {
            fps: 240,
            ..Default::default()
        };
        assert_eq!(cfg.clamped_fps(), 120);
        let cfg = ReplayConfig {
            fps: 10,
            ..Default::default()
        };
        assert_eq!(cfg.clamped_fps(), 30);
    }
}
