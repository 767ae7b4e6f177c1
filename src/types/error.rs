use std::error::Error;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum ReplayError {
    /// Errors from FFmpeg
    FFmpeg(ffmpeg_next::Error),
    /// Errors from PipeWire
    PipeWire(String),
    /// Errors from XDG Portal
    Portal(String),
    /// I/O errors
    Io(io::Error),
    /// A required GPU or audio device could not be opened
    DeviceInit(String),
    /// The hardware encoder refused the requested configuration
    EncoderInit(String),
    /// Requested capture rect lies outside every display
    RegionOutOfBounds(String),
    /// Encoder input queue full; caller may retry or drop the frame
    Backpressure,
    /// A GPU conversion or filter operation failed
    GpuOperation(String),
    /// Save requested before the buffer held enough frames
    SaveTooEarly { have: usize, need: usize },
    /// The mux did not complete within the save deadline
    SaveTimeout,
    /// The container writer refused a stream configuration or failed to finalize
    Mux(String),
    /// Unrecoverable condition in a background thread
    Fatal(String),
    /// Configuration errors
    Config(String),
    /// Validation errors
    Validation(String),
    /// Other errors
    Other(String),
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayError::FFmpeg(err) => write!(f, "FFmpeg error: {err}"),
            ReplayError::PipeWire(msg) => write!(f, "PipeWire error: {msg}"),
            ReplayError::Portal(msg) => write!(f, "XDG Portal error: {msg}"),
            ReplayError::Io(err) => write!(f, "I/O error: {err}"),
            ReplayError::DeviceInit(msg) => write!(f, "Device init error: {msg}"),
            ReplayError::EncoderInit(msg) => write!(f, "Encoder init error: {msg}"),
            ReplayError::RegionOutOfBounds(msg) => write!(f, "Region out of bounds: {msg}"),
            ReplayError::Backpressure => write!(f, "Encoder input queue full"),
            ReplayError::GpuOperation(msg) => write!(f, "GPU operation error: {msg}"),
            ReplayError::SaveTooEarly { have, need } => {
                write!(
                    f,
                    "Save requested too early: {have} frames buffered, need {need}"
                )
            }
            ReplayError::SaveTimeout => write!(f, "Save did not complete within the deadline"),
            ReplayError::Mux(msg) => write!(f, "Mux error: {msg}"),
            ReplayError::Fatal(msg) => write!(f, "Fatal pipeline error: {msg}"),
            ReplayError::Config(msg) => write!(f, "Configuration error: {msg}"),
            ReplayError::Validation(msg) => write!(f, "Validation error: {msg}"),
            ReplayError::Other(msg) => write!(f, "Error: {msg}"),
        }
    }
}

impl Error for ReplayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReplayError::FFmpeg(err) => Some(err),
            ReplayError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ffmpeg_next::Error> for ReplayError {
    fn from(err: ffmpeg_next::Error) -> Self {
        ReplayError::FFmpeg(err)
    }
}

impl From<io::Error> for ReplayError {
    fn from(err: io::Error) -> Self {
        ReplayError::Io(err)
    }
}

impl From<pipewire::Error> for ReplayError {
    fn from(err: pipewire::Error) -> Self {
        ReplayError::PipeWire(err.to_string())
    }
}

impl From<portal_screencast_waycap::PortalError> for ReplayError {
    fn from(err: portal_screencast_waycap::PortalError) -> Self {
        ReplayError::Portal(err.to_string())
    }
}

impl From<String> for ReplayError {
    fn from(err: String) -> Self {
        ReplayError::Other(err)
    }
}

impl From<&str> for ReplayError {
    fn from(err: &str) -> Self {
        ReplayError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReplayError>;
