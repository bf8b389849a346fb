//! Configuration file for capture sessions.
//!
//! All fields have defaults, so an empty file is a valid configuration. The
//! defaults request a 1280x720 BGR888 viewfinder stream for 3 seconds.

use serde::{Deserialize, Serialize};

use crate::{PixelFormat, Result, Size, StreamRole, video::VideoProperties};

/// The default value for [CaptureSettings::duration_ms].
pub const DEFAULT_DURATION_MS: u64 = 3000;

/// The default value for [CaptureSettings::frame_queue].
pub const DEFAULT_FRAME_QUEUE: usize = 4;

/// Settings of the request-based capture path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CaptureSettings {
    /// Camera id to acquire. The first camera is used if not set.
    pub camera: Option<String>,
    pub role: StreamRole,
    /// Requested width. The role's default is kept if width or height is not
    /// set.
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Requested pixel format, by name (e.g. `BGR888`) or fourcc.
    pub pixel_format: Option<PixelFormat>,
    /// Requested number of buffers. The device default is kept if not set.
    pub buffer_count: Option<u32>,
    /// How long to run the event loop.
    pub duration_ms: u64,
    /// Capacity of the channel between the capture loop and the frame
    /// consumer.
    pub frame_queue: usize,
}

impl CaptureSettings {
    /// The requested size, if both dimensions are set.
    pub fn size(&self) -> Option<Size> {
        match (self.width, self.height) {
            (Some(width), Some(height)) => Some(Size { width, height }),
            _ => None,
        }
    }

    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.duration_ms)
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            camera: None,
            role: StreamRole::Viewfinder,
            width: Some(1280),
            height: Some(720),
            pixel_format: Some(PixelFormat::BGR888),
            buffer_count: None,
            duration_ms: DEFAULT_DURATION_MS,
            frame_queue: DEFAULT_FRAME_QUEUE,
        }
    }
}

/// Settings of the generic video-capture path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VideoSettings {
    /// Index of the video device, e.g. `0` for `/dev/video0`.
    pub device: usize,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub fourcc: PixelFormat,
    /// Stop after this many frames. `0` means no limit.
    pub max_frames: usize,
    pub duration_ms: u64,
}

impl VideoSettings {
    pub fn properties(&self) -> VideoProperties {
        VideoProperties {
            width: self.width,
            height: self.height,
            fps: self.fps,
            fourcc: self.fourcc,
        }
    }
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            device: 0,
            width: 1600,
            height: 900,
            fps: 60,
            fourcc: PixelFormat::from_fourcc(*b"BGR3"),
            max_frames: 0,
            duration_ms: DEFAULT_DURATION_MS,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CamcapConfig {
    pub capture: CaptureSettings,
    pub video: VideoSettings,
}

/// Parse a `.toml` string into a [CamcapConfig].
pub fn parse_config(contents: &str) -> Result<CamcapConfig> {
    Ok(toml::from_str(contents)?)
}

/// Parse a `.toml` file and return a [CamcapConfig] structure.
pub fn parse_config_file<P: AsRef<std::path::Path>>(fname: P) -> Result<CamcapConfig> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    let cfg = parse_config(&contents)?;
    tracing::debug!("read configuration from {}", fname.as_ref().display());
    Ok(cfg)
}
