//! Core types for stream negotiation and capture requests in camcap.
//!
//! These are plain data types shared by the capture client and the camera
//! backends. They carry no behavior that depends on a particular camera
//! stack.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use machine_vision_formats as formats;

pub use formats::PixFmt;

// ---------------------------
// DeviceDescriptor

/// Identifies one camera available from a camera module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Unique, stable identifier used to acquire the camera.
    pub id: String,
    /// Human readable model name.
    pub model: String,
    /// Physical location, if reported by the backend (e.g. "front").
    pub location: Option<String>,
}

impl std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.id, self.model)?;
        if let Some(location) = &self.location {
            write!(f, " @ {location}")?;
        }
        Ok(())
    }
}

// ---------------------------
// StreamRole

/// Intended usage of a stream, used to pick a default configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StreamRole {
    /// Unprocessed sensor data.
    Raw,
    /// High resolution still images.
    StillCapture,
    /// Frames for encoding to a video file.
    VideoRecording,
    /// Low latency frames for live preview.
    #[default]
    Viewfinder,
}

// use Debug to impl Display
impl std::fmt::Display for StreamRole {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        std::fmt::Debug::fmt(self, fmt)
    }
}

impl StreamRole {
    pub fn variants() -> Vec<Self> {
        vec![
            StreamRole::Raw,
            StreamRole::StillCapture,
            StreamRole::VideoRecording,
            StreamRole::Viewfinder,
        ]
    }
}

impl std::str::FromStr for StreamRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StreamRole::variants()
            .into_iter()
            .find(|role| role.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown stream role \"{s}\""))
    }
}

// ---------------------------
// Size

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Distance used to find the closest supported size.
    pub fn distance(&self, other: &Size) -> u64 {
        let dw = (self.width as i64 - other.width as i64).unsigned_abs();
        let dh = (self.height as i64 - other.height as i64).unsigned_abs();
        dw + dh
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl std::str::FromStr for Size {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got \"{s}\""))?;
        let width = w.trim().parse().map_err(|e| format!("bad width: {e}"))?;
        let height = h.trim().parse().map_err(|e| format!("bad height: {e}"))?;
        Ok(Size { width, height })
    }
}

// ---------------------------
// PixelFormat

/// How the bytes of a pixel format are laid out in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Single plane with a fixed number of bytes per pixel.
    Packed { bytes_per_pixel: u32 },
    /// Full resolution luma plane followed by 2x2 subsampled chroma.
    Planar420,
    /// Variable length compressed data.
    Compressed,
    /// A fourcc this crate does not know.
    Unknown,
}

/// Order of the color channels of a packed format, as stored in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Gray,
    Rgb,
    Bgr,
    Rgbx,
    Bgrx,
}

/// A pixel format identified by its four character code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PixelFormat {
    fourcc: [u8; 4],
}

struct KnownFormat {
    name: &'static str,
    fourcc: &'static [u8; 4],
    layout: Layout,
    order: Option<ChannelOrder>,
}

// Names follow the DRM convention, which lists components from the most
// significant bit of a little-endian word. BGR888 is stored R, G, B.
const KNOWN_FORMATS: &[KnownFormat] = &[
    KnownFormat {
        name: "RGB888",
        fourcc: b"RG24",
        layout: Layout::Packed { bytes_per_pixel: 3 },
        order: Some(ChannelOrder::Bgr),
    },
    KnownFormat {
        name: "BGR888",
        fourcc: b"BG24",
        layout: Layout::Packed { bytes_per_pixel: 3 },
        order: Some(ChannelOrder::Rgb),
    },
    KnownFormat {
        name: "XRGB8888",
        fourcc: b"XR24",
        layout: Layout::Packed { bytes_per_pixel: 4 },
        order: Some(ChannelOrder::Bgrx),
    },
    KnownFormat {
        name: "XBGR8888",
        fourcc: b"XB24",
        layout: Layout::Packed { bytes_per_pixel: 4 },
        order: Some(ChannelOrder::Rgbx),
    },
    // V4L2 names, stored in the order they read.
    KnownFormat {
        name: "BGR3",
        fourcc: b"BGR3",
        layout: Layout::Packed { bytes_per_pixel: 3 },
        order: Some(ChannelOrder::Bgr),
    },
    KnownFormat {
        name: "RGB3",
        fourcc: b"RGB3",
        layout: Layout::Packed { bytes_per_pixel: 3 },
        order: Some(ChannelOrder::Rgb),
    },
    KnownFormat {
        name: "YUYV",
        fourcc: b"YUYV",
        layout: Layout::Packed { bytes_per_pixel: 2 },
        order: None,
    },
    KnownFormat {
        name: "UYVY",
        fourcc: b"UYVY",
        layout: Layout::Packed { bytes_per_pixel: 2 },
        order: None,
    },
    KnownFormat {
        name: "NV12",
        fourcc: b"NV12",
        layout: Layout::Planar420,
        order: None,
    },
    KnownFormat {
        name: "YUV420",
        fourcc: b"YU12",
        layout: Layout::Planar420,
        order: None,
    },
    KnownFormat {
        name: "R8",
        fourcc: b"GREY",
        layout: Layout::Packed { bytes_per_pixel: 1 },
        order: Some(ChannelOrder::Gray),
    },
    KnownFormat {
        name: "MJPEG",
        fourcc: b"MJPG",
        layout: Layout::Compressed,
        order: None,
    },
];

impl PixelFormat {
    pub const BGR888: PixelFormat = PixelFormat::from_fourcc(*b"BG24");
    pub const RGB888: PixelFormat = PixelFormat::from_fourcc(*b"RG24");
    pub const XRGB8888: PixelFormat = PixelFormat::from_fourcc(*b"XR24");
    pub const XBGR8888: PixelFormat = PixelFormat::from_fourcc(*b"XB24");
    pub const YUYV: PixelFormat = PixelFormat::from_fourcc(*b"YUYV");
    pub const UYVY: PixelFormat = PixelFormat::from_fourcc(*b"UYVY");
    pub const NV12: PixelFormat = PixelFormat::from_fourcc(*b"NV12");
    pub const YUV420: PixelFormat = PixelFormat::from_fourcc(*b"YU12");
    pub const R8: PixelFormat = PixelFormat::from_fourcc(*b"GREY");
    pub const MJPEG: PixelFormat = PixelFormat::from_fourcc(*b"MJPG");

    pub const fn from_fourcc(fourcc: [u8; 4]) -> Self {
        Self { fourcc }
    }

    pub fn fourcc(&self) -> [u8; 4] {
        self.fourcc
    }

    /// The fourcc packed into a little-endian `u32`, as used by V4L2 and DRM.
    pub fn fourcc_u32(&self) -> u32 {
        u32::from_le_bytes(self.fourcc)
    }

    fn known(&self) -> Option<&'static KnownFormat> {
        KNOWN_FORMATS.iter().find(|k| *k.fourcc == self.fourcc)
    }

    /// The conventional name, if this is a known format.
    pub fn name(&self) -> Option<&'static str> {
        self.known().map(|k| k.name)
    }

    pub fn layout(&self) -> Layout {
        self.known().map(|k| k.layout).unwrap_or(Layout::Unknown)
    }

    pub fn channel_order(&self) -> Option<ChannelOrder> {
        self.known().and_then(|k| k.order)
    }

    /// Bytes per line for an image `width` pixels wide.
    pub fn stride(&self, width: u32) -> u32 {
        match self.layout() {
            Layout::Packed { bytes_per_pixel } => width * bytes_per_pixel,
            Layout::Planar420 => width,
            Layout::Compressed => 0,
            Layout::Unknown => width * 4,
        }
    }

    /// Number of bytes required to hold one frame of `size`.
    ///
    /// For compressed formats this is an upper bound.
    pub fn frame_size(&self, size: Size) -> usize {
        let (w, h) = (size.width as usize, size.height as usize);
        match self.layout() {
            Layout::Packed { bytes_per_pixel } => w * h * bytes_per_pixel as usize,
            Layout::Planar420 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
            Layout::Compressed => w * h * 2,
            Layout::Unknown => w * h * 4,
        }
    }

    /// The [PixFmt] with exactly the same memory layout, where one exists.
    ///
    /// [PixFmt] has no blue-first or padded variants, so `Bgr`, `Rgbx` and
    /// `Bgrx` formats have no equivalent and must be converted.
    pub fn pixfmt(&self) -> Option<PixFmt> {
        match self.channel_order() {
            Some(ChannelOrder::Gray) => return Some(PixFmt::Mono8),
            Some(ChannelOrder::Rgb) => return Some(PixFmt::RGB8),
            Some(ChannelOrder::Bgr | ChannelOrder::Rgbx | ChannelOrder::Bgrx) => return None,
            None => {}
        }
        match &self.fourcc {
            b"UYVY" => Some(PixFmt::YUV422),
            b"NV12" => Some(PixFmt::NV12),
            _ => None,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = self.name() {
            return f.write_str(name);
        }
        if self.fourcc.iter().all(|c| c.is_ascii_graphic() || *c == b' ') {
            for c in self.fourcc {
                write!(f, "{}", c as char)?;
            }
            Ok(())
        } else {
            write!(f, "0x{:08x}", self.fourcc_u32())
        }
    }
}

impl std::fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PixelFormat({self})")
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(k) = KNOWN_FORMATS.iter().find(|k| k.name.eq_ignore_ascii_case(s)) {
            return Ok(PixelFormat::from_fourcc(*k.fourcc));
        }
        let bytes = s.as_bytes();
        if bytes.len() == 4 && bytes.iter().all(|c| c.is_ascii()) {
            return Ok(PixelFormat::from_fourcc([bytes[0], bytes[1], bytes[2], bytes[3]]));
        }
        Err(format!("unknown pixel format \"{s}\""))
    }
}

impl TryFrom<String> for PixelFormat {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PixelFormat> for String {
    fn from(value: PixelFormat) -> Self {
        value.to_string()
    }
}

// ---------------------------
// StreamConfiguration

/// One pixel format and the frame sizes a device offers for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedFormat {
    pub pixel_format: PixelFormat,
    pub sizes: Vec<Size>,
}

/// Inclusive bounds on the number of buffers for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferCountBounds {
    pub min: u32,
    pub max: u32,
}

impl BufferCountBounds {
    pub fn clamp(&self, count: u32) -> u32 {
        count.clamp(self.min, self.max)
    }
}

/// Configuration of one stream of a camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfiguration {
    pub role: StreamRole,
    pub size: Size,
    pub pixel_format: PixelFormat,
    /// Bytes per line, filled in by validation.
    pub stride: u32,
    /// Bytes per frame, filled in by validation.
    pub frame_size: usize,
    pub buffer_count: u32,
    pub buffer_bounds: BufferCountBounds,
    /// Formats the device can produce for this role, in order of preference.
    pub formats: Vec<SupportedFormat>,
}

impl StreamConfiguration {
    /// Recompute `stride` and `frame_size` from `size` and `pixel_format`.
    pub fn update_geometry(&mut self) {
        self.stride = self.pixel_format.stride(self.size.width);
        self.frame_size = self.pixel_format.frame_size(self.size);
    }

    /// Whether `pixel_format` at `size` appears in the supported formats.
    pub fn is_supported(&self, pixel_format: PixelFormat, size: Size) -> bool {
        self.formats
            .iter()
            .any(|f| f.pixel_format == pixel_format && f.sizes.contains(&size))
    }
}

impl std::fmt::Display for StreamConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.size, self.pixel_format)
    }
}

/// Outcome of validating a [StreamConfiguration].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigStatus {
    /// The configuration was supported as requested.
    Valid,
    /// The configuration was changed to the closest supported one.
    Adjusted,
    /// No supported configuration could be derived.
    Invalid,
}

// ---------------------------
// Requests

/// Status of a capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RequestStatus {
    /// Created or queued, not yet completed.
    #[default]
    Pending,
    /// Completed with image data.
    Complete,
    /// Returned without image data, e.g. because capture stopped.
    Cancelled,
}

/// Metadata the backend reports for a filled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Frame sequence number as counted by the device.
    pub sequence: u32,
    /// Number of bytes of the buffer which contain image data.
    pub bytes_used: usize,
    /// Capture time, relative to the start of the device clock.
    pub timestamp: std::time::Duration,
}

/// Identifier of a per-request capture parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ControlId {
    /// -1.0 (darkest) to 1.0 (brightest), 0.0 is neutral.
    Brightness,
    /// 1.0 is neutral.
    Contrast,
    /// value given in microseconds
    ExposureTime,
    AnalogueGain,
}

/// Capture parameters attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlList {
    values: BTreeMap<ControlId, f64>,
}

impl ControlList {
    pub fn set(&mut self, id: ControlId, value: f64) {
        self.values.insert(id, value);
    }

    pub fn get(&self, id: ControlId) -> Option<f64> {
        self.values.get(&id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ControlId, f64)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pixel_format_names_and_fourccs() {
        let bgr: PixelFormat = "BGR888".parse().unwrap();
        assert_eq!(bgr, PixelFormat::BGR888);
        assert_eq!(bgr.fourcc(), *b"BG24");
        assert_eq!(bgr.to_string(), "BGR888");

        let v4l: PixelFormat = "BGR3".parse().unwrap();
        assert_eq!(v4l.channel_order(), Some(ChannelOrder::Bgr));

        let unknown: PixelFormat = "Y10B".parse().unwrap();
        assert_eq!(unknown.name(), None);
        assert_eq!(unknown.to_string(), "Y10B");
        assert_eq!(unknown.layout(), Layout::Unknown);

        assert!("NOT-A-FORMAT".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn frame_geometry() {
        let size = Size::new(1280, 720);
        assert_eq!(PixelFormat::BGR888.stride(1280), 3840);
        assert_eq!(PixelFormat::BGR888.frame_size(size), 1280 * 720 * 3);
        assert_eq!(PixelFormat::XRGB8888.frame_size(size), 1280 * 720 * 4);
        assert_eq!(PixelFormat::NV12.frame_size(size), 1280 * 720 * 3 / 2);
        assert_eq!(PixelFormat::NV12.frame_size(Size::new(3, 3)), 9 + 2 * 4);
    }

    #[test]
    fn bgr888_is_stored_rgb() {
        assert_eq!(PixelFormat::BGR888.pixfmt(), Some(PixFmt::RGB8));
        assert_eq!(PixelFormat::from_fourcc(*b"RGB3").pixfmt(), Some(PixFmt::RGB8));
        assert_eq!(PixelFormat::R8.pixfmt(), Some(PixFmt::Mono8));
        assert_eq!(PixelFormat::NV12.pixfmt(), Some(PixFmt::NV12));
        // Stored B, G, R: no layout-identical PixFmt.
        assert_eq!(PixelFormat::RGB888.channel_order(), Some(ChannelOrder::Bgr));
        assert_eq!(PixelFormat::RGB888.pixfmt(), None);
        assert_eq!(PixelFormat::from_fourcc(*b"BGR3").pixfmt(), None);
        assert_eq!(PixelFormat::XRGB8888.pixfmt(), None);
    }

    #[test]
    fn size_and_role_parse() {
        assert_eq!("1280x720".parse::<Size>().unwrap(), Size::new(1280, 720));
        assert!("1280".parse::<Size>().is_err());
        assert_eq!(
            "viewfinder".parse::<StreamRole>().unwrap(),
            StreamRole::Viewfinder
        );
        assert_eq!(Size::new(10, 10).distance(&Size::new(7, 14)), 7);
    }

    #[test]
    fn stream_configuration_display_and_serde() {
        let mut cfg = StreamConfiguration {
            role: StreamRole::Viewfinder,
            size: Size::new(640, 480),
            pixel_format: PixelFormat::XRGB8888,
            stride: 0,
            frame_size: 0,
            buffer_count: 4,
            buffer_bounds: BufferCountBounds { min: 1, max: 8 },
            formats: vec![SupportedFormat {
                pixel_format: PixelFormat::XRGB8888,
                sizes: vec![Size::new(640, 480)],
            }],
        };
        cfg.update_geometry();
        assert_eq!(cfg.to_string(), "640x480-XRGB8888");
        assert_eq!(cfg.stride, 2560);
        assert!(cfg.is_supported(PixelFormat::XRGB8888, Size::new(640, 480)));
        assert!(!cfg.is_supported(PixelFormat::BGR888, Size::new(640, 480)));

        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"XRGB8888\""));
        let back: StreamConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn control_list() {
        let mut controls = ControlList::default();
        assert!(controls.is_empty());
        controls.set(ControlId::Brightness, 0.5);
        controls.set(ControlId::Brightness, 0.25);
        assert_eq!(controls.get(ControlId::Brightness), Some(0.25));
        assert_eq!(controls.get(ControlId::Contrast), None);
        assert_eq!(controls.iter().count(), 1);
    }
}
