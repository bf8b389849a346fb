//! Video4Linux2 backend for camcap.
//!
//! Cameras are the `/dev/video*` nodes which can capture video. Frames are
//! read through memory mapped driver buffers and copied into the buffer of
//! the oldest queued [Request].

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use v4l::capability::Flags;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::{FourCC, Format, buffer::Type};

use camcap::{
    AcquireFailure, BufferCountBounds, CameraDevice, CameraModule, ConfigStatus, DeviceDescriptor,
    Error, FrameMetadata, PixelFormat, QueueError, Request, Result, Size, StreamConfiguration,
    StreamRole, SupportedFormat, negotiate,
};

mod video;

pub use video::V4lVideoCapture;

const BUFFER_BOUNDS: BufferCountBounds = BufferCountBounds { min: 2, max: 32 };
const DEFAULT_BUFFER_COUNT: u32 = 4;

/// Sizes offered for drivers which report a stepwise or continuous range.
const STEPWISE_CANDIDATES: &[Size] = &[
    Size::new(320, 240),
    Size::new(640, 480),
    Size::new(800, 600),
    Size::new(1280, 720),
    Size::new(1280, 960),
    Size::new(1600, 900),
    Size::new(1920, 1080),
    Size::new(2592, 1944),
    Size::new(3840, 2160),
];

fn to_fourcc(pixel_format: PixelFormat) -> FourCC {
    FourCC::new(&pixel_format.fourcc())
}

fn from_fourcc(fourcc: FourCC) -> PixelFormat {
    PixelFormat::from_fourcc(fourcc.repr)
}

/// The V4L2 code for the same memory layout, if the names differ.
///
/// DRM `BGR888` is stored R, G, B, which V4L2 calls `RGB3`.
fn v4l_equivalent(pixel_format: PixelFormat) -> PixelFormat {
    if pixel_format == PixelFormat::BGR888 {
        PixelFormat::from_fourcc(*b"RGB3")
    } else if pixel_format == PixelFormat::RGB888 {
        PixelFormat::from_fourcc(*b"BGR3")
    } else {
        pixel_format
    }
}

fn frame_sizes(dev: &Device, fourcc: FourCC) -> Result<Vec<Size>> {
    let mut sizes = Vec::new();
    for framesize in dev.enum_framesizes(fourcc)? {
        match framesize.size {
            FrameSizeEnum::Discrete(d) => sizes.push(Size::new(d.width, d.height)),
            FrameSizeEnum::Stepwise(s) => {
                let fits = |v: u32, min: u32, max: u32, step: u32| {
                    v >= min && v <= max && (step == 0 || (v - min) % step == 0)
                };
                sizes.extend(STEPWISE_CANDIDATES.iter().copied().filter(|c| {
                    fits(c.width, s.min_width, s.max_width, s.step_width)
                        && fits(c.height, s.min_height, s.max_height, s.step_height)
                }));
                sizes.push(Size::new(s.max_width, s.max_height));
            }
        }
    }
    sizes.sort_by_key(|s| (s.area(), s.width));
    sizes.dedup();
    Ok(sizes)
}

fn supported_formats(dev: &Device) -> Result<Vec<SupportedFormat>> {
    let mut formats = Vec::new();
    for description in dev.enum_formats()? {
        let sizes = frame_sizes(dev, description.fourcc)?;
        if sizes.is_empty() {
            continue;
        }
        formats.push(SupportedFormat {
            pixel_format: from_fourcc(description.fourcc),
            sizes,
        });
    }
    Ok(formats)
}

// ---------------------------
// V4lModule

/// Cameras reachable through Video4Linux2.
///
/// The kernel lets several processes open a node. Acquisition is therefore
/// only exclusive between sessions created from clones of one module.
#[derive(Clone, Default)]
pub struct V4lModule {
    acquired: Arc<Mutex<HashSet<String>>>,
}

impl V4lModule {
    pub fn new() -> Self {
        Self::default()
    }
}

fn describe(path: &std::path::Path) -> Option<DeviceDescriptor> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        return None;
    }
    Some(DeviceDescriptor {
        id: path.display().to_string(),
        model: caps.card,
        location: Some(caps.bus),
    })
}

impl CameraModule for V4lModule {
    type Device = V4lCamera;

    fn name(&self) -> &str {
        "v4l"
    }

    fn cameras(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut nodes = v4l::context::enum_devices();
        nodes.sort_by_key(|n| n.index());
        Ok(nodes.iter().filter_map(|n| describe(n.path())).collect())
    }

    fn acquire(&self, id: &str) -> Result<V4lCamera> {
        let descriptor = describe(std::path::Path::new(id)).ok_or_else(|| Error::AcquireFailed {
            id: id.to_string(),
            reason: AcquireFailure::NotFound,
        })?;
        if !self.acquired.lock().insert(id.to_string()) {
            return Err(Error::AcquireFailed {
                id: id.to_string(),
                reason: AcquireFailure::AlreadyInUse,
            });
        }
        let opened = Device::with_path(id)
            .with_context(|| format!("opening {id}"))
            .map_err(Error::from)
            .and_then(|dev| {
                let formats = supported_formats(&dev)?;
                Ok((dev, formats))
            });
        match opened {
            Ok((dev, formats)) => {
                info!("opened {id} ({}) with {} formats", descriptor.model, formats.len());
                Ok(V4lCamera {
                    dev,
                    descriptor,
                    formats,
                    acquired: self.acquired.clone(),
                    released: false,
                    config: None,
                    buffer_count: 0,
                    stream: None,
                    running: false,
                    pending: VecDeque::new(),
                })
            }
            Err(e) => {
                self.acquired.lock().remove(id);
                Err(e)
            }
        }
    }
}

// ---------------------------
// V4lCamera

/// An acquired V4L2 capture node.
pub struct V4lCamera {
    dev: Device,
    descriptor: DeviceDescriptor,
    formats: Vec<SupportedFormat>,
    acquired: Arc<Mutex<HashSet<String>>>,
    released: bool,
    config: Option<StreamConfiguration>,
    buffer_count: u32,
    stream: Option<MmapStream<'static>>,
    running: bool,
    pending: VecDeque<Request>,
}

fn backend_err(msg: &str) -> Error {
    Error::from(anyhow::anyhow!("v4l: {msg}"))
}

impl V4lCamera {
    fn release_lock(&mut self) {
        if !self.released {
            self.acquired.lock().remove(&self.descriptor.id);
            self.released = true;
        }
    }

    fn role_default(&self, role: StreamRole) -> Option<(PixelFormat, Size)> {
        // Raw wants the largest uncompressed frames, everything else the
        // driver's first format.
        let format = match role {
            StreamRole::Raw => self
                .formats
                .iter()
                .find(|f| f.pixel_format.layout() != camcap::Layout::Compressed)
                .or_else(|| self.formats.first()),
            _ => self.formats.first(),
        }?;
        let size = match role {
            StreamRole::Viewfinder => negotiate::nearest_size(&format.sizes, Size::new(640, 480)),
            StreamRole::VideoRecording => {
                negotiate::nearest_size(&format.sizes, Size::new(1280, 720))
            }
            StreamRole::StillCapture | StreamRole::Raw => {
                format.sizes.iter().copied().max_by_key(|s| s.area())
            }
        }?;
        Some((format.pixel_format, size))
    }
}

impl CameraDevice for V4lCamera {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn generate_configuration(&self, role: StreamRole) -> Result<StreamConfiguration> {
        let (pixel_format, size) = self.role_default(role).ok_or_else(|| {
            Error::ConfigurationUnsupported(format!(
                "{} offers no capture formats",
                self.descriptor.id
            ))
        })?;
        let mut config = StreamConfiguration {
            role,
            size,
            pixel_format,
            stride: 0,
            frame_size: 0,
            buffer_count: DEFAULT_BUFFER_COUNT,
            buffer_bounds: BUFFER_BOUNDS,
            formats: self.formats.clone(),
        };
        config.update_geometry();
        Ok(config)
    }

    fn validate(&self, config: &mut StreamConfiguration) -> ConfigStatus {
        config.formats = self.formats.clone();
        config.buffer_bounds = BUFFER_BOUNDS;
        let mapped = v4l_equivalent(config.pixel_format);
        let renamed = mapped != config.pixel_format
            && config.formats.iter().any(|f| f.pixel_format == mapped);
        if renamed {
            debug!("{} is called {} by V4L2", config.pixel_format, mapped);
            config.pixel_format = mapped;
        }
        match negotiate::adjust_to_supported(config) {
            ConfigStatus::Valid if renamed => ConfigStatus::Adjusted,
            status => status,
        }
    }

    fn configure(&mut self, config: &StreamConfiguration) -> Result<()> {
        if self.stream.is_some() {
            return Err(backend_err("cannot configure while buffers are allocated"));
        }
        let wanted = Format::new(
            config.size.width,
            config.size.height,
            to_fourcc(config.pixel_format),
        );
        let actual = self
            .dev
            .set_format(&wanted)
            .with_context(|| format!("setting format {config} on {}", self.descriptor.id))?;
        if actual.width != wanted.width
            || actual.height != wanted.height
            || actual.fourcc != wanted.fourcc
        {
            return Err(Error::ConfigurationUnsupported(format!(
                "{} set {}x{}-{} instead of {config}",
                self.descriptor.id, actual.width, actual.height, actual.fourcc
            )));
        }
        if actual.stride != config.stride {
            warn!(
                "driver uses stride {} instead of {}, lines may be cut",
                actual.stride, config.stride
            );
        }
        self.config = Some(config.clone());
        Ok(())
    }

    fn allocate_buffers(&mut self) -> Result<u32> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| backend_err("not configured"))?;
        let stream = MmapStream::with_buffers(&self.dev, Type::VideoCapture, config.buffer_count)
            .context("mapping capture buffers")?;
        self.buffer_count = config.buffer_count;
        self.stream = Some(stream);
        Ok(self.buffer_count)
    }

    fn free_buffers(&mut self) -> Result<()> {
        if self.running {
            return Err(backend_err("cannot free buffers while running"));
        }
        self.stream = None;
        self.buffer_count = 0;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.stream.is_none() {
            return Err(backend_err("no buffers allocated"));
        }
        // Streaming starts with the first dequeue.
        self.running = true;
        Ok(())
    }

    fn queue_request(&mut self, request: Request) -> std::result::Result<(), QueueError> {
        let error = if !self.running {
            Some(backend_err("not started"))
        } else if self.pending.len() >= self.buffer_count as usize {
            Some(backend_err("pipeline full"))
        } else {
            None
        };
        match error {
            Some(error) => Err(QueueError { request, error }),
            None => {
                self.pending.push_back(request);
                Ok(())
            }
        }
    }

    fn process_events(&mut self, timeout: Duration) -> Result<Vec<Request>> {
        let (true, Some(stream)) = (self.running && !self.pending.is_empty(), self.stream.as_mut())
        else {
            std::thread::sleep(timeout);
            return Ok(Vec::new());
        };
        stream.set_timeout(timeout);
        let (data, meta) = match CaptureStream::next(stream) {
            Ok(frame) => frame,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(Vec::new()),
            Err(e) => return Err(Error::FrameRetrievalFailed(e.to_string())),
        };
        let Some(mut request) = self.pending.pop_front() else {
            return Ok(Vec::new());
        };
        let dst = request.buffer_mut().data_mut();
        let used = (meta.bytesused as usize).min(data.len()).min(dst.len());
        dst[..used].copy_from_slice(&data[..used]);
        let timestamp = Duration::from_secs(meta.timestamp.sec.max(0) as u64)
            + Duration::from_micros(meta.timestamp.usec.max(0) as u64);
        request.complete(FrameMetadata {
            sequence: meta.sequence,
            bytes_used: used,
            timestamp,
        });
        Ok(vec![request])
    }

    fn stop(&mut self) -> Result<Vec<Request>> {
        self.running = false;
        // Dropping the stream turns streaming off and unmaps the buffers.
        self.stream = None;
        self.buffer_count = 0;
        let cancelled = self
            .pending
            .drain(..)
            .map(|mut request| {
                request.cancel();
                request
            })
            .collect();
        Ok(cancelled)
    }

    fn release(&mut self) -> Result<()> {
        self.running = false;
        self.stream = None;
        self.release_lock();
        debug!("{} released", self.descriptor.id);
        Ok(())
    }
}

impl Drop for V4lCamera {
    fn drop(&mut self) {
        self.release_lock();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn drm_names_map_to_v4l_layouts() {
        let rgb3 = v4l_equivalent(PixelFormat::BGR888);
        assert_eq!(&rgb3.fourcc(), b"RGB3");
        assert_eq!(rgb3.channel_order(), PixelFormat::BGR888.channel_order());
        let bgr3 = v4l_equivalent(PixelFormat::RGB888);
        assert_eq!(bgr3.channel_order(), PixelFormat::RGB888.channel_order());
        assert_eq!(v4l_equivalent(PixelFormat::YUYV), PixelFormat::YUYV);
    }

    #[test]
    fn fourcc_conversion() {
        let fourcc = to_fourcc(PixelFormat::MJPEG);
        assert_eq!(&fourcc.repr, b"MJPG");
        assert_eq!(from_fourcc(fourcc), PixelFormat::MJPEG);
    }
}
