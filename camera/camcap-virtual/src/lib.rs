//! A virtual camera stack for camcap.
//!
//! [VirtualModule] behaves like a camera library with a fixed set of cameras.
//! Cameras produce synthetic frames at a fixed rate: each line of a frame is
//! filled with `sequence + line`, shifted by the `Brightness` control. No
//! hardware is touched, which makes this backend suitable for tests and for
//! trying out the capture flow.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use camcap::{
    AcquireFailure, BufferCountBounds, CameraDevice, CameraModule, ConfigStatus, ControlId,
    DeviceDescriptor, Error, FrameMetadata, PixelFormat, QueueError, Request, Result, Size,
    StreamConfiguration, StreamRole, SupportedFormat, negotiate,
};

mod video;

pub use video::VirtualVideoCapture;

/// Description of one virtual camera.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualCameraSpec {
    pub id: String,
    pub model: String,
    pub location: Option<String>,
    /// Supported formats, in order of preference.
    pub formats: Vec<SupportedFormat>,
    pub fps: u32,
    pub buffer_bounds: BufferCountBounds,
    pub default_buffer_count: u32,
}

impl VirtualCameraSpec {
    pub fn new(id: &str) -> Self {
        let common = vec![
            Size::new(640, 480),
            Size::new(1280, 720),
            Size::new(1920, 1080),
        ];
        Self {
            id: id.to_string(),
            model: "Virtual Camera".to_string(),
            location: None,
            formats: vec![
                SupportedFormat {
                    pixel_format: PixelFormat::XRGB8888,
                    sizes: common.clone(),
                },
                SupportedFormat {
                    pixel_format: PixelFormat::BGR888,
                    sizes: common.clone(),
                },
                SupportedFormat {
                    pixel_format: PixelFormat::NV12,
                    sizes: common,
                },
                SupportedFormat {
                    pixel_format: PixelFormat::R8,
                    sizes: vec![Size::new(1920, 1080)],
                },
            ],
            fps: 30,
            buffer_bounds: BufferCountBounds { min: 1, max: 16 },
            default_buffer_count: 4,
        }
    }

    pub fn with_formats(mut self, formats: Vec<SupportedFormat>) -> Self {
        self.formats = formats;
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = Some(location.to_string());
        self
    }

    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            id: self.id.clone(),
            model: self.model.clone(),
            location: self.location.clone(),
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    /// Default format and size for a role.
    fn role_default(&self, role: StreamRole) -> Option<(PixelFormat, Size)> {
        let preferred = match role {
            StreamRole::Viewfinder => PixelFormat::XRGB8888,
            StreamRole::StillCapture => PixelFormat::BGR888,
            StreamRole::VideoRecording => PixelFormat::NV12,
            StreamRole::Raw => PixelFormat::R8,
        };
        let format = self
            .formats
            .iter()
            .find(|f| f.pixel_format == preferred)
            .or_else(|| self.formats.first())?;
        let size = match role {
            StreamRole::Viewfinder => format.sizes.iter().copied().min_by_key(|s| s.area()),
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

// ---------------------------
// VirtualModule

/// The virtual camera stack.
#[derive(Clone)]
pub struct VirtualModule {
    cameras: Vec<VirtualCameraSpec>,
    acquired: Arc<Mutex<HashSet<String>>>,
}

impl Default for VirtualModule {
    fn default() -> Self {
        Self::with_cameras(vec![VirtualCameraSpec::new("/base/virtual/camera0")])
    }
}

impl VirtualModule {
    /// A module with a single camera.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cameras(cameras: Vec<VirtualCameraSpec>) -> Self {
        Self {
            cameras,
            acquired: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// A module without cameras.
    pub fn empty() -> Self {
        Self::with_cameras(Vec::new())
    }

    /// Whether the camera `id` is currently acquired by anyone.
    pub fn is_acquired(&self, id: &str) -> bool {
        self.acquired.lock().contains(id)
    }
}

impl CameraModule for VirtualModule {
    type Device = VirtualCamera;

    fn name(&self) -> &str {
        "virtual"
    }

    fn cameras(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.cameras.iter().map(|c| c.descriptor()).collect())
    }

    fn acquire(&self, id: &str) -> Result<VirtualCamera> {
        let spec = self
            .cameras
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::AcquireFailed {
                id: id.to_string(),
                reason: AcquireFailure::NotFound,
            })?;
        {
            let mut acquired = self.acquired.lock();
            if !acquired.insert(id.to_string()) {
                return Err(Error::AcquireFailed {
                    id: id.to_string(),
                    reason: AcquireFailure::AlreadyInUse,
                });
            }
        }
        debug!("virtual camera {id} acquired");
        Ok(VirtualCamera::new(spec.clone(), self.acquired.clone()))
    }
}

// ---------------------------
// VirtualCamera

/// An acquired virtual camera.
pub struct VirtualCamera {
    spec: VirtualCameraSpec,
    descriptor: DeviceDescriptor,
    acquired: Arc<Mutex<HashSet<String>>>,
    released: bool,
    config: Option<StreamConfiguration>,
    reserved: u32,
    running: bool,
    queue: VecDeque<Request>,
    next_due: Option<Instant>,
    sequence: u32,
    epoch: Instant,
}

fn backend_err(msg: &str) -> Error {
    Error::from(anyhow::anyhow!("virtual camera: {msg}"))
}

impl VirtualCamera {
    fn new(spec: VirtualCameraSpec, acquired: Arc<Mutex<HashSet<String>>>) -> Self {
        let descriptor = spec.descriptor();
        Self {
            spec,
            descriptor,
            acquired,
            released: false,
            config: None,
            reserved: 0,
            running: false,
            queue: VecDeque::new(),
            next_due: None,
            sequence: 0,
            epoch: Instant::now(),
        }
    }

    /// Number of requests waiting for a frame.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn fill(&mut self, request: &mut Request) {
        let (stride, frame_size) = match &self.config {
            Some(c) => (c.stride as usize, c.frame_size),
            None => (0, 0),
        };
        let brightness = request.controls().get(ControlId::Brightness).unwrap_or(0.0);
        let offset = (brightness.clamp(-1.0, 1.0) * 127.0) as i8 as u8;
        let base = (self.sequence as u8).wrapping_add(offset);
        let data = request.buffer_mut().data_mut();
        let used = frame_size.min(data.len());
        if stride == 0 {
            data[..used].fill(base);
        } else {
            for (line_no, line) in data[..used].chunks_mut(stride).enumerate() {
                line.fill(base.wrapping_add(line_no as u8));
            }
        }
        request.complete(FrameMetadata {
            sequence: self.sequence,
            bytes_used: used,
            timestamp: self.epoch.elapsed(),
        });
        self.sequence = self.sequence.wrapping_add(1);
    }

    /// Complete queued requests whose frame time has come.
    ///
    /// Frames whose time passed while no request was waiting, or while
    /// nobody dispatched events, are lost and their sequence numbers skipped.
    fn complete_due(&mut self, done: &mut Vec<Request>) {
        let interval = self.spec.frame_interval();
        loop {
            let now = Instant::now();
            let mut due = self.next_due.unwrap_or(now);
            if due > now || self.queue.is_empty() {
                break;
            }
            let missed = ((now - due).as_nanos() / interval.as_nanos()) as u32;
            if missed > 0 {
                trace!("virtual camera missed {missed} frame(s)");
                self.sequence = self.sequence.wrapping_add(missed);
                due += interval * missed;
            }
            let Some(mut request) = self.queue.pop_front() else {
                break;
            };
            self.fill(&mut request);
            trace!("virtual request {} complete", request.id());
            done.push(request);
            self.next_due = Some(due + interval);
        }
    }

    fn release_lock(&mut self) {
        if !self.released {
            self.acquired.lock().remove(&self.descriptor.id);
            self.released = true;
        }
    }
}

impl CameraDevice for VirtualCamera {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn generate_configuration(&self, role: StreamRole) -> Result<StreamConfiguration> {
        let (pixel_format, size) = self.spec.role_default(role).ok_or_else(|| {
            Error::ConfigurationUnsupported(format!("no formats for role {role}"))
        })?;
        let mut config = StreamConfiguration {
            role,
            size,
            pixel_format,
            stride: 0,
            frame_size: 0,
            buffer_count: self.spec.default_buffer_count,
            buffer_bounds: self.spec.buffer_bounds,
            formats: self.spec.formats.clone(),
        };
        config.update_geometry();
        Ok(config)
    }

    fn validate(&self, config: &mut StreamConfiguration) -> ConfigStatus {
        // What the caller claims is supported is irrelevant.
        config.formats = self.spec.formats.clone();
        config.buffer_bounds = self.spec.buffer_bounds;
        negotiate::adjust_to_supported(config)
    }

    fn configure(&mut self, config: &StreamConfiguration) -> Result<()> {
        if self.running || self.reserved > 0 {
            return Err(backend_err("cannot configure while buffers are allocated"));
        }
        let mut check = config.clone();
        if self.validate(&mut check) != ConfigStatus::Valid || &check != config {
            return Err(Error::ConfigurationUnsupported(format!(
                "{config} is not realizable on {}",
                self.descriptor.id
            )));
        }
        self.config = Some(check);
        Ok(())
    }

    fn allocate_buffers(&mut self) -> Result<u32> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| backend_err("not configured"))?;
        self.reserved = config.buffer_count;
        Ok(self.reserved)
    }

    fn free_buffers(&mut self) -> Result<()> {
        if self.running {
            return Err(backend_err("cannot free buffers while running"));
        }
        self.reserved = 0;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.reserved == 0 {
            return Err(backend_err("no buffers allocated"));
        }
        self.running = true;
        self.next_due = Some(Instant::now() + self.spec.frame_interval());
        Ok(())
    }

    fn queue_request(&mut self, request: Request) -> std::result::Result<(), QueueError> {
        let error = if !self.running {
            Some(backend_err("not started"))
        } else if self.queue.len() >= self.reserved as usize {
            Some(backend_err("pipeline full"))
        } else if self
            .config
            .as_ref()
            .is_some_and(|c| request.buffer().len() < c.frame_size)
        {
            Some(backend_err("buffer too small"))
        } else {
            None
        };
        match error {
            Some(error) => Err(QueueError { request, error }),
            None => {
                self.queue.push_back(request);
                Ok(())
            }
        }
    }

    fn process_events(&mut self, timeout: Duration) -> Result<Vec<Request>> {
        let deadline = Instant::now() + timeout;
        let mut done = Vec::new();
        loop {
            if self.running {
                self.complete_due(&mut done);
            }
            let now = Instant::now();
            if !done.is_empty() || now >= deadline {
                return Ok(done);
            }
            let wake = match (self.running && !self.queue.is_empty(), self.next_due) {
                (true, Some(due)) => due.min(deadline),
                _ => deadline,
            };
            std::thread::sleep(wake.saturating_duration_since(now));
        }
    }

    fn stop(&mut self) -> Result<Vec<Request>> {
        self.running = false;
        self.next_due = None;
        let cancelled = self
            .queue
            .drain(..)
            .map(|mut request| {
                request.cancel();
                request
            })
            .collect();
        Ok(cancelled)
    }

    fn release(&mut self) -> Result<()> {
        if self.running {
            return Err(backend_err("cannot release while running"));
        }
        self.config = None;
        self.reserved = 0;
        self.release_lock();
        Ok(())
    }
}

impl Drop for VirtualCamera {
    fn drop(&mut self) {
        self.release_lock();
    }
}
