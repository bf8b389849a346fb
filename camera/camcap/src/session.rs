use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::{Receiver, Sender, SyncSender, TrySendError},
};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::{
    AcquireFailure, Buffer, BufferPool, CameraDevice, CameraModule, ConfigStatus, ControlList,
    DeviceDescriptor, Error, PixelFormat, QueueError, Request, RequestStatus, Result, Size,
    StreamConfiguration, StreamRole,
};

/// Longest single wait on the backend event dispatcher.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------
// SessionState

/// Lifecycle of an acquired camera. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Acquired,
    Configured,
    BuffersAllocated,
    Capturing,
    Stopped,
    Released,
}

// use Debug to impl Display
impl std::fmt::Display for SessionState {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        std::fmt::Debug::fmt(self, fmt)
    }
}

// ---------------------------
// CaptureClient

/// Entry point: enumerates cameras of a [CameraModule] and acquires one at a
/// time.
pub struct CaptureClient<M: CameraModule> {
    module: M,
    active: Arc<AtomicBool>,
}

impl<M: CameraModule> CaptureClient<M> {
    pub fn new(module: M) -> Self {
        Self {
            module,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    /// A snapshot of the available cameras. May be empty.
    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let devices = self.module.cameras()?;
        debug!("{} reports {} camera(s)", self.module.name(), devices.len());
        Ok(devices)
    }

    /// The first available camera, or [Error::NoDeviceFound].
    pub fn first_device(&self) -> Result<DeviceDescriptor> {
        self.list_devices()?
            .into_iter()
            .next()
            .ok_or(Error::NoDeviceFound)
    }

    /// Acquire exclusive use of `device`.
    ///
    /// Only one session per client may be alive at a time; a second acquire
    /// fails with [AcquireFailure::AlreadyInUse] until the first session is
    /// released.
    pub fn acquire(&self, device: &DeviceDescriptor) -> Result<CameraSession<M::Device>> {
        self.acquire_by_id(&device.id)
    }

    pub fn acquire_by_id(&self, id: &str) -> Result<CameraSession<M::Device>> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AcquireFailed {
                id: id.to_string(),
                reason: AcquireFailure::AlreadyInUse,
            });
        }
        match self.module.acquire(id) {
            Ok(device) => {
                info!("acquired camera {}", device.descriptor());
                Ok(CameraSession::new(device, self.active.clone()))
            }
            Err(e) => {
                self.active.store(false, Ordering::Release);
                Err(e)
            }
        }
    }
}

// ---------------------------
// ValidatedConfig

/// A stream configuration which has been validated by the device.
///
/// Only [CameraSession::negotiate] and [CameraSession::validate] create these,
/// so an unvalidated configuration cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedConfig {
    config: StreamConfiguration,
    status: ConfigStatus,
}

impl ValidatedConfig {
    pub fn config(&self) -> &StreamConfiguration {
        &self.config
    }

    /// Whether validation had to change the requested configuration.
    pub fn status(&self) -> ConfigStatus {
        self.status
    }

    pub fn into_inner(self) -> StreamConfiguration {
        self.config
    }
}

// ---------------------------
// frames

/// Geometry of the frames of a configured stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub size: Size,
    pub pixel_format: PixelFormat,
    pub stride: u32,
}

impl From<&StreamConfiguration> for FrameFormat {
    fn from(config: &StreamConfiguration) -> Self {
        Self {
            size: config.size,
            pixel_format: config.pixel_format,
            stride: config.stride,
        }
    }
}

/// A completed frame handed to a consumer.
///
/// The frame owns its buffer. Dropping the frame returns the buffer to the
/// session's pool, where it is requeued.
pub struct CapturedFrame {
    buffer: Option<Buffer>,
    request_id: u64,
    format: FrameFormat,
    return_tx: Sender<Buffer>,
}

impl CapturedFrame {
    fn buffer(&self) -> &Buffer {
        // Only `Drop` takes the buffer.
        self.buffer.as_ref().expect("buffer present until drop")
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Slot of the buffer holding this frame.
    pub fn index(&self) -> usize {
        self.buffer().index()
    }

    pub fn sequence(&self) -> u32 {
        self.buffer().metadata().sequence
    }

    pub fn bytes_used(&self) -> usize {
        self.buffer().metadata().bytes_used
    }

    pub fn timestamp(&self) -> Duration {
        self.buffer().metadata().timestamp
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    pub fn data(&self) -> &[u8] {
        self.buffer().payload()
    }

    /// Write this frame to an image file, see [crate::snapshot::save_snapshot].
    pub fn save_snapshot<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        crate::snapshot::save_snapshot(path, &self.format, self.data())
    }
}

impl std::fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("request_id", &self.request_id)
            .field("format", &self.format)
            .field("buffer", &self.buffer.as_ref().map(|b| b.metadata()))
            .finish()
    }
}

impl Drop for CapturedFrame {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            // The session may already be gone, in which case the buffer is
            // simply freed.
            let _ = self.return_tx.send(buffer);
        }
    }
}

/// Receiving end of the frame channel of a session.
pub type FrameReceiver = Receiver<CapturedFrame>;

/// Counters of one capture session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Requests handed to the device.
    pub submitted: u64,
    /// Requests which completed with a frame.
    pub completed: u64,
    /// Requests which came back cancelled.
    pub cancelled: u64,
    /// Frames accepted by the consumer channel.
    pub delivered: u64,
    /// Frames dropped because the consumer channel was full.
    pub dropped: u64,
}

/// Drive every item of `results` to completion, then report the first error.
fn first_error(results: impl Iterator<Item = Result<()>>) -> Result<()> {
    let mut first = Ok(());
    for result in results {
        if let Err(e) = result {
            if first.is_ok() {
                first = Err(e);
            } else {
                warn!("further error: {e}");
            }
        }
    }
    first
}

// ---------------------------
// CameraSession

/// An exclusively acquired camera and everything configured on it.
///
/// All operations check the lifecycle state and fail with
/// [Error::InvalidState] when called out of order.
pub struct CameraSession<D: CameraDevice> {
    device: D,
    state: SessionState,
    config: Option<StreamConfiguration>,
    pool: Option<BufferPool>,
    controls: ControlList,
    next_request_id: u64,
    in_flight: usize,
    frames_tx: Option<SyncSender<CapturedFrame>>,
    stats: CaptureStats,
    client_slot: Arc<AtomicBool>,
}

impl<D: CameraDevice> CameraSession<D> {
    fn new(device: D, client_slot: Arc<AtomicBool>) -> Self {
        Self {
            device,
            state: SessionState::Acquired,
            config: None,
            pool: None,
            controls: ControlList::default(),
            next_request_id: 0,
            in_flight: 0,
            frames_tx: None,
            stats: CaptureStats::default(),
            client_slot,
        }
    }

    fn expect_state(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        self.device.descriptor()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// The applied configuration, once configured.
    pub fn configuration(&self) -> Option<&StreamConfiguration> {
        self.config.as_ref()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Number of requests currently queued on the device.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Number of buffer slots, once allocated.
    pub fn buffer_count(&self) -> Option<usize> {
        self.pool.as_ref().map(|p| p.capacity())
    }

    /// Controls attached to every request the session creates from now on.
    pub fn set_default_controls(&mut self, controls: ControlList) {
        self.controls = controls;
    }

    // ----- configuration -----

    /// Default configuration for `role` with optional overrides, validated by
    /// the device.
    pub fn negotiate(
        &self,
        role: StreamRole,
        size: Option<Size>,
        pixel_format: Option<PixelFormat>,
    ) -> Result<ValidatedConfig> {
        self.expect_state(
            "negotiate",
            &[SessionState::Acquired, SessionState::Configured],
        )?;
        let mut config = self.device.generate_configuration(role)?;
        info!("Default {role} configuration is: {config}");
        if let Some(size) = size {
            config.size = size;
        }
        if let Some(pixel_format) = pixel_format {
            config.pixel_format = pixel_format;
        }
        let validated = self.validate(config)?;
        info!(
            "Validated {role} configuration is: {} ({:?})",
            validated.config, validated.status
        );
        Ok(validated)
    }

    /// Validate an arbitrary configuration. Validating an already valid
    /// configuration returns it unchanged.
    pub fn validate(&self, mut config: StreamConfiguration) -> Result<ValidatedConfig> {
        self.expect_state(
            "validate",
            &[SessionState::Acquired, SessionState::Configured],
        )?;
        match self.device.validate(&mut config) {
            ConfigStatus::Invalid => Err(Error::ConfigurationUnsupported(format!(
                "no supported configuration close to {config}"
            ))),
            status => Ok(ValidatedConfig { config, status }),
        }
    }

    /// Apply a validated configuration. May be repeated until buffers are
    /// allocated.
    pub fn apply(&mut self, validated: &ValidatedConfig) -> Result<()> {
        self.expect_state("apply", &[SessionState::Acquired, SessionState::Configured])?;
        self.device.configure(&validated.config)?;
        self.config = Some(validated.config.clone());
        self.state = SessionState::Configured;
        debug!("applied configuration {}", validated.config);
        Ok(())
    }

    /// Reserve buffers for the configured stream.
    pub fn allocate_buffers(&mut self) -> Result<usize> {
        self.expect_state("allocate_buffers", &[SessionState::Configured])?;
        let frame_size = match &self.config {
            Some(config) => config.frame_size,
            None => {
                return Err(Error::InvalidState {
                    operation: "allocate_buffers",
                    state: self.state,
                });
            }
        };
        let count = self.device.allocate_buffers()? as usize;
        if count == 0 {
            return Err(Error::ConfigurationUnsupported(
                "device allocated no buffers".into(),
            ));
        }
        self.pool = Some(BufferPool::new(count, frame_size));
        self.state = SessionState::BuffersAllocated;
        info!("allocated {count} buffers of {frame_size} bytes");
        Ok(count)
    }

    // ----- capture -----

    /// Open the frame channel. Completed frames are offered to the returned
    /// receiver; at most `capacity` frames wait in the channel, further frames
    /// are dropped.
    ///
    /// Without a frame channel, completed buffers are requeued immediately.
    pub fn frames(&mut self, capacity: usize) -> Result<FrameReceiver> {
        self.expect_state(
            "frames",
            &[
                SessionState::Acquired,
                SessionState::Configured,
                SessionState::BuffersAllocated,
                SessionState::Capturing,
            ],
        )?;
        let (tx, rx) = std::sync::mpsc::sync_channel(capacity);
        self.frames_tx = Some(tx);
        Ok(rx)
    }

    /// Start the device and queue a request for every idle buffer.
    pub fn start(&mut self) -> Result<()> {
        self.expect_state("start", &[SessionState::BuffersAllocated])?;
        // Buffers of requests dropped before the start are parked first.
        self.recycle_returned()?;
        self.device.start()?;
        self.state = SessionState::Capturing;
        while let Some(request) = self.try_create_request() {
            self.submit(request)?;
        }
        info!("capture started with {} requests in flight", self.in_flight);
        Ok(())
    }

    fn try_create_request(&mut self) -> Option<Request> {
        let buffer = self.pool.as_mut()?.take()?;
        Some(self.wrap_buffer(buffer))
    }

    fn wrap_buffer(&mut self, buffer: Buffer) -> Request {
        let mut request = match &self.pool {
            Some(pool) => {
                Request::returning_to(self.next_request_id, buffer, pool.return_handle())
            }
            None => Request::new(self.next_request_id, buffer),
        };
        self.next_request_id += 1;
        *request.controls_mut() = self.controls.clone();
        request
    }

    /// A new request holding an idle buffer.
    ///
    /// Dropping the request without submitting it returns the buffer to the
    /// pool.
    pub fn create_request(&mut self) -> Result<Request> {
        self.expect_state(
            "create_request",
            &[SessionState::BuffersAllocated, SessionState::Capturing],
        )?;
        self.try_create_request().ok_or(Error::NoBufferAvailable)
    }

    /// Queue a request on the device.
    pub fn submit(&mut self, request: Request) -> Result<()> {
        if let Err(e) = self.expect_state("submit", &[SessionState::Capturing]) {
            self.park(request.into_buffer());
            return Err(e);
        }
        let id = request.id();
        match self.device.queue_request(request) {
            Ok(()) => {
                self.in_flight += 1;
                self.stats.submitted += 1;
                Ok(())
            }
            Err(QueueError { request, error }) => {
                error!("queueing request {id} failed: {error}");
                self.park(request.into_buffer());
                Err(error)
            }
        }
    }

    fn park(&mut self, buffer: Buffer) {
        if let Some(pool) = self.pool.as_mut() {
            pool.put(buffer);
        }
    }

    /// Requeue a buffer while capturing, park it otherwise.
    fn recycle(&mut self, buffer: Buffer) -> Result<()> {
        if self.state == SessionState::Capturing {
            let request = self.wrap_buffer(buffer);
            self.submit(request)
        } else {
            self.park(buffer);
            Ok(())
        }
    }

    fn recycle_returned(&mut self) -> Result<()> {
        let returned = match self.pool.as_mut() {
            Some(pool) => pool.drain_returned(),
            None => return Ok(()),
        };
        first_error(returned.into_iter().map(|buffer| self.recycle(buffer)))
    }

    fn handle_completion(&mut self, request: Request) -> Result<()> {
        self.in_flight = self.in_flight.saturating_sub(1);
        match request.status() {
            RequestStatus::Cancelled => {
                self.stats.cancelled += 1;
                debug!("request {} cancelled", request.id());
                self.park(request.into_buffer());
                Ok(())
            }
            RequestStatus::Pending => {
                warn!("request {} returned while still pending", request.id());
                self.recycle(request.into_buffer())
            }
            RequestStatus::Complete => {
                self.stats.completed += 1;
                let request_id = request.id();
                let buffer = request.into_buffer();
                let metadata = *buffer.metadata();
                info!(
                    " ({}) seq: {} bytesused: {}",
                    buffer.index(),
                    metadata.sequence,
                    metadata.bytes_used
                );
                self.deliver(request_id, buffer)
            }
        }
    }

    fn deliver(&mut self, request_id: u64, buffer: Buffer) -> Result<()> {
        let (tx, pool, config) = match (&self.frames_tx, &self.pool, &self.config) {
            (Some(tx), Some(pool), Some(config)) => (tx, pool, config),
            _ => return self.recycle(buffer),
        };
        let frame = CapturedFrame {
            buffer: Some(buffer),
            request_id,
            format: FrameFormat::from(config),
            return_tx: pool.return_handle(),
        };
        // A frame that cannot be sent is dropped here, which sends its buffer
        // back through the return channel.
        match tx.try_send(frame) {
            Ok(()) => {
                self.stats.delivered += 1;
            }
            Err(TrySendError::Full(_frame)) => {
                self.stats.dropped += 1;
                warn!("frame channel full, dropping frame of request {request_id}");
            }
            Err(TrySendError::Disconnected(_frame)) => {
                debug!("frame consumer disconnected");
                self.frames_tx = None;
            }
        }
        self.recycle_returned()
    }

    /// Run the event loop for `duration`.
    ///
    /// Device events are dispatched on the calling thread. The loop exits as
    /// soon as the elapsed time reaches `duration`, regardless of how many
    /// events were dispatched.
    pub fn run_for(&mut self, duration: Duration) -> Result<CaptureStats> {
        self.expect_state("run_for", &[SessionState::Capturing])?;
        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if elapsed >= duration {
                break;
            }
            self.recycle_returned()?;
            let timeout = (duration - elapsed).min(POLL_INTERVAL);
            let completed = self.device.process_events(timeout)?;
            first_error(completed.into_iter().map(|r| self.handle_completion(r)))?;
        }
        debug!("event loop ran for {:?}", start.elapsed());
        Ok(self.stats)
    }

    /// Stop capturing. Queued requests come back cancelled and the frame
    /// channel is closed.
    pub fn stop(&mut self) -> Result<()> {
        self.expect_state("stop", &[SessionState::Capturing])?;
        let cancelled = self.device.stop()?;
        self.state = SessionState::Stopped;
        first_error(cancelled.into_iter().map(|r| self.handle_completion(r)))?;
        self.recycle_returned()?;
        self.frames_tx = None;
        info!(
            "capture stopped: {} completed, {} cancelled, {} dropped",
            self.stats.completed, self.stats.cancelled, self.stats.dropped
        );
        Ok(())
    }

    /// Stop capture if needed, free buffers and give up the camera.
    ///
    /// Must be called exactly once; a second call fails with
    /// [Error::InvalidState].
    pub fn release(&mut self) -> Result<()> {
        if self.state == SessionState::Released {
            return Err(Error::InvalidState {
                operation: "release",
                state: self.state,
            });
        }
        if self.state == SessionState::Capturing {
            self.stop()?;
        }
        if self.pool.take().is_some() {
            self.device.free_buffers()?;
        }
        self.frames_tx = None;
        self.config = None;
        self.device.release()?;
        self.state = SessionState::Released;
        self.client_slot.store(false, Ordering::Release);
        info!("released camera {}", self.device.descriptor().id);
        Ok(())
    }
}

impl<D: CameraDevice> Drop for CameraSession<D> {
    fn drop(&mut self) {
        if self.state != SessionState::Released {
            warn!(
                "camera {} dropped in state {} without release",
                self.device.descriptor().id,
                self.state
            );
            if let Err(e) = self.release() {
                error!("releasing camera on drop failed: {e}");
                self.client_slot.store(false, Ordering::Release);
            }
        }
    }
}
