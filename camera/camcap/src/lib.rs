use std::time::Duration;

pub use camcap_types::{
    BufferCountBounds, ChannelOrder, ConfigStatus, ControlId, ControlList, DeviceDescriptor,
    FrameMetadata, Layout, PixFmt, PixelFormat, RequestStatus, Size, StreamConfiguration,
    StreamRole, SupportedFormat,
};

mod buffer;
pub mod config;
pub mod negotiate;
mod session;
pub mod snapshot;
pub mod video;

pub use buffer::{Buffer, BufferPool, Request};
pub use session::{
    CameraSession, CaptureClient, CaptureStats, CapturedFrame, FrameFormat, FrameReceiver,
    SessionState, ValidatedConfig,
};

// ---------------------------
// errors

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no camera found")]
    NoDeviceFound,
    #[error("could not acquire camera \"{id}\": {reason}")]
    AcquireFailed { id: String, reason: AcquireFailure },
    #[error("configuration unsupported: {0}")]
    ConfigurationUnsupported(String),
    #[error("{operation} is not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("frame retrieval failed: {0}")]
    FrameRetrievalFailed(String),
    #[error("no idle buffer available")]
    NoBufferAvailable,
    #[error("BackendError({0})")]
    BackendError(#[from] anyhow::Error),
    #[error("io error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        #[from]
        source: toml::de::Error,
    },
    #[error("image error: {source}")]
    ImageError {
        #[from]
        source: image::ImageError,
    },
}

/// Why a camera could not be acquired.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireFailure {
    #[error("already in use")]
    AlreadyInUse,
    #[error("not found")]
    NotFound,
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

// ---------------------------
// CameraModule

/// A camera stack which enumerates cameras and hands out exclusive access.
pub trait CameraModule: Send {
    type Device: CameraDevice;

    fn name(&self) -> &str;

    /// A snapshot of the cameras currently available.
    fn cameras(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Lock the camera with `id` for exclusive use.
    ///
    /// Fails with [Error::AcquireFailed] if the camera is unknown or already
    /// acquired. The lock is held until [CameraDevice::release] is called or
    /// the device is dropped.
    fn acquire(&self, id: &str) -> Result<Self::Device>;
}

// ---------------------------
// CameraDevice

/// A request could not be queued. The request is handed back so its buffer is
/// not lost.
pub struct QueueError {
    pub request: Request,
    pub error: Error,
}

impl std::fmt::Debug for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueError")
            .field("request", &self.request.id())
            .field("error", &self.error)
            .finish()
    }
}

/// An exclusively acquired camera.
///
/// Implementations are expected to be driven by a [CameraSession], which
/// enforces the order of operations.
pub trait CameraDevice: Send {
    fn descriptor(&self) -> &DeviceDescriptor;

    /// The default configuration of a stream used for `role`.
    fn generate_configuration(&self, role: StreamRole) -> Result<StreamConfiguration>;

    /// Adjust `config` to the closest configuration the device supports.
    ///
    /// Validating a configuration which is already valid must leave it
    /// unchanged and return [ConfigStatus::Valid].
    fn validate(&self, config: &mut StreamConfiguration) -> ConfigStatus;

    /// Apply a validated configuration.
    fn configure(&mut self, config: &StreamConfiguration) -> Result<()>;

    /// Reserve device memory for the configured stream. Returns the number of
    /// buffers reserved.
    fn allocate_buffers(&mut self) -> Result<u32>;

    fn free_buffers(&mut self) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn queue_request(&mut self, request: Request) -> std::result::Result<(), QueueError>;

    /// Dispatch pending device events, waiting at most `timeout`, and return
    /// the requests which completed.
    fn process_events(&mut self, timeout: Duration) -> Result<Vec<Request>>;

    /// Stop capture and return all queued requests as cancelled.
    fn stop(&mut self) -> Result<Vec<Request>>;

    /// Give up exclusive access.
    fn release(&mut self) -> Result<()>;
}
