//! The generic video-capture path.
//!
//! Instead of negotiating streams and queueing requests, a [VideoCapture]
//! exposes a device as a stream of frames with a few settable properties. The
//! loop in [grab_frames] reads frames until a read fails.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Error, PixelFormat, Result};

/// Settable properties of a [VideoCapture].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoProperties {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub fourcc: PixelFormat,
}

/// A frame read from a [VideoCapture]. Reused between reads.
#[derive(Debug, Clone, Default)]
pub struct VideoFrame {
    /// width in pixels
    pub cols: u32,
    /// height in pixels
    pub rows: u32,
    /// bytes per pixel
    pub elem_size: u32,
    pub sequence: u64,
    data: Vec<u8>,
}

impl VideoFrame {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Resize the frame for new image data and return the bytes to fill.
    pub fn prepare(&mut self, cols: u32, rows: u32, elem_size: u32, len: usize) -> &mut [u8] {
        self.cols = cols;
        self.rows = rows;
        self.elem_size = elem_size;
        self.data.resize(len, 0);
        &mut self.data
    }

    /// First byte of the pixel in the middle of the image.
    pub fn center_value(&self) -> Option<u8> {
        let stride = self.cols as usize * self.elem_size as usize;
        let offset =
            (self.rows as usize / 2) * stride + (self.cols as usize / 2) * self.elem_size as usize;
        self.data.get(offset).copied()
    }
}

/// A device read frame by frame.
pub trait VideoCapture {
    fn is_opened(&self) -> bool;

    /// Request new properties and return what the device actually uses.
    fn apply_properties(&mut self, properties: &VideoProperties) -> Result<VideoProperties>;

    /// Grab the next frame and retrieve it into `frame`.
    ///
    /// Fails with [Error::FrameRetrievalFailed] when no frame could be read.
    fn read(&mut self, frame: &mut VideoFrame) -> Result<()>;
}

/// Limits of a [grab_frames] loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GrabOptions {
    /// Stop after this many frames. `0` means no limit.
    pub max_frames: usize,
    pub duration: Option<Duration>,
}

/// Why a [grab_frames] loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrabEnd {
    RetrievalFailed(String),
    StoppedByConsumer,
    FrameLimit,
    Elapsed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrabSummary {
    pub frames: usize,
    pub end: GrabEnd,
}

/// Read frames from `capture` and pass them to `on_frame`.
///
/// A failed read ends the loop; it is reported in the summary, not as an
/// error. Errors other than [Error::FrameRetrievalFailed] are returned.
pub fn grab_frames<C, F>(capture: &mut C, options: &GrabOptions, mut on_frame: F) -> Result<GrabSummary>
where
    C: VideoCapture + ?Sized,
    F: FnMut(&VideoFrame) -> ControlFlow<()>,
{
    if !capture.is_opened() {
        return Err(Error::FrameRetrievalFailed(
            "cannot open camera for video capture".into(),
        ));
    }
    let start = Instant::now();
    let mut frame = VideoFrame::default();
    let mut frames = 0;
    let end = loop {
        if options.max_frames != 0 && frames >= options.max_frames {
            break GrabEnd::FrameLimit;
        }
        if let Some(duration) = options.duration {
            if start.elapsed() >= duration {
                break GrabEnd::Elapsed;
            }
        }
        match capture.read(&mut frame) {
            Ok(()) => {}
            Err(Error::FrameRetrievalFailed(msg)) => {
                warn!("Cannot retrieve frame: {msg}");
                break GrabEnd::RetrievalFailed(msg);
            }
            Err(e) => return Err(e),
        }
        frames += 1;
        info!(
            "cols: {} rows: {} size: {} val: {:?}",
            frame.cols,
            frame.rows,
            frame.elem_size,
            frame.center_value()
        );
        if on_frame(&frame).is_break() {
            break GrabEnd::StoppedByConsumer;
        }
    };
    Ok(GrabSummary { frames, end })
}
