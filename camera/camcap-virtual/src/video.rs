use std::time::{Duration, Instant};

use camcap::{
    Error, Layout, PixelFormat, Result,
    video::{VideoCapture, VideoFrame, VideoProperties},
};

const MAX_WIDTH: u32 = 1920;
const MAX_HEIGHT: u32 = 1080;
const MAX_FPS: u32 = 120;

/// A virtual device for the generic video-capture path.
///
/// Produces gray gradient frames at the configured rate. With a frame budget
/// set, reads fail once the budget is used up, like a camera being unplugged.
pub struct VirtualVideoCapture {
    properties: VideoProperties,
    remaining: Option<usize>,
    sequence: u64,
    next_due: Option<Instant>,
}

impl Default for VirtualVideoCapture {
    fn default() -> Self {
        Self {
            properties: VideoProperties {
                width: 640,
                height: 480,
                fps: 30,
                fourcc: PixelFormat::YUYV,
            },
            remaining: None,
            sequence: 0,
            next_due: None,
        }
    }
}

impl VirtualVideoCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail reads after `frames` frames.
    pub fn with_frame_budget(mut self, frames: usize) -> Self {
        self.remaining = Some(frames);
        self
    }

    pub fn properties(&self) -> &VideoProperties {
        &self.properties
    }
}

impl VideoCapture for VirtualVideoCapture {
    fn is_opened(&self) -> bool {
        true
    }

    fn apply_properties(&mut self, requested: &VideoProperties) -> Result<VideoProperties> {
        let fourcc = match requested.fourcc.layout() {
            Layout::Packed { .. } => requested.fourcc,
            _ => PixelFormat::YUYV,
        };
        self.properties = VideoProperties {
            width: requested.width.clamp(1, MAX_WIDTH),
            height: requested.height.clamp(1, MAX_HEIGHT),
            fps: requested.fps.clamp(1, MAX_FPS),
            fourcc,
        };
        self.next_due = None;
        Ok(self.properties)
    }

    fn read(&mut self, frame: &mut VideoFrame) -> Result<()> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Err(Error::FrameRetrievalFailed("virtual device is gone".into()));
            }
            *remaining -= 1;
        }

        let interval = Duration::from_secs(1) / self.properties.fps;
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + interval);

        let VideoProperties {
            width,
            height,
            fourcc,
            ..
        } = self.properties;
        let elem_size = match fourcc.layout() {
            Layout::Packed { bytes_per_pixel } => bytes_per_pixel,
            _ => 2,
        };
        let stride = (width * elem_size) as usize;
        let len = stride * height as usize;
        let base = self.sequence as u8;
        let data = frame.prepare(width, height, elem_size, len);
        for (row, line) in data.chunks_mut(stride).enumerate() {
            line.fill(base.wrapping_add(row as u8));
        }
        frame.sequence = self.sequence;
        self.sequence += 1;
        Ok(())
    }
}
