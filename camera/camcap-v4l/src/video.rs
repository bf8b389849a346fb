use std::time::Duration;

use anyhow::Context;
use tracing::{debug, warn};

use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::video::capture::Parameters;
use v4l::{Format, buffer::Type};

use camcap::{
    Error, Layout, Result,
    video::{VideoCapture, VideoFrame, VideoProperties},
};

use crate::{from_fourcc, to_fourcc};

const STREAM_BUFFERS: u32 = 4;
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// A V4L2 node read frame by frame.
pub struct V4lVideoCapture {
    dev: Device,
    properties: Option<VideoProperties>,
    stream: Option<MmapStream<'static>>,
}

impl V4lVideoCapture {
    /// Open `/dev/video{index}`.
    pub fn open(index: usize) -> Result<Self> {
        let dev = Device::new(index).with_context(|| format!("cannot open video device {index}"))?;
        Ok(Self {
            dev,
            properties: None,
            stream: None,
        })
    }

    fn current_properties(&self) -> Result<VideoProperties> {
        let format = self.dev.format()?;
        let params = self.dev.params()?;
        let interval = params.interval;
        let fps = if interval.numerator == 0 {
            0
        } else {
            interval.denominator / interval.numerator
        };
        Ok(VideoProperties {
            width: format.width,
            height: format.height,
            fps,
            fourcc: from_fourcc(format.fourcc),
        })
    }
}

impl VideoCapture for V4lVideoCapture {
    fn is_opened(&self) -> bool {
        self.dev.query_caps().is_ok()
    }

    fn apply_properties(&mut self, requested: &VideoProperties) -> Result<VideoProperties> {
        // Formats cannot change while buffers are mapped.
        self.stream = None;
        let format = Format::new(requested.width, requested.height, to_fourcc(requested.fourcc));
        if let Err(e) = self.dev.set_format(&format) {
            warn!("could not set format {}: {e}", requested.fourcc);
        }
        if let Err(e) = self.dev.set_params(&Parameters::with_fps(requested.fps)) {
            warn!("could not set {} fps: {e}", requested.fps);
        }
        let actual = self.current_properties()?;
        debug!("video properties requested {requested:?}, got {actual:?}");
        self.properties = Some(actual);
        Ok(actual)
    }

    fn read(&mut self, frame: &mut VideoFrame) -> Result<()> {
        let properties = match self.properties {
            Some(p) => p,
            None => {
                let p = self.current_properties()?;
                self.properties = Some(p);
                p
            }
        };
        if self.stream.is_none() {
            let mut stream = MmapStream::with_buffers(&self.dev, Type::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| Error::FrameRetrievalFailed(e.to_string()))?;
            stream.set_timeout(READ_TIMEOUT);
            self.stream = Some(stream);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::FrameRetrievalFailed("no stream".into()));
        };
        let (data, meta) = CaptureStream::next(stream)
            .map_err(|e| Error::FrameRetrievalFailed(e.to_string()))?;
        let used = (meta.bytesused as usize).min(data.len());
        let elem_size = match properties.fourcc.layout() {
            Layout::Packed { bytes_per_pixel } => bytes_per_pixel,
            _ => 1,
        };
        frame
            .prepare(properties.width, properties.height, elem_size, used)
            .copy_from_slice(&data[..used]);
        frame.sequence = u64::from(meta.sequence);
        Ok(())
    }
}
