//! Save single frames as image files.

use crate::{ChannelOrder, Error, FrameFormat, PixFmt, Result};

/// Convert packed frame data to tightly packed RGB (or gray) rows.
///
/// Rows of formats laid out like [PixFmt::RGB8] or [PixFmt::Mono8] are copied
/// as they are. Other packed formats are reordered per pixel.
fn to_image_bytes(format: &FrameFormat, data: &[u8]) -> Result<(Vec<u8>, bool)> {
    let order = format.pixel_format.channel_order().ok_or_else(|| {
        Error::ConfigurationUnsupported(format!(
            "cannot save {} frames as images",
            format.pixel_format
        ))
    })?;
    let (width, height) = (format.size.width as usize, format.size.height as usize);
    let (bpp, gray) = match order {
        ChannelOrder::Gray => (1, true),
        ChannelOrder::Rgb | ChannelOrder::Bgr => (3, false),
        ChannelOrder::Rgbx | ChannelOrder::Bgrx => (4, false),
    };
    let stride = format.stride as usize;
    let row_len = width * bpp;
    if stride < row_len || data.len() < stride * (height.saturating_sub(1)) + row_len {
        return Err(Error::FrameRetrievalFailed(format!(
            "frame has {} bytes, too short for {}x{} with stride {}",
            data.len(),
            width,
            height,
            stride
        )));
    }

    let native = matches!(
        format.pixel_format.pixfmt(),
        Some(PixFmt::RGB8 | PixFmt::Mono8)
    );
    let mut out = Vec::with_capacity(width * height * if gray { 1 } else { 3 });
    for row in 0..height {
        let line = &data[row * stride..row * stride + row_len];
        if native {
            out.extend_from_slice(line);
            continue;
        }
        match order {
            ChannelOrder::Gray | ChannelOrder::Rgb => out.extend_from_slice(line),
            ChannelOrder::Bgr => {
                for px in line.chunks_exact(3) {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
            ChannelOrder::Rgbx => {
                for px in line.chunks_exact(4) {
                    out.extend_from_slice(&px[..3]);
                }
            }
            ChannelOrder::Bgrx => {
                for px in line.chunks_exact(4) {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
        }
    }
    Ok((out, gray))
}

/// Write one frame to `path`. The image format is chosen from the file
/// extension.
///
/// Packed RGB, BGR, XRGB, XBGR and 8-bit gray frames are supported. Other
/// pixel formats fail with [Error::ConfigurationUnsupported].
pub fn save_snapshot<P: AsRef<std::path::Path>>(
    path: P,
    format: &FrameFormat,
    data: &[u8],
) -> Result<()> {
    let (bytes, gray) = to_image_bytes(format, data)?;
    let (w, h) = (format.size.width, format.size.height);
    let color = if gray {
        image::ExtendedColorType::L8
    } else {
        image::ExtendedColorType::Rgb8
    };
    image::save_buffer(path.as_ref(), &bytes, w, h, color)?;
    tracing::info!("saved {}x{} frame to {}", w, h, path.as_ref().display());
    Ok(())
}
