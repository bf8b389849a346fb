//! Stream configuration adjustment shared by backends.
//!
//! Backends call [adjust_to_supported] from [crate::CameraDevice::validate]
//! after filling [StreamConfiguration::formats] with what the hardware offers.

use crate::{ConfigStatus, Size, StreamConfiguration};

/// The supported size closest to `wanted`.
pub fn nearest_size(sizes: &[Size], wanted: Size) -> Option<Size> {
    sizes
        .iter()
        .copied()
        .min_by_key(|s| (s.distance(&wanted), s.area().abs_diff(wanted.area())))
}

/// Adjust `config` to the closest entry of its supported formats.
///
/// An unsupported pixel format is replaced by the first (preferred) supported
/// format. An unsupported size is replaced by the nearest supported size of
/// the chosen format. The buffer count is clamped to its bounds. Stride and
/// frame size are always recomputed; that alone is not an adjustment.
pub fn adjust_to_supported(config: &mut StreamConfiguration) -> ConfigStatus {
    let mut adjusted = false;

    let format = match config
        .formats
        .iter()
        .find(|f| f.pixel_format == config.pixel_format)
    {
        Some(f) => f,
        None => match config.formats.first() {
            Some(f) => {
                adjusted = true;
                f
            }
            None => return ConfigStatus::Invalid,
        },
    };

    let size = if format.sizes.contains(&config.size) {
        config.size
    } else {
        match nearest_size(&format.sizes, config.size) {
            Some(size) => {
                adjusted = true;
                size
            }
            None => return ConfigStatus::Invalid,
        }
    };
    let pixel_format = format.pixel_format;

    let bounds = config.buffer_bounds;
    if bounds.min > bounds.max || bounds.max == 0 {
        return ConfigStatus::Invalid;
    }
    let buffer_count = bounds.clamp(config.buffer_count);
    if buffer_count != config.buffer_count {
        adjusted = true;
    }

    config.pixel_format = pixel_format;
    config.size = size;
    config.buffer_count = buffer_count;
    config.update_geometry();

    if adjusted {
        ConfigStatus::Adjusted
    } else {
        ConfigStatus::Valid
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;
    use crate::{BufferCountBounds, PixelFormat, StreamRole, SupportedFormat};

    fn config(pixel_format: PixelFormat, size: Size, buffer_count: u32) -> StreamConfiguration {
        StreamConfiguration {
            role: StreamRole::Viewfinder,
            size,
            pixel_format,
            stride: 0,
            frame_size: 0,
            buffer_count,
            buffer_bounds: BufferCountBounds { min: 2, max: 6 },
            formats: vec![
                SupportedFormat {
                    pixel_format: PixelFormat::XRGB8888,
                    sizes: vec![Size::new(640, 480), Size::new(1920, 1080)],
                },
                SupportedFormat {
                    pixel_format: PixelFormat::BGR888,
                    sizes: vec![Size::new(640, 480), Size::new(1280, 720)],
                },
            ],
        }
    }

    #[test]
    fn supported_request_is_valid() {
        let mut cfg = config(PixelFormat::BGR888, Size::new(1280, 720), 4);
        assert_eq!(adjust_to_supported(&mut cfg), ConfigStatus::Valid);
        assert_eq!(cfg.size, Size::new(1280, 720));
        assert_eq!(cfg.pixel_format, PixelFormat::BGR888);
        assert_eq!(cfg.stride, 1280 * 3);
        assert_eq!(cfg.frame_size, 1280 * 720 * 3);
    }

    #[test]
    fn unsupported_request_is_adjusted_then_stable() {
        let mut cfg = config(PixelFormat::NV12, Size::new(1280, 720), 10);
        assert_eq!(adjust_to_supported(&mut cfg), ConfigStatus::Adjusted);
        assert_eq!(cfg.pixel_format, PixelFormat::XRGB8888);
        assert_eq!(cfg.size, Size::new(640, 480));
        assert_eq!(cfg.buffer_count, 6);

        let once = cfg.clone();
        assert_eq!(adjust_to_supported(&mut cfg), ConfigStatus::Valid);
        assert_eq!(cfg, once);
    }

    #[test]
    fn no_formats_is_invalid() {
        let mut cfg = config(PixelFormat::BGR888, Size::new(1280, 720), 4);
        cfg.formats.clear();
        assert_eq!(adjust_to_supported(&mut cfg), ConfigStatus::Invalid);
    }

    #[test]
    fn nearest_size_prefers_smallest_distance() {
        let sizes = [Size::new(640, 480), Size::new(1280, 720), Size::new(1920, 1080)];
        assert_eq!(
            nearest_size(&sizes, Size::new(1300, 700)),
            Some(Size::new(1280, 720))
        );
        assert_eq!(nearest_size(&[], Size::new(1, 1)), None);
    }
}
