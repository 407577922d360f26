use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use squirrelcam_common::frame::{FrameError, RawFrame};
use tracing::debug;

/// A still frame ready to go to the analyzer.
#[derive(Debug, Clone)]
pub struct StillImagePayload {
    pub jpeg: Bytes,
    /// `jpeg`, base64 encoded with the standard padded alphabet.
    pub base64: String,
    pub width: u32,
    pub height: u32,
    pub pts: Duration,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("pixel buffer conversion failed: {0}")]
    Pixels(#[from] FrameError),
    #[error("pixel buffer does not fit a {width}x{height} image")]
    ImageBuffer { width: u32, height: u32 },
    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// Synchronous still capture for the frame-delivery thread.
#[derive(Debug, Clone)]
pub struct FrameExtractor {
    quality: u8,
}

impl FrameExtractor {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    /// Pixel buffer to RGB to JPEG to base64.
    pub fn extract(&self, frame: &RawFrame) -> Result<StillImagePayload, ConversionError> {
        let rgb = frame.to_rgb8()?;
        let image = RgbImage::from_raw(frame.width, frame.height, rgb).ok_or(
            ConversionError::ImageBuffer {
                width: frame.width,
                height: frame.height,
            },
        )?;

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode_image(&image)?;
        let base64 = BASE64_STANDARD.encode(&jpeg);

        debug!(
            width = frame.width,
            height = frame.height,
            jpeg_bytes = jpeg.len(),
            b64_bytes = base64.len(),
            "extracted still"
        );

        Ok(StillImagePayload {
            jpeg: Bytes::from(jpeg),
            base64,
            width: frame.width,
            height: frame.height,
            pts: frame.pts,
            captured_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageReader;
    use std::io::Cursor;
    use squirrelcam_common::frame::PixelFormat;

    fn checker(width: u32, height: u32, format: PixelFormat) -> RawFrame {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let v = if (x / 8 + y / 8) % 2 == 0 { 230 } else { 20 };
                data.extend_from_slice(&[v, v / 2, 255 - v, 255]);
            }
        }
        RawFrame::new(data, width, height, format, Duration::from_millis(500))
    }

    #[test]
    fn produces_decodable_jpeg_and_matching_base64() {
        let extractor = FrameExtractor::new(80);
        let payload = extractor.extract(&checker(32, 24, PixelFormat::Bgra)).unwrap();

        assert_eq!(&payload.jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(BASE64_STANDARD.decode(&payload.base64).unwrap(), payload.jpeg.as_ref());
        assert_eq!((payload.width, payload.height), (32, 24));
        assert_eq!(payload.pts, Duration::from_millis(500));

        let decoded = ImageReader::new(Cursor::new(payload.jpeg.as_ref()))
            .with_guessed_format()
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn accepts_planar_frames() {
        let rgba = checker(16, 16, PixelFormat::Rgba);
        let i420 = RawFrame::new(rgba.to_i420().unwrap(), 16, 16, PixelFormat::I420, rgba.pts);
        let payload = FrameExtractor::new(80).extract(&i420).unwrap();
        assert!(!payload.base64.is_empty());
    }

    #[test]
    fn short_buffer_is_a_conversion_error() {
        let mut frame = checker(16, 16, PixelFormat::Rgba);
        frame.data.truncate(100);
        let err = FrameExtractor::new(80).extract(&frame).unwrap_err();
        assert!(matches!(err, ConversionError::Pixels(FrameError::TooShort { .. })));
    }

    #[test]
    fn empty_frame_is_a_conversion_error() {
        let frame = RawFrame::new(Vec::new(), 0, 0, PixelFormat::Rgba, Duration::ZERO);
        assert!(FrameExtractor::new(80).extract(&frame).is_err());
    }
}
