use std::time::Duration;

/// Pixel layout of a [`RawFrame`] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 8-bit RGBA, 4 bytes per pixel.
    Rgba,
    /// Packed 8-bit BGRA, 4 bytes per pixel (typical camera output).
    Bgra,
    /// Planar YUV 4:2:0 (Y, U, V planes back to back). Width and height must be even.
    I420,
}

impl PixelFormat {
    /// Byte offsets of (r, g, b) inside one packed pixel, or `None` for planar formats.
    fn rgb_offsets(self) -> Option<(usize, usize, usize)> {
        match self {
            PixelFormat::Rgba => Some((0, 1, 2)),
            PixelFormat::Bgra => Some((2, 1, 0)),
            PixelFormat::I420 => None,
        }
    }
}

/// One uncompressed camera frame as handed over by a frame source.
///
/// A frame is only borrowed for the duration of one delivery callback.
/// Anything that needs the pixels later must copy them (see [`RawFrame::to_i420`]).
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Monotonic presentation timestamp, relative to the start of the stream.
    pub pts: Duration,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat, pts: Duration) -> Self {
        Self {
            data,
            width,
            height,
            format,
            pts,
        }
    }

    /// Number of bytes a buffer of this format and size must hold.
    pub fn expected_len(format: PixelFormat, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        match format {
            PixelFormat::Rgba | PixelFormat::Bgra => w * h * 4,
            PixelFormat::I420 => w * h + 2 * (w / 2) * (h / 2),
        }
    }

    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::EmptyDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.format == PixelFormat::I420 && (self.width % 2 != 0 || self.height % 2 != 0) {
            return Err(FrameError::OddDimensions {
                width: self.width,
                height: self.height,
            });
        }
        let expected = Self::expected_len(self.format, self.width, self.height);
        if self.data.len() < expected {
            return Err(FrameError::TooShort {
                got: self.data.len(),
                expected,
            });
        }
        Ok(())
    }

    /// Copy the frame into a freshly allocated I420 buffer.
    ///
    /// Packed input must have even dimensions since chroma is subsampled 2x2.
    pub fn to_i420(&self) -> Result<Vec<u8>, FrameError> {
        self.validate()?;
        let Some((ro, go, bo)) = self.format.rgb_offsets() else {
            let len = Self::expected_len(self.format, self.width, self.height);
            return Ok(self.data[..len].to_vec());
        };
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(FrameError::OddDimensions {
                width: self.width,
                height: self.height,
            });
        }

        let w = self.width as usize;
        let h = self.height as usize;
        let y_size = w * h;
        let uv_size = (w / 2) * (h / 2);
        let mut yuv = vec![0u8; y_size + uv_size * 2];
        let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
        let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);
        let src = &self.data;

        for row in 0..h {
            for col in 0..w {
                let idx = (row * w + col) * 4;
                let r = src[idx + ro] as f32;
                let g = src[idx + go] as f32;
                let b = src[idx + bo] as f32;
                y_plane[row * w + col] =
                    (0.299 * r + 0.587 * g + 0.114 * b).round().clamp(0.0, 255.0) as u8;
            }
        }

        // Subsample U and V over 2x2 blocks
        for row in (0..h).step_by(2) {
            for col in (0..w).step_by(2) {
                let (mut r_sum, mut g_sum, mut b_sum) = (0.0f32, 0.0f32, 0.0f32);
                for dr in 0..2 {
                    for dc in 0..2 {
                        let idx = ((row + dr) * w + (col + dc)) * 4;
                        r_sum += src[idx + ro] as f32;
                        g_sum += src[idx + go] as f32;
                        b_sum += src[idx + bo] as f32;
                    }
                }
                let (r, g, b) = (r_sum / 4.0, g_sum / 4.0, b_sum / 4.0);
                let uv_idx = (row / 2) * (w / 2) + (col / 2);
                u_plane[uv_idx] =
                    (-0.169 * r - 0.331 * g + 0.500 * b + 128.0).round().clamp(0.0, 255.0) as u8;
                v_plane[uv_idx] =
                    (0.500 * r - 0.419 * g - 0.081 * b + 128.0).round().clamp(0.0, 255.0) as u8;
            }
        }

        Ok(yuv)
    }

    /// Copy the frame into a packed 8-bit RGB buffer (3 bytes per pixel).
    pub fn to_rgb8(&self) -> Result<Vec<u8>, FrameError> {
        self.validate()?;
        let w = self.width as usize;
        let h = self.height as usize;
        let mut rgb = vec![0u8; w * h * 3];

        match self.format.rgb_offsets() {
            Some((ro, go, bo)) => {
                for (dst, px) in rgb.chunks_exact_mut(3).zip(self.data.chunks_exact(4)) {
                    dst[0] = px[ro];
                    dst[1] = px[go];
                    dst[2] = px[bo];
                }
            }
            None => {
                let uv_w = w / 2;
                let uv_size = uv_w * (h / 2);
                let y_plane = &self.data[..w * h];
                let u_plane = &self.data[w * h..w * h + uv_size];
                let v_plane = &self.data[w * h + uv_size..w * h + uv_size * 2];
                for row in 0..h {
                    for col in 0..w {
                        let y = y_plane[row * w + col] as f32;
                        let uv_idx = (row / 2) * uv_w + (col / 2);
                        let u = u_plane[uv_idx] as f32 - 128.0;
                        let v = v_plane[uv_idx] as f32 - 128.0;
                        let out = (row * w + col) * 3;
                        rgb[out] = (y + 1.402 * v).round().clamp(0.0, 255.0) as u8;
                        rgb[out + 1] = (y - 0.344 * u - 0.714 * v).round().clamp(0.0, 255.0) as u8;
                        rgb[out + 2] = (y + 1.772 * u).round().clamp(0.0, 255.0) as u8;
                    }
                }
            }
        }

        Ok(rgb)
    }
}

/// An encoded H.264 access unit as published to Kafka.
///
/// Binary wire format:
///   [0]      version = 0x02
///   [1]      nal_type of the primary slice (5 = IDR, 1 = non-IDR)
///   [2..10]  captured_at_ms  (i64 big-endian, Unix millis)
///   [10..18] seq             (u64 big-endian)
///   [18..22] h264_len        (u32 big-endian)
///   [22..22+h264_len] h264_data (Annex B access unit)
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub nal_type: u8,
    pub captured_at_ms: i64,
    pub seq: u64,
}

const HEADER_SIZE: usize = 22; // 1 version + 1 nal_type + 8 ts + 8 seq + 4 h264_len
const VERSION_MARKER: u8 = 0x02;

impl EncodedFrame {
    pub fn new(data: Vec<u8>, nal_type: u8, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            data,
            nal_type,
            captured_at_ms,
            seq,
        }
    }

    /// Returns true if the primary slice is an IDR slice.
    pub fn is_keyframe(&self) -> bool {
        self.nal_type == 5
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.data.len());
        buf.push(VERSION_MARKER);
        buf.push(self.nal_type);
        buf.extend_from_slice(&self.captured_at_ms.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    #[cfg(test)]
    pub fn deserialize(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_SIZE {
            return Err(FrameError::TooShort {
                got: data.len(),
                expected: HEADER_SIZE,
            });
        }
        if data[0] != VERSION_MARKER {
            return Err(FrameError::UnknownVersion(data[0]));
        }
        let nal_type = data[1];
        let captured_at_ms = i64::from_be_bytes(be_array(&data[2..10]));
        let seq = u64::from_be_bytes(be_array(&data[10..18]));
        let h264_len = u32::from_be_bytes(be_array(&data[18..22])) as usize;
        if data.len() < HEADER_SIZE + h264_len {
            return Err(FrameError::TooShort {
                got: data.len(),
                expected: HEADER_SIZE + h264_len,
            });
        }
        Ok(Self {
            data: data[HEADER_SIZE..HEADER_SIZE + h264_len].to_vec(),
            nal_type,
            captured_at_ms,
            seq,
        })
    }
}

#[cfg(test)]
fn be_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame payload too short: got {got} bytes, expected at least {expected}")]
    TooShort { got: usize, expected: usize },
    #[error("frame has empty dimensions {width}x{height}")]
    EmptyDimensions { width: u32, height: u32 },
    #[error("frame dimensions {width}x{height} must be even for 4:2:0 chroma")]
    OddDimensions { width: u32, height: u32 },
    #[cfg(test)]
    #[error("unknown encoded frame version {0:#04x}")]
    UnknownVersion(u8),
}
