//! Compression backend contract.
//!
//! A backend creates sessions; a session accepts raw frames and reports each
//! compressed result through the [`OutputCallback`] it was created with, on a
//! thread of its own choosing, in submission order. Output is modelled the
//! way hardware encoders hand it over: parameter sets live in the format
//! description and slice data is 4-byte length-prefixed.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use squirrelcam_common::frame::RawFrame;

use crate::h264::{nal_type, split_annexb, NAL_IDR, NAL_PPS, NAL_SPS};

/// Result of compressing one submitted frame.
pub type EncodeOutput = Result<AccessUnit, CodecError>;

/// Invoked by the session once per submitted frame.
pub type OutputCallback = Arc<dyn Fn(EncodeOutput) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Baseline,
    Main,
    High,
}

impl Profile {
    /// Parse a lowercase profile name as used in the config file.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "baseline" => Some(Profile::Baseline),
            "main" => Some(Profile::Main),
            "high" => Some(Profile::High),
            _ => None,
        }
    }
}

/// Session properties applied right after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProperties {
    pub real_time: bool,
    pub profile: Profile,
    pub allow_frame_reordering: bool,
}

impl SessionProperties {
    /// Real-time, baseline profile, no B-frame reordering: output order
    /// equals submission order.
    pub fn live_capture() -> Self {
        Self {
            real_time: true,
            profile: Profile::Baseline,
            allow_frame_reordering: false,
        }
    }

    /// Live-capture properties with the named profile; `None` for an unknown name.
    pub fn for_profile(name: &str) -> Option<Self> {
        Some(Self {
            profile: Profile::from_name(name)?,
            ..Self::live_capture()
        })
    }
}

/// Stream format attached to an access unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
    pub width: u32,
    pub height: u32,
    /// H.264 parameter sets in order: index 0 is the SPS, index 1 the PPS.
    pub parameter_sets: Vec<Bytes>,
}

impl FormatDescription {
    pub fn parameter_set(&self, index: usize) -> Option<&Bytes> {
        self.parameter_sets.get(index).filter(|ps| !ps.is_empty())
    }
}

/// Per-sample flags. A sample is a sync sample (keyframe) unless `not_sync` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleAttachments {
    pub not_sync: bool,
}

/// Compressed output for one input frame.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub pts: Duration,
    pub format: FormatDescription,
    pub attachments: SampleAttachments,
    /// Sequence of `[u32 big-endian length][NAL payload]` segments.
    pub data: Bytes,
}

impl AccessUnit {
    pub fn is_keyframe(&self) -> bool {
        !self.attachments.not_sync
    }

    /// Repackage an Annex-B access unit into length-prefixed form, moving
    /// SPS/PPS into the format description.
    ///
    /// `parameter_sets` carries the most recent SPS/PPS across calls so
    /// non-keyframes still describe the stream they belong to.
    pub fn from_annexb(
        annexb: &[u8],
        width: u32,
        height: u32,
        pts: Duration,
        parameter_sets: &mut Vec<Bytes>,
    ) -> Result<Self, CodecError> {
        let mut data = BytesMut::with_capacity(annexb.len());
        let mut sps = None;
        let mut pps = None;
        let mut has_idr = false;
        let mut has_slice = false;

        for nal in split_annexb(annexb) {
            match nal_type(nal) {
                NAL_SPS => sps = Some(Bytes::copy_from_slice(nal)),
                NAL_PPS => pps = Some(Bytes::copy_from_slice(nal)),
                // access unit delimiter
                9 => {}
                t => {
                    if t == NAL_IDR {
                        has_idr = true;
                    }
                    if (1..=5).contains(&t) {
                        has_slice = true;
                    }
                    data.put_u32(nal.len() as u32);
                    data.put_slice(nal);
                }
            }
        }

        if !has_slice {
            return Err(CodecError::FrameDropped);
        }
        if let (Some(sps), Some(pps)) = (sps, pps) {
            *parameter_sets = vec![sps, pps];
        }

        Ok(Self {
            pts,
            format: FormatDescription {
                width,
                height,
                parameter_sets: parameter_sets.clone(),
            },
            attachments: SampleAttachments { not_sync: !has_idr },
            data: data.freeze(),
        })
    }
}

pub trait CompressionSession: Send {
    fn set_properties(&mut self, properties: &SessionProperties) -> Result<(), EncoderError>;

    /// Queue one frame for compression. Must not wait for the compressed
    /// result; that arrives through the session's output callback.
    fn encode_frame(&mut self, frame: &RawFrame) -> Result<(), EncoderError>;
}

pub trait CompressionBackend: Send {
    type Session: CompressionSession;

    fn create_session(
        &self,
        width: u32,
        height: u32,
        output: OutputCallback,
    ) -> Result<Self::Session, EncoderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("failed to create compression session: {0}")]
    SessionCreation(String),
    #[error("failed to configure compression session: {0}")]
    PropertyConfiguration(String),
    #[error("frame rejected by compression session: {0}")]
    InvalidFrame(String),
    #[error("compression session is busy, frame skipped")]
    Busy,
    #[error("compression session is no longer running")]
    SessionLost,
}

/// Per-frame failure reported through the output callback.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encoder failed: {0}")]
    Encode(String),
    #[error("encoder produced no picture for this frame")]
    FrameDropped,
}
