use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use squirrelcam_common::frame::RawFrame;
use tracing::{debug, error, info, warn};

use crate::session::{
    AccessUnit, CodecError, CompressionBackend, CompressionSession, EncodeOutput, EncoderError,
    OutputCallback, SessionProperties,
};

/// Annex-B start code prepended to every emitted NAL unit.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

/// NAL unit type from the first header byte of a payload (without start code).
pub fn nal_type(payload: &[u8]) -> u8 {
    payload.first().map(|b| b & 0x1F).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluKind {
    Sps,
    Pps,
    Slice,
}

/// One NAL unit framed for an Annex-B byte stream (`00 00 00 01` + payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nalu {
    kind: NaluKind,
    bytes: Bytes,
}

impl Nalu {
    fn framed(kind: NaluKind, payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(START_CODE.len() + payload.len());
        buf.put_slice(&START_CODE);
        buf.put_slice(payload);
        Self {
            kind,
            bytes: buf.freeze(),
        }
    }

    pub fn kind(&self) -> NaluKind {
        self.kind
    }

    /// Start code plus payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[START_CODE.len()..]
    }

    pub fn nal_type(&self) -> u8 {
        nal_type(self.payload())
    }
}

/// Summary passed to the sink after the last NAL unit of an access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessUnitInfo {
    pub pts: Duration,
    pub keyframe: bool,
    pub nalu_count: usize,
    /// NAL type of the first slice (5 = IDR, 1 = non-IDR).
    pub primary_nal_type: u8,
}

/// Receiver of the encoded byte stream.
///
/// Called on the encoder's output thread, never on the frame-delivery thread.
pub trait NaluSink: Send + Sync {
    fn push(&self, nalu: &Nalu);

    fn end_access_unit(&self, _info: &AccessUnitInfo) {}
}

// ---------------------------------------------------------------------------
// Bitstream framing
// ---------------------------------------------------------------------------

/// Iterator over `[u32 big-endian length][payload]` segments.
///
/// Stops at the first point where a full segment is not available: fewer than
/// four bytes left, or a declared length running past the end of the buffer.
pub struct LengthPrefixed<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> LengthPrefixed<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes left over once iteration has stopped.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

impl<'a> Iterator for LengthPrefixed<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let rest = &self.data[self.offset..];
        if rest.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let end = 4usize.checked_add(len).filter(|&end| end <= rest.len())?;
        self.offset += end;
        Some(&rest[4..end])
    }
}

/// Split an Annex-B byte stream (3- or 4-byte start codes) into NAL payloads.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    // (start code offset, payload offset)
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0x00 && data[i + 1] == 0x00 {
            if data[i + 2] == 0x01 {
                starts.push((i, i + 3));
                i += 3;
                continue;
            }
            if i + 3 < data.len() && data[i + 2] == 0x00 && data[i + 3] == 0x01 {
                starts.push((i, i + 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }

    starts
        .iter()
        .enumerate()
        .map(|(n, &(_, begin))| {
            let end = starts.get(n + 1).map(|&(code, _)| code).unwrap_or(data.len());
            &data[begin..end]
        })
        .filter(|nal| !nal.is_empty())
        .collect()
}

/// Frame one access unit as Annex-B NAL units.
///
/// Keyframes lead with SPS then PPS from the format description. Returns
/// `None` when a keyframe lacks either parameter set or the data holds no
/// complete slice; nothing of that access unit may be emitted.
pub fn packetize(au: &AccessUnit) -> Option<Vec<Nalu>> {
    let mut nalus = Vec::new();

    if au.is_keyframe() {
        let sps = au.format.parameter_set(0)?;
        let pps = au.format.parameter_set(1)?;
        nalus.push(Nalu::framed(NaluKind::Sps, sps));
        nalus.push(Nalu::framed(NaluKind::Pps, pps));
    }

    let parameter_sets = nalus.len();
    let mut segments = LengthPrefixed::new(&au.data);
    for segment in segments.by_ref() {
        nalus.push(Nalu::framed(NaluKind::Slice, segment));
    }
    if segments.remaining() > 0 {
        debug!(
            trailing = segments.remaining(),
            pts_ms = au.pts.as_millis() as u64,
            "ignoring incomplete trailing segment"
        );
    }
    if nalus.len() == parameter_sets {
        return None;
    }

    Some(nalus)
}

/// Turns encoder output into NAL units for a sink. Lives on the encoder's
/// output thread.
pub struct NaluPacketizer {
    sink: Arc<dyn NaluSink>,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl NaluPacketizer {
    pub fn new(sink: Arc<dyn NaluSink>) -> Self {
        Self {
            sink,
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn handle_output(&self, output: EncodeOutput) {
        let au = match output {
            Ok(au) => au,
            Err(CodecError::FrameDropped) => {
                debug!("encoder skipped frame");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                warn!(error = %e, "encode callback error, dropping access unit");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let Some(nalus) = packetize(&au) else {
            warn!(
                pts_ms = au.pts.as_millis() as u64,
                parameter_sets = au.format.parameter_sets.len(),
                data_bytes = au.data.len(),
                "access unit missing SPS/PPS or slice data, dropping it"
            );
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let primary_nal_type = nalus
            .iter()
            .find(|n| n.kind() == NaluKind::Slice && (NAL_SLICE..=NAL_IDR).contains(&n.nal_type()))
            .map(Nalu::nal_type)
            .unwrap_or(0);

        for nalu in &nalus {
            self.sink.push(nalu);
        }
        self.sink.end_access_unit(&AccessUnitInfo {
            pts: au.pts,
            keyframe: au.is_keyframe(),
            nalu_count: nalus.len(),
            primary_nal_type,
        });

        let total = self.emitted.fetch_add(1, Ordering::Relaxed) + 1;
        if total % 300 == 0 {
            debug!(total, dropped = self.dropped.load(Ordering::Relaxed), "access units emitted");
        }
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

struct LiveSession<S> {
    session: S,
    width: u32,
    height: u32,
}

/// H.264 encoder front end, driven from the frame-delivery thread.
///
/// The compression session is created from the first frame it sees. If
/// creation or configuration fails, nothing is kept and the next frame tries
/// again. A frame with different dimensions replaces the session.
pub struct H264Encoder<B: CompressionBackend> {
    backend: B,
    properties: SessionProperties,
    session: Option<LiveSession<B::Session>>,
    output: OutputCallback,
}

impl<B: CompressionBackend> H264Encoder<B> {
    pub fn new(backend: B, sink: Arc<dyn NaluSink>) -> Self {
        let packetizer = Arc::new(NaluPacketizer::new(sink));
        let output: OutputCallback = Arc::new(move |out| packetizer.handle_output(out));
        Self {
            backend,
            properties: SessionProperties::live_capture(),
            session: None,
            output,
        }
    }

    /// Override the properties applied to every new session.
    pub fn with_properties(mut self, properties: SessionProperties) -> Self {
        self.properties = properties;
        self
    }

    #[cfg(test)]
    fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Hand one frame to the session. Never waits for compressed output.
    pub fn submit(&mut self, frame: &RawFrame) {
        if let Some(live) = &self.session {
            if (live.width, live.height) != (frame.width, frame.height) {
                info!(
                    old_width = live.width,
                    old_height = live.height,
                    width = frame.width,
                    height = frame.height,
                    "frame dimensions changed, recreating compression session"
                );
                self.session = None;
            }
        }

        if self.session.is_none() {
            match self.configure(frame) {
                Ok(live) => self.session = Some(live),
                Err(e) => {
                    error!(error = %e, "compression session setup failed, will retry on next frame");
                    return;
                }
            }
        }

        let Some(live) = self.session.as_mut() else {
            return;
        };
        match live.session.encode_frame(frame) {
            Ok(()) => {}
            Err(EncoderError::SessionLost) => {
                error!("compression session stopped, discarding it");
                self.session = None;
            }
            Err(e) => {
                warn!(error = %e, pts_ms = frame.pts.as_millis() as u64, "frame not submitted");
            }
        }
    }

    fn configure(&self, frame: &RawFrame) -> Result<LiveSession<B::Session>, EncoderError> {
        let mut session =
            self.backend
                .create_session(frame.width, frame.height, Arc::clone(&self.output))?;
        session.set_properties(&self.properties)?;
        info!(
            width = frame.width,
            height = frame.height,
            "compression session configured"
        );
        Ok(LiveSession {
            session,
            width: frame.width,
            height: frame.height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{FormatDescription, SampleAttachments};
    use squirrelcam_common::frame::PixelFormat;
    use std::sync::Mutex;

    const SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1E];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];

    #[derive(Default)]
    struct CollectingSink {
        nalus: Mutex<Vec<Nalu>>,
        units: Mutex<Vec<AccessUnitInfo>>,
    }

    impl NaluSink for CollectingSink {
        fn push(&self, nalu: &Nalu) {
            self.nalus.lock().unwrap().push(nalu.clone());
        }

        fn end_access_unit(&self, info: &AccessUnitInfo) {
            self.units.lock().unwrap().push(*info);
        }
    }

    impl CollectingSink {
        fn kinds(&self) -> Vec<NaluKind> {
            self.nalus.lock().unwrap().iter().map(Nalu::kind).collect()
        }
    }

    fn length_prefixed(segments: &[&[u8]]) -> Bytes {
        let mut buf = BytesMut::new();
        for seg in segments {
            buf.put_u32(seg.len() as u32);
            buf.put_slice(seg);
        }
        buf.freeze()
    }

    fn access_unit(keyframe: bool, parameter_sets: &[&[u8]], data: Bytes) -> AccessUnit {
        AccessUnit {
            pts: Duration::from_millis(40),
            format: FormatDescription {
                width: 4,
                height: 4,
                parameter_sets: parameter_sets.iter().map(|p| Bytes::copy_from_slice(p)).collect(),
            },
            attachments: SampleAttachments { not_sync: !keyframe },
            data,
        }
    }

    fn frame(width: u32, height: u32, n: u64) -> RawFrame {
        RawFrame::new(
            vec![0x80; (width * height * 4) as usize],
            width,
            height,
            PixelFormat::Rgba,
            Duration::from_millis(33 * n),
        )
    }

    /// Backend whose sessions answer synchronously: keyframe on the first
    /// frame of every session, P-frames after that.
    #[derive(Clone, Default)]
    struct ScriptedBackend {
        fail_creations: Arc<Mutex<u32>>,
        fail_properties: Arc<Mutex<u32>>,
        created: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    struct ScriptedSession {
        output: OutputCallback,
        frames: u64,
    }

    impl CompressionBackend for ScriptedBackend {
        type Session = ScriptedSession;

        fn create_session(
            &self,
            width: u32,
            height: u32,
            output: OutputCallback,
        ) -> Result<ScriptedSession, EncoderError> {
            let mut fail = self.fail_creations.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(EncoderError::SessionCreation("scripted failure".into()));
            }
            self.created.lock().unwrap().push((width, height));
            Ok(ScriptedSession { output, frames: 0 })
        }
    }

    impl ScriptedBackend {
        fn properties_should_fail(&self) -> bool {
            let mut fail = self.fail_properties.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return true;
            }
            false
        }
    }

    // The scripted session needs to see its backend's property script.
    struct PropertyAwareBackend(ScriptedBackend);

    struct PropertyAwareSession {
        inner: ScriptedSession,
        fail: bool,
    }

    impl CompressionBackend for PropertyAwareBackend {
        type Session = PropertyAwareSession;

        fn create_session(
            &self,
            width: u32,
            height: u32,
            output: OutputCallback,
        ) -> Result<PropertyAwareSession, EncoderError> {
            let inner = self.0.create_session(width, height, output)?;
            Ok(PropertyAwareSession {
                inner,
                fail: self.0.properties_should_fail(),
            })
        }
    }

    impl CompressionSession for PropertyAwareSession {
        fn set_properties(&mut self, properties: &SessionProperties) -> Result<(), EncoderError> {
            if self.fail {
                return Err(EncoderError::PropertyConfiguration("scripted failure".into()));
            }
            self.inner.set_properties(properties)
        }

        fn encode_frame(&mut self, frame: &RawFrame) -> Result<(), EncoderError> {
            self.inner.encode_frame(frame)
        }
    }

    impl CompressionSession for ScriptedSession {
        fn set_properties(&mut self, properties: &SessionProperties) -> Result<(), EncoderError> {
            assert_eq!(properties, &SessionProperties::live_capture());
            Ok(())
        }

        fn encode_frame(&mut self, frame: &RawFrame) -> Result<(), EncoderError> {
            let keyframe = self.frames == 0;
            self.frames += 1;
            let slice: &[u8] = if keyframe { &[0x65, 0x88, 0x80] } else { &[0x41, 0x9A, 0x02] };
            let mut au = access_unit(keyframe, &[SPS, PPS], length_prefixed(&[slice]));
            au.pts = frame.pts;
            (self.output)(Ok(au));
            Ok(())
        }
    }

    fn packetizer() -> (Arc<CollectingSink>, NaluPacketizer) {
        let sink = Arc::new(CollectingSink::default());
        (sink.clone(), NaluPacketizer::new(sink))
    }

    #[test]
    fn keyframe_emits_sps_pps_then_slices() {
        let (sink, packetizer) = packetizer();
        let data = length_prefixed(&[&[0x65, 1, 2], &[0x65, 3]]);
        packetizer.handle_output(Ok(access_unit(true, &[SPS, PPS], data)));

        assert_eq!(
            sink.kinds(),
            vec![NaluKind::Sps, NaluKind::Pps, NaluKind::Slice, NaluKind::Slice]
        );
        let nalus = sink.nalus.lock().unwrap();
        assert_eq!(nalus[0].payload(), SPS);
        assert_eq!(nalus[1].payload(), PPS);
        assert_eq!(nalus[0].nal_type(), NAL_SPS);
        assert_eq!(nalus[1].nal_type(), NAL_PPS);

        let units = sink.units.lock().unwrap();
        assert_eq!(units.len(), 1);
        assert!(units[0].keyframe);
        assert_eq!(units[0].nalu_count, 4);
        assert_eq!(units[0].primary_nal_type, NAL_IDR);
    }

    #[test]
    fn non_keyframe_has_no_parameter_sets() {
        let (sink, packetizer) = packetizer();
        let data = length_prefixed(&[&[0x41, 0xAA]]);
        packetizer.handle_output(Ok(access_unit(false, &[SPS, PPS], data)));

        assert_eq!(sink.kinds(), vec![NaluKind::Slice]);
        assert_eq!(sink.units.lock().unwrap()[0].primary_nal_type, NAL_SLICE);
    }

    #[test]
    fn every_nalu_starts_with_start_code() {
        let (sink, packetizer) = packetizer();
        for i in 0..10u8 {
            let keyframe = i % 4 == 0;
            let data = length_prefixed(&[&[0x41, i], &[], &[0x41, i, i, i, i, i]]);
            packetizer.handle_output(Ok(access_unit(keyframe, &[SPS, PPS], data)));
        }
        let nalus = sink.nalus.lock().unwrap();
        assert!(!nalus.is_empty());
        for nalu in nalus.iter() {
            assert_eq!(&nalu.as_bytes()[..4], &START_CODE);
        }
    }

    #[test]
    fn keyframe_missing_pps_is_dropped_entirely() {
        let (sink, packetizer) = packetizer();
        let data = length_prefixed(&[&[0x65, 1]]);
        packetizer.handle_output(Ok(access_unit(true, &[SPS], data.clone())));
        packetizer.handle_output(Ok(access_unit(true, &[], data)));

        assert!(sink.nalus.lock().unwrap().is_empty());
        assert!(sink.units.lock().unwrap().is_empty());
    }

    #[test]
    fn access_unit_without_complete_slice_is_dropped() {
        let (sink, packetizer) = packetizer();
        for data in [
            Bytes::new(),
            Bytes::from_static(&[0, 0, 0]),
            Bytes::from_static(&[0, 0, 0, 9, 0x65, 1]),
        ] {
            packetizer.handle_output(Ok(access_unit(true, &[SPS, PPS], data.clone())));
            packetizer.handle_output(Ok(access_unit(false, &[SPS, PPS], data)));
        }

        assert!(sink.nalus.lock().unwrap().is_empty());
        assert!(sink.units.lock().unwrap().is_empty());
    }

    #[test]
    fn codec_errors_drop_output_and_later_frames_still_flow() {
        let (sink, packetizer) = packetizer();
        packetizer.handle_output(Err(CodecError::Encode("bitstream overflow".into())));
        packetizer.handle_output(Err(CodecError::FrameDropped));
        packetizer.handle_output(Ok(access_unit(false, &[], length_prefixed(&[&[0x41]]))));

        assert_eq!(sink.kinds(), vec![NaluKind::Slice]);
    }

    #[test]
    fn length_prefix_walk_is_exact() {
        let segments: Vec<Vec<u8>> = vec![vec![0x65; 1], vec![0x41; 300], vec![0x41; 70_000], vec![0x06, 0x05]];
        let refs: Vec<&[u8]> = segments.iter().map(Vec::as_slice).collect();
        let data = length_prefixed(&refs);

        let walked: Vec<&[u8]> = LengthPrefixed::new(&data).collect();
        assert_eq!(walked, refs);

        let au = access_unit(false, &[], data);
        let nalus = packetize(&au).unwrap();
        assert_eq!(nalus.len(), segments.len());
        for (nalu, seg) in nalus.iter().zip(&segments) {
            assert_eq!(nalu.payload(), seg.as_slice());
        }
    }

    #[test]
    fn short_trailing_bytes_are_ignored() {
        for trailing in 0..4 {
            let mut buf = BytesMut::from(length_prefixed(&[&[0x41, 1, 2], &[0x41, 3]]).as_ref());
            buf.put_slice(&[0xFF; 3][..trailing]);
            let mut walk = LengthPrefixed::new(&buf);
            assert_eq!(walk.by_ref().count(), 2, "trailing={trailing}");
            assert_eq!(walk.remaining(), trailing);
        }
    }

    #[test]
    fn overlong_declared_length_stops_the_walk() {
        let mut buf = BytesMut::from(length_prefixed(&[&[0x41, 1]]).as_ref());
        buf.put_u32(1000);
        buf.put_slice(&[0x41, 2, 3]);
        let walked: Vec<&[u8]> = LengthPrefixed::new(&buf).collect();
        assert_eq!(walked, vec![&[0x41, 1][..]]);
    }

    #[test]
    fn split_annexb_handles_both_start_code_lengths() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, // SPS, 4-byte code
            0x00, 0x00, 0x01, 0x68, 0xCE, // PPS, 3-byte code
            0x00, 0x00, 0x00, 0x01, 0x65, 0xAA, 0xBB, // IDR
        ];
        let nals = split_annexb(&data);
        assert_eq!(nals, vec![&[0x67, 0x42][..], &[0x68, 0xCE][..], &[0x65, 0xAA, 0xBB][..]]);
        assert_eq!(nal_type(nals[2]), NAL_IDR);
        assert!(split_annexb(&[]).is_empty());
        assert!(split_annexb(&[0x12, 0x34]).is_empty());
    }

    #[test]
    fn session_failures_retry_until_cold_start() {
        let backend = ScriptedBackend::default();
        *backend.fail_creations.lock().unwrap() = 3;
        let sink = Arc::new(CollectingSink::default());
        let mut encoder = H264Encoder::new(backend.clone(), sink.clone());

        for n in 0..3 {
            encoder.submit(&frame(4, 4, n));
            assert!(!encoder.has_session());
        }
        assert!(sink.nalus.lock().unwrap().is_empty());

        encoder.submit(&frame(4, 4, 3));
        encoder.submit(&frame(4, 4, 4));
        assert!(encoder.has_session());
        assert_eq!(backend.created.lock().unwrap().as_slice(), &[(4, 4)]);
        assert_eq!(
            sink.kinds(),
            vec![NaluKind::Sps, NaluKind::Pps, NaluKind::Slice, NaluKind::Slice]
        );
        let units = sink.units.lock().unwrap();
        assert_eq!(units[0].pts, Duration::from_millis(99));
        assert!(units[0].keyframe);
        assert!(!units[1].keyframe);
    }

    #[test]
    fn property_failure_keeps_no_session() {
        let scripted = ScriptedBackend::default();
        *scripted.fail_properties.lock().unwrap() = 1;
        let sink = Arc::new(CollectingSink::default());
        let mut encoder = H264Encoder::new(PropertyAwareBackend(scripted.clone()), sink.clone());

        encoder.submit(&frame(4, 4, 0));
        assert!(!encoder.has_session());
        assert!(sink.nalus.lock().unwrap().is_empty());

        encoder.submit(&frame(4, 4, 1));
        assert!(encoder.has_session());
        assert_eq!(sink.kinds(), vec![NaluKind::Sps, NaluKind::Pps, NaluKind::Slice]);
        assert_eq!(scripted.created.lock().unwrap().len(), 2);
    }

    #[test]
    fn dimension_change_recreates_session() {
        let backend = ScriptedBackend::default();
        let sink = Arc::new(CollectingSink::default());
        let mut encoder = H264Encoder::new(backend.clone(), sink.clone());

        encoder.submit(&frame(4, 4, 0));
        encoder.submit(&frame(4, 4, 1));
        encoder.submit(&frame(8, 6, 2));

        assert_eq!(backend.created.lock().unwrap().as_slice(), &[(4, 4), (8, 6)]);
        let keyframes: Vec<bool> = sink.units.lock().unwrap().iter().map(|u| u.keyframe).collect();
        assert_eq!(keyframes, vec![true, false, true]);
    }
}
