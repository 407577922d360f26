//! Software compression backend on top of OpenH264.
//!
//! Each session owns one `h264-encoder` worker thread. Frames are copied to
//! I420 on the caller's thread and queued; the worker encodes them in order
//! and reports every result through the session's output callback.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, RateControlMode};
use openh264::formats::YUVSlices;
use openh264::OpenH264API;
use squirrelcam_common::config;
use squirrelcam_common::frame::RawFrame;
use tracing::{debug, info, warn};

use crate::session::{
    AccessUnit, CodecError, CompressionBackend, CompressionSession, EncoderError, OutputCallback,
    Profile, SessionProperties,
};

/// Frames queued ahead of the worker before new ones are refused.
const JOB_QUEUE_DEPTH: usize = 4;

#[derive(Debug, Clone)]
pub struct OpenH264Backend {
    bitrate_bps: u32,
    max_frame_rate: f32,
}

impl OpenH264Backend {
    pub fn new(config: &config::EncoderConfig) -> Self {
        Self {
            bitrate_bps: config.bitrate_bps,
            max_frame_rate: config.max_frame_rate,
        }
    }
}

struct Job {
    yuv: Vec<u8>,
    pts: Duration,
}

pub struct OpenH264Session {
    width: u32,
    height: u32,
    jobs: Option<SyncSender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl CompressionBackend for OpenH264Backend {
    type Session = OpenH264Session;

    fn create_session(
        &self,
        width: u32,
        height: u32,
        output: OutputCallback,
    ) -> Result<OpenH264Session, EncoderError> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(EncoderError::SessionCreation(format!(
                "unsupported dimensions {width}x{height}, both must be even and non-zero"
            )));
        }

        let (job_tx, job_rx) = mpsc::sync_channel::<Job>(JOB_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let bitrate_bps = self.bitrate_bps;
        let max_frame_rate = self.max_frame_rate;

        let worker = thread::Builder::new()
            .name("h264-encoder".into())
            .spawn(move || {
                let encoder = match build_encoder(bitrate_bps, max_frame_rate) {
                    Ok(encoder) => {
                        let _ = ready_tx.send(Ok(()));
                        encoder
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run_worker(encoder, width, height, job_rx, output);
            })
            .map_err(|e| EncoderError::SessionCreation(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(EncoderError::SessionCreation(
                    "encoder thread exited during startup".into(),
                ));
            }
        }

        info!(width, height, bitrate_bps, max_frame_rate, "openh264 session created");
        Ok(OpenH264Session {
            width,
            height,
            jobs: Some(job_tx),
            worker: Some(worker),
        })
    }
}

fn build_encoder(bitrate_bps: u32, max_frame_rate: f32) -> Result<Encoder, EncoderError> {
    let config = EncoderConfig::new()
        .bitrate(BitRate::from_bps(bitrate_bps))
        .max_frame_rate(FrameRate::from_hz(max_frame_rate))
        .rate_control_mode(RateControlMode::Bitrate);
    Encoder::with_api_config(OpenH264API::from_source(), config)
        .map_err(|e| EncoderError::SessionCreation(e.to_string()))
}

fn run_worker(
    mut encoder: Encoder,
    width: u32,
    height: u32,
    jobs: Receiver<Job>,
    output: OutputCallback,
) {
    let w = width as usize;
    let h = height as usize;
    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut parameter_sets = Vec::new();

    while let Ok(job) = jobs.recv() {
        let y_plane = &job.yuv[..y_size];
        let u_plane = &job.yuv[y_size..y_size + uv_size];
        let v_plane = &job.yuv[y_size + uv_size..y_size + uv_size * 2];
        let yuv = YUVSlices::new((y_plane, u_plane, v_plane), (w, h), (w, w / 2, w / 2));

        let result = match encoder.encode(&yuv) {
            Ok(bitstream) => {
                let annexb = bitstream.to_vec();
                AccessUnit::from_annexb(&annexb, width, height, job.pts, &mut parameter_sets)
            }
            Err(e) => Err(CodecError::Encode(e.to_string())),
        };
        output(result);
    }

    debug!(width, height, "encoder worker exiting");
}

impl CompressionSession for OpenH264Session {
    fn set_properties(&mut self, properties: &SessionProperties) -> Result<(), EncoderError> {
        if properties.profile != Profile::Baseline {
            return Err(EncoderError::PropertyConfiguration(format!(
                "openh264 only produces baseline streams, {:?} requested",
                properties.profile
            )));
        }
        if properties.allow_frame_reordering {
            return Err(EncoderError::PropertyConfiguration(
                "frame reordering is not supported".into(),
            ));
        }
        if !properties.real_time {
            debug!("openh264 always encodes in real time, ignoring real_time = false");
        }
        Ok(())
    }

    fn encode_frame(&mut self, frame: &RawFrame) -> Result<(), EncoderError> {
        if (frame.width, frame.height) != (self.width, self.height) {
            return Err(EncoderError::InvalidFrame(format!(
                "frame is {}x{}, session is {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }
        let yuv = frame
            .to_i420()
            .map_err(|e| EncoderError::InvalidFrame(e.to_string()))?;

        let Some(jobs) = &self.jobs else {
            return Err(EncoderError::SessionLost);
        };
        match jobs.try_send(Job { yuv, pts: frame.pts }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(EncoderError::Busy),
            Err(TrySendError::Disconnected(_)) => Err(EncoderError::SessionLost),
        }
    }
}

impl Drop for OpenH264Session {
    fn drop(&mut self) {
        // Closing the queue lets the worker drain what is left and exit.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("encoder worker panicked");
            }
        }
    }
}
