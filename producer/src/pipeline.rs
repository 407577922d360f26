//! Per-frame work on the delivery thread and the hand-off to the analyzer.

use std::sync::Arc;

use squirrelcam_analyzer::{parse_reply, AnalysisRequest, Analyzer};
use squirrelcam_common::frame::RawFrame;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{Receiver, Sender, UnboundedSender};
use tracing::{debug, info, warn};

use crate::display::DisplayUpdate;
use crate::extract::{FrameExtractor, StillImagePayload};
use crate::h264::H264Encoder;
use crate::session::CompressionBackend;
use crate::trigger::CaptureTrigger;

/// Everything that happens to a frame on the delivery thread.
pub struct CapturePipeline<B: CompressionBackend> {
    encoder: H264Encoder<B>,
    trigger: Arc<CaptureTrigger>,
    extractor: FrameExtractor,
    dispatch: Sender<StillImagePayload>,
}

impl<B: CompressionBackend> CapturePipeline<B> {
    pub fn new(
        encoder: H264Encoder<B>,
        trigger: Arc<CaptureTrigger>,
        extractor: FrameExtractor,
        dispatch: Sender<StillImagePayload>,
    ) -> Self {
        Self {
            encoder,
            trigger,
            extractor,
            dispatch,
        }
    }

    /// Encode the frame and, if a capture was requested, extract a still
    /// from it. Never waits on the encoder or the analyzer.
    pub fn on_frame(&mut self, frame: &RawFrame) {
        self.encoder.submit(frame);

        if !self.trigger.drain_if_requested() {
            return;
        }

        let still = match self.extractor.extract(frame) {
            Ok(still) => still,
            Err(e) => {
                warn!(error = %e, pts_ms = frame.pts.as_millis() as u64, "still extraction failed, capture skipped");
                return;
            }
        };

        let (jpeg_bytes, width, height) = (still.jpeg.len(), still.width, still.height);
        let pts_ms = still.pts.as_millis() as u64;
        match self.dispatch.try_send(still) {
            Ok(()) => info!(jpeg_bytes, width, height, pts_ms, "still captured"),
            Err(TrySendError::Full(_)) => warn!("analyzer queue full, dropping still"),
            Err(TrySendError::Closed(_)) => warn!("analyzer worker stopped, dropping still"),
        }
    }
}

/// Send every captured still to the analyzer, reporting progress and the
/// outcome to the overlay. Each round trip runs as its own task.
pub async fn run_analysis_worker<A: Analyzer>(
    analyzer: Arc<A>,
    prompt: String,
    mut stills: Receiver<StillImagePayload>,
    display: UnboundedSender<DisplayUpdate>,
) {
    let prompt: Arc<str> = prompt.into();
    while let Some(still) = stills.recv().await {
        if display.send(DisplayUpdate::Processing).is_err() {
            debug!("overlay gone, stopping analysis worker");
            break;
        }

        let analyzer = Arc::clone(&analyzer);
        let display = display.clone();
        let request = AnalysisRequest::new(&*prompt, still.base64);
        let captured_at = still.captured_at;
        tokio::spawn(async move {
            let update = match analyzer.analyze(&request).await {
                Ok(reply) => {
                    debug!(%captured_at, reply = %reply, "analyzer replied");
                    DisplayUpdate::from(parse_reply(&reply))
                }
                Err(e) => {
                    warn!(error = %e, %captured_at, "analysis failed");
                    DisplayUpdate::Error(e.to_string())
                }
            };
            let _ = display.send(update);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::NaluSink;
    use crate::session::{CompressionSession, EncoderError, OutputCallback, SessionProperties};
    use crate::sink::NullSink;
    use squirrelcam_analyzer::AnalyzerError;
    use squirrelcam_common::frame::PixelFormat;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct SilentBackend;
    struct SilentSession;

    impl CompressionBackend for SilentBackend {
        type Session = SilentSession;

        fn create_session(&self, _w: u32, _h: u32, _out: OutputCallback) -> Result<SilentSession, EncoderError> {
            Ok(SilentSession)
        }
    }

    impl CompressionSession for SilentSession {
        fn set_properties(&mut self, _p: &SessionProperties) -> Result<(), EncoderError> {
            Ok(())
        }

        fn encode_frame(&mut self, _frame: &RawFrame) -> Result<(), EncoderError> {
            Ok(())
        }
    }

    struct FakeAnalyzer {
        reply: Result<String, String>,
        seen: Mutex<Vec<AnalysisRequest>>,
    }

    impl Analyzer for FakeAnalyzer {
        async fn analyze(&self, request: &AnalysisRequest) -> Result<String, AnalyzerError> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply.clone().map_err(AnalyzerError::Transport)
        }
    }

    fn frame(n: u64) -> RawFrame {
        RawFrame::new(vec![90; 8 * 8 * 4], 8, 8, PixelFormat::Bgra, Duration::from_millis(n * 33))
    }

    fn pipeline(capacity: usize) -> (CapturePipeline<SilentBackend>, Arc<CaptureTrigger>, mpsc::Receiver<StillImagePayload>) {
        let sink: Arc<dyn NaluSink> = Arc::new(NullSink::default());
        let trigger = Arc::new(CaptureTrigger::new());
        let (tx, rx) = mpsc::channel(capacity);
        let pipeline = CapturePipeline::new(
            H264Encoder::new(SilentBackend, sink),
            trigger.clone(),
            FrameExtractor::new(80),
            tx,
        );
        (pipeline, trigger, rx)
    }

    #[test]
    fn only_requested_frames_are_extracted() {
        let (mut pipeline, trigger, mut rx) = pipeline(4);
        pipeline.on_frame(&frame(0));
        assert!(rx.try_recv().is_err());

        trigger.request_capture();
        trigger.request_capture();
        pipeline.on_frame(&frame(1));
        pipeline.on_frame(&frame(2));

        let still = rx.try_recv().unwrap();
        assert_eq!(still.pts, Duration::from_millis(33));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn conversion_failure_consumes_the_trigger() {
        let (mut pipeline, trigger, mut rx) = pipeline(4);
        trigger.request_capture();
        let mut bad = frame(0);
        bad.data.truncate(10);
        pipeline.on_frame(&bad);
        pipeline.on_frame(&frame(1));
        assert!(rx.try_recv().is_err());
        assert!(!trigger.drain_if_requested());
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (mut pipeline, trigger, mut rx) = pipeline(1);
        for n in 0..3 {
            trigger.request_capture();
            pipeline.on_frame(&frame(n));
        }
        assert_eq!(rx.try_recv().unwrap().pts, Duration::ZERO);
        assert!(rx.try_recv().is_err());
    }

    async fn run_once(reply: Result<String, String>) -> (Vec<DisplayUpdate>, Vec<AnalysisRequest>) {
        let analyzer = Arc::new(FakeAnalyzer {
            reply,
            seen: Mutex::new(Vec::new()),
        });
        let (still_tx, still_rx) = mpsc::channel(4);
        let (display_tx, mut display_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_analysis_worker(
            analyzer.clone(),
            "react please".into(),
            still_rx,
            display_tx,
        ));

        still_tx
            .send(FrameExtractor::new(80).extract(&frame(0)).unwrap())
            .await
            .unwrap();
        drop(still_tx);

        let mut updates = Vec::new();
        while let Some(update) = display_rx.recv().await {
            updates.push(update);
        }
        worker.await.unwrap();
        let seen = analyzer.seen.lock().unwrap().clone();
        (updates, seen)
    }

    #[tokio::test]
    async fn reply_shows_processing_then_reaction() {
        let (updates, seen) = run_once(Ok("The trees are swaying.\n\nHappiness: 82%".into())).await;
        assert_eq!(
            updates,
            vec![
                DisplayUpdate::Processing,
                DisplayUpdate::Reaction {
                    text: "The trees are swaying.".into(),
                    happiness: 82.0
                },
            ]
        );
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].prompt, "react please");
        assert!(!seen[0].image_base64.is_empty());
    }

    #[tokio::test]
    async fn failure_shows_processing_then_error() {
        let (updates, _) = run_once(Err("connection reset".into())).await;
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0], DisplayUpdate::Processing);
        match &updates[1] {
            DisplayUpdate::Error(msg) => assert!(msg.contains("connection reset")),
            other => panic!("expected error update, got {other:?}"),
        }
    }
}
