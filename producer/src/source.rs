use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use image::ImageReader;
use squirrelcam_common::frame::{PixelFormat, RawFrame};
use tracing::{debug, error, info, warn};

const BOUNDARY: &[u8] = b"--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("failed to decode JPEG frame: {0}")]
    Decode(#[from] image::ImageError),
    #[error("frame delivery thread has stopped")]
    DeliveryClosed,
}

/// What a source hands to the delivery thread.
#[derive(Debug)]
pub enum SourceFrame {
    /// Compressed camera frame, decoded on the delivery thread.
    Jpeg { data: Bytes, pts: Duration },
    /// Synthetic frame number `seq`, rendered on the delivery thread.
    Pattern { seq: u64, pts: Duration },
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Sending half of the source → delivery-thread queue.
///
/// Timestamps are taken on arrival, relative to when the feed was created.
/// If the delivery thread is behind, new frames are dropped rather than
/// queued.
pub struct FrameFeed {
    tx: SyncSender<SourceFrame>,
    started: Instant,
    seq: AtomicU64,
    dropped: AtomicU64,
}

impl FrameFeed {
    pub fn new(tx: SyncSender<SourceFrame>) -> Self {
        Self {
            tx,
            started: Instant::now(),
            seq: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn offer_jpeg(&self, data: Bytes) -> Result<(), SourceError> {
        let pts = self.started.elapsed();
        self.offer(SourceFrame::Jpeg { data, pts })
    }

    pub fn offer_pattern(&self) -> Result<(), SourceError> {
        let pts = self.started.elapsed();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.offer(SourceFrame::Pattern { seq, pts })
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn offer(&self, frame: SourceFrame) -> Result<(), SourceError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(dropped, "delivery thread busy, dropping late frame");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(SourceError::DeliveryClosed),
        }
    }
}

/// Run `on_frame` for every frame on a dedicated `frame-delivery` thread,
/// strictly in arrival order.
pub fn spawn_delivery_thread<F>(
    rx: Receiver<SourceFrame>,
    pattern: PatternSource,
    mut on_frame: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnMut(&RawFrame) + Send + 'static,
{
    thread::Builder::new()
        .name("frame-delivery".into())
        .spawn(move || {
            let mut delivered: u64 = 0;
            while let Ok(frame) = rx.recv() {
                let raw = match frame {
                    SourceFrame::Jpeg { data, pts } => match decode_jpeg(&data, pts) {
                        Ok(raw) => raw,
                        Err(e) => {
                            warn!(error = %e, bytes = data.len(), "skipping undecodable frame");
                            continue;
                        }
                    },
                    SourceFrame::Pattern { seq, pts } => pattern.render(seq, pts),
                };
                on_frame(&raw);
                delivered += 1;
                if delivered % 300 == 0 {
                    debug!(delivered, "frames delivered");
                }
            }
            info!(delivered, "frame delivery finished");
        })
}

/// Decode one JPEG into an RGBA frame. Odd dimensions are cropped by one
/// pixel so the frame can be chroma-subsampled.
pub fn decode_jpeg(data: &[u8], pts: Duration) -> Result<RawFrame, SourceError> {
    let mut rgba = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?
        .decode()?
        .to_rgba8();

    let (w, h) = rgba.dimensions();
    let (even_w, even_h) = (w & !1, h & !1);
    if (even_w, even_h) != (w, h) {
        rgba = image::imageops::crop_imm(&rgba, 0, 0, even_w, even_h).to_image();
    }

    let (width, height) = rgba.dimensions();
    Ok(RawFrame::new(rgba.into_raw(), width, height, PixelFormat::Rgba, pts))
}

// ---------------------------------------------------------------------------
// MJPEG multipart stream
// ---------------------------------------------------------------------------

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental `multipart/x-mixed-replace` parser.
pub struct MjpegParser {
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
}

impl Default for MjpegParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MjpegParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
        }
    }

    /// Feed one chunk; returns every JPEG completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY) {
                        let _ = self.buffer.split_to(pos + BOUNDARY.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep last few bytes in case boundary spans chunks
                        if self.buffer.len() > BOUNDARY.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - BOUNDARY.len());
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) = find_subsequence(&self.buffer[self.jpeg_start..], BOUNDARY)
                    else {
                        // Don't rescan what has already been searched.
                        self.jpeg_start = self.buffer.len().saturating_sub(BOUNDARY.len());
                        break;
                    };
                    let jpeg_end = self.jpeg_start + pos;
                    // Strip trailing \r\n before boundary
                    let end = if self.buffer[..jpeg_end].ends_with(b"\r\n") {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };

                    let part = self.buffer.split_to(jpeg_end + BOUNDARY.len()).freeze();
                    if end > 0 {
                        frames.push(part.slice(..end));
                    }
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        frames
    }
}

/// Consume the MJPEG stream and feed frames to the delivery thread.
/// Reconnects with exponential backoff on failure; returns only once the
/// delivery thread is gone.
pub async fn run_mjpeg_source(stream_url: &str, feed: &FrameFeed) -> Result<(), SourceError> {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);

    loop {
        info!(url = stream_url, "connecting to MJPEG stream");
        match consume_stream(stream_url, feed).await {
            Ok(()) => {
                info!("stream ended cleanly, reconnecting");
                backoff = Duration::from_secs(2);
            }
            Err(SourceError::DeliveryClosed) => return Err(SourceError::DeliveryClosed),
            Err(e) => {
                error!(error = %e, "stream error, reconnecting in {:?}", backoff);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn consume_stream(url: &str, feed: &FrameFeed) -> Result<(), SourceError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(SourceError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(SourceError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(SourceError::HttpStatus(response.status().as_u16()));
    }

    info!(status = %response.status(), "connected to MJPEG stream");

    let mut byte_stream = response.bytes_stream();
    let mut parser = MjpegParser::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(SourceError::HttpStream)?;
        for jpeg in parser.push(&chunk) {
            feed.offer_jpeg(jpeg)?;
        }
    }

    Ok(())
}

/// Polling fallback: periodically fetch single frames.
pub async fn run_polling_source(
    frame_url: &str,
    interval: Duration,
    feed: &FrameFeed,
) -> Result<(), SourceError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(SourceError::HttpConnect)?;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        match client.get(frame_url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(jpeg) => feed.offer_jpeg(jpeg)?,
                Err(e) => warn!(error = %e, "failed to read camera frame body"),
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "non-success response from camera");
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch camera frame");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Test pattern
// ---------------------------------------------------------------------------

/// Synthetic RGBA frames: a horizontal gradient with a bright bar sweeping
/// across it, one pixel column per frame.
#[derive(Debug, Clone, Copy)]
pub struct PatternSource {
    pub width: u32,
    pub height: u32,
}

impl PatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(2) & !1,
            height: height.max(2) & !1,
        }
    }

    pub fn render(&self, seq: u64, pts: Duration) -> RawFrame {
        let w = self.width as usize;
        let h = self.height as usize;
        let bar = (seq % self.width as u64) as usize;
        let bar_width = (w / 16).max(1);
        let mut data = vec![0u8; w * h * 4];

        for (i, px) in data.chunks_exact_mut(4).enumerate() {
            let x = i % w;
            let y = i / w;
            if x >= bar && x < bar + bar_width {
                px.copy_from_slice(&[255, 255, 255, 255]);
            } else {
                px[0] = (x * 255 / w) as u8;
                px[1] = (y * 255 / h) as u8;
                px[2] = (seq % 256) as u8;
                px[3] = 255;
            }
        }

        RawFrame::new(data, self.width, self.height, PixelFormat::Rgba, pts)
    }
}

/// Tick the delivery thread at `fps` with pattern frames.
pub async fn run_pattern_source(interval: Duration, feed: &FrameFeed) -> Result<(), SourceError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        feed.offer_pattern()?;
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
