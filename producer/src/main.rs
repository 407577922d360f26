mod display;
mod extract;
mod h264;
#[cfg(feature = "openh264")]
mod openh264_session;
mod pipeline;
mod session;
mod sink;
mod source;
mod trigger;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use squirrelcam_analyzer::OpenRouterClient;
use squirrelcam_common::config::{Config, StreamConfig};
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::extract::FrameExtractor;
use crate::h264::{H264Encoder, NaluSink};
use crate::pipeline::CapturePipeline;
use crate::session::{CompressionBackend, SessionProperties};
use crate::source::{FrameFeed, PatternSource, SourceError};
use crate::trigger::CaptureTrigger;

/// Frames buffered between the source and the delivery thread.
const DELIVERY_QUEUE_DEPTH: usize = 2;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match log_filter(&config.logging.level) {
            Ok(filter) => filter,
            Err(e) => {
                eprintln!("Invalid logging.level {:?}: {e}", config.logging.level);
                std::process::exit(1);
            }
        },
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        mode = config.stream.mode,
        sink = config.sink.kind,
        model = config.analyzer.model,
        "starting squirrelcam"
    );

    if !matches!(config.stream.mode.as_str(), "mjpeg" | "polling" | "pattern") {
        error!(
            mode = config.stream.mode,
            "unknown stream mode, expected 'mjpeg', 'polling' or 'pattern'"
        );
        std::process::exit(1);
    }

    let analyzer = match config
        .analyzer
        .api_key()
        .map_err(|e| e.to_string())
        .and_then(|key| OpenRouterClient::new(&config.analyzer, key).map_err(|e| e.to_string()))
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to set up analyzer client");
            std::process::exit(1);
        }
    };

    let sink = match sink::build_sink(&config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create NALU sink");
            std::process::exit(1);
        }
    };

    #[cfg(feature = "openh264")]
    {
        let backend = openh264_session::OpenH264Backend::new(&config.encoder);
        run(config, backend, analyzer, sink).await;
    }

    #[cfg(not(feature = "openh264"))]
    {
        let _ = (analyzer, sink);
        error!("no H.264 backend compiled in, rebuild with the `openh264` feature");
        std::process::exit(1);
    }
}

/// A bare word in `logging.level` must be a level; anything else is
/// taken as full filter directives.
fn log_filter(level: &str) -> Result<EnvFilter, String> {
    if !level.contains(['=', ',']) && level.trim().parse::<LevelFilter>().is_err() {
        return Err("expected trace, debug, info, warn, error, off or filter directives".into());
    }
    EnvFilter::try_new(level).map_err(|e| e.to_string())
}

async fn run<B>(config: Config, backend: B, analyzer: OpenRouterClient, sink: Arc<dyn NaluSink>)
where
    B: CompressionBackend + 'static,
{
    let timing = config.trigger.initial_delay().and_then(|delay| {
        let period = config.trigger.period()?;
        let frame_interval = config.stream.frame_interval()?;
        Ok((delay, period, frame_interval))
    });
    let (initial_delay, period, frame_interval) = match timing {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "invalid timing configuration");
            std::process::exit(1);
        }
    };
    let Some(properties) = SessionProperties::for_profile(&config.encoder.profile) else {
        error!(profile = config.encoder.profile, "unknown encoder profile");
        std::process::exit(1);
    };

    let trigger = Arc::new(CaptureTrigger::new());
    trigger::spawn_interval_trigger(trigger.clone(), initial_delay, period);
    match config.trigger.volume_input.as_str() {
        "stdin" => {
            // Detached: a read blocked on stdin must not hold up exit.
            if let Err(e) = trigger::spawn_stdin_volume_input(trigger.clone()) {
                error!(error = %e, "failed to start volume input thread");
            }
        }
        "none" => {}
        other => warn!(volume_input = other, "unknown volume input, ignoring"),
    }

    let (still_tx, still_rx) = tokio::sync::mpsc::channel(config.extract.queue_capacity);
    let (display_tx, display_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(pipeline::run_analysis_worker(
        Arc::new(analyzer),
        config.analyzer.prompt.clone(),
        still_rx,
        display_tx,
    ));

    let mut pipeline = CapturePipeline::new(
        H264Encoder::new(backend, sink).with_properties(properties),
        trigger,
        FrameExtractor::new(config.extract.jpeg_quality),
        still_tx,
    );

    let (frame_tx, frame_rx) = std::sync::mpsc::sync_channel(DELIVERY_QUEUE_DEPTH);
    let pattern = PatternSource::new(config.stream.width, config.stream.height);
    let delivery = match source::spawn_delivery_thread(frame_rx, pattern, move |frame| {
        pipeline.on_frame(frame)
    }) {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to start frame delivery thread");
            std::process::exit(1);
        }
    };

    let stream = config.stream.clone();
    let source_task = tokio::spawn(async move {
        let feed = FrameFeed::new(frame_tx);
        let result = run_source(&stream, frame_interval, &feed).await;
        info!(dropped = feed.dropped(), "frame source stopped");
        result
    });

    // The main task owns the overlay.
    tokio::select! {
        _ = display::run_overlay(display_rx) => {
            warn!("analysis worker exited");
        }
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutting down");
        }
    }

    source_task.abort();
    match source_task.await {
        Ok(Err(e)) => warn!(error = %e, "frame source ended with error"),
        Ok(Ok(())) | Err(_) => {}
    }
    // Dropping the feed ends the delivery thread, which flushes the encoder.
    if let Ok(Err(_)) = tokio::task::spawn_blocking(move || delivery.join()).await {
        error!("frame delivery thread panicked");
    }
}

async fn run_source(
    stream: &StreamConfig,
    frame_interval: Duration,
    feed: &FrameFeed,
) -> Result<(), SourceError> {
    match stream.mode.as_str() {
        "mjpeg" => {
            let url = format!(
                "{}?quality={}&fps={}",
                stream.url, stream.quality, stream.fps
            );
            source::run_mjpeg_source(&url, feed).await
        }
        "polling" => {
            let url = format!(
                "{}?quality={}",
                stream.url.replace("/stream", "/frame"),
                stream.quality
            );
            source::run_polling_source(&url, frame_interval, feed).await
        }
        _ => {
            info!(
                width = stream.width,
                height = stream.height,
                fps = stream.fps,
                "generating test pattern"
            );
            source::run_pattern_source(frame_interval, feed).await
        }
    }
}
