use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use squirrelcam_common::config::Config;
use tracing::{info, warn};

use crate::h264::{AccessUnitInfo, Nalu, NaluSink};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to open output file {0}: {1}")]
    Open(String, std::io::Error),
    #[cfg(feature = "kafka")]
    #[error("failed to create Kafka producer: {0}")]
    KafkaCreate(String),
    #[error("sink.kind = \"kafka\" requires a [kafka] section")]
    MissingKafkaConfig,
    #[error("unknown sink kind {0:?}, expected \"annexb\", \"kafka\" or \"null\"")]
    UnknownKind(String),
    #[error("sink kind {0:?} is not compiled in")]
    NotCompiled(String),
}

/// Build the configured NALU sink.
pub fn build_sink(config: &Config) -> Result<Arc<dyn NaluSink>, SinkError> {
    match config.sink.kind.as_str() {
        "annexb" => Ok(Arc::new(AnnexBFileSink::create(Path::new(&config.sink.path))?)),
        "null" => Ok(Arc::new(NullSink::default())),
        "kafka" => {
            let kafka = config.kafka.as_ref().ok_or(SinkError::MissingKafkaConfig)?;
            build_kafka_sink(kafka, &config.sink.device_id)
        }
        other => Err(SinkError::UnknownKind(other.to_string())),
    }
}

#[cfg(feature = "kafka")]
fn build_kafka_sink(
    kafka: &squirrelcam_common::config::KafkaConfig,
    device_id: &str,
) -> Result<Arc<dyn NaluSink>, SinkError> {
    Ok(Arc::new(kafka_sink::KafkaSink::new(kafka, device_id)?))
}

#[cfg(not(feature = "kafka"))]
fn build_kafka_sink(
    _kafka: &squirrelcam_common::config::KafkaConfig,
    _device_id: &str,
) -> Result<Arc<dyn NaluSink>, SinkError> {
    Err(SinkError::NotCompiled("kafka".into()))
}

// ---------------------------------------------------------------------------
// Annex-B file
// ---------------------------------------------------------------------------

/// Appends the raw Annex-B byte stream to a `.h264` file, playable with
/// `ffplay` or remuxable with `ffmpeg -i capture.h264 -c copy out.mp4`.
pub struct AnnexBFileSink {
    writer: Mutex<BufWriter<File>>,
    bytes_written: AtomicU64,
}

impl AnnexBFileSink {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| SinkError::Open(path.display().to_string(), e))?;
        info!(path = %path.display(), "writing Annex-B stream");
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            bytes_written: AtomicU64::new(0),
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

impl NaluSink for AnnexBFileSink {
    fn push(&self, nalu: &Nalu) {
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        match writer.write_all(nalu.as_bytes()) {
            Ok(()) => {
                self.bytes_written
                    .fetch_add(nalu.as_bytes().len() as u64, Ordering::Relaxed);
            }
            Err(e) => warn!(error = %e, "failed to write NAL unit"),
        }
    }

    fn end_access_unit(&self, _info: &AccessUnitInfo) {
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = writer.flush() {
            warn!(error = %e, "failed to flush Annex-B output");
        }
    }
}

impl Drop for AnnexBFileSink {
    fn drop(&mut self) {
        info!(bytes_written = self.bytes_written(), "Annex-B stream closed");
    }
}

// ---------------------------------------------------------------------------
// Null
// ---------------------------------------------------------------------------

/// Discards everything; keeps counts.
#[derive(Debug, Default)]
pub struct NullSink {
    nalus: AtomicU64,
    access_units: AtomicU64,
}

impl NullSink {
    pub fn counts(&self) -> (u64, u64) {
        (
            self.nalus.load(Ordering::Relaxed),
            self.access_units.load(Ordering::Relaxed),
        )
    }
}

impl NaluSink for NullSink {
    fn push(&self, _nalu: &Nalu) {
        self.nalus.fetch_add(1, Ordering::Relaxed);
    }

    fn end_access_unit(&self, _info: &AccessUnitInfo) {
        self.access_units.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for NullSink {
    fn drop(&mut self) {
        let (nalus, access_units) = self.counts();
        info!(nalus, access_units, "null sink discarded output");
    }
}

// ---------------------------------------------------------------------------
// Kafka
// ---------------------------------------------------------------------------

#[cfg(feature = "kafka")]
pub mod kafka_sink {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use chrono::Utc;
    use rdkafka::producer::{BaseRecord, DefaultProducerContext, ThreadedProducer};
    use rdkafka::ClientConfig;
    use squirrelcam_common::config::KafkaConfig;
    use squirrelcam_common::frame::EncodedFrame;
    use tracing::{debug, info, warn};

    use super::SinkError;
    use crate::h264::{AccessUnitInfo, Nalu, NaluSink};

    /// Publishes one Kafka message per access unit, keyed `{device_id}:{ts_ms}`.
    pub struct KafkaSink {
        producer: ThreadedProducer<DefaultProducerContext>,
        topic: String,
        device_id: String,
        pending: Mutex<Vec<u8>>,
        seq: AtomicU64,
    }

    impl KafkaSink {
        pub fn new(config: &KafkaConfig, device_id: &str) -> Result<Self, SinkError> {
            let producer: ThreadedProducer<DefaultProducerContext> = ClientConfig::new()
                .set("bootstrap.servers", &config.brokers)
                .set("message.max.bytes", "1048576")
                .set("compression.type", &config.compression)
                .set("linger.ms", "5")
                .set("batch.num.messages", "10")
                .set("queue.buffering.max.messages", "1000")
                .set("request.timeout.ms", "5000")
                .create()
                .map_err(|e| SinkError::KafkaCreate(e.to_string()))?;
            info!(brokers = config.brokers, topic = config.topic, "kafka sink ready");
            Ok(Self {
                producer,
                topic: config.topic.clone(),
                device_id: device_id.to_string(),
                pending: Mutex::new(Vec::with_capacity(64 * 1024)),
                seq: AtomicU64::new(0),
            })
        }
    }

    impl NaluSink for KafkaSink {
        fn push(&self, nalu: &Nalu) {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.extend_from_slice(nalu.as_bytes());
        }

        fn end_access_unit(&self, info: &AccessUnitInfo) {
            let data = {
                let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
                std::mem::take(&mut *pending)
            };
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let now_ms = Utc::now().timestamp_millis();
            let payload = EncodedFrame::new(data, info.primary_nal_type, now_ms, seq).serialize();
            let key = format!("{}:{}", self.device_id, now_ms);

            debug!(seq, bytes = payload.len(), keyframe = info.keyframe, "producing access unit to Kafka");

            let record = BaseRecord::to(&self.topic).key(&key).payload(&payload);
            if let Err((e, _)) = self.producer.send(record) {
                warn!(error = %e, seq, "failed to produce access unit to Kafka");
            }
        }
    }
}
