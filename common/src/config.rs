use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    pub kafka: Option<KafkaConfig>,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_stream_url")]
    pub url: String,
    #[serde(default = "default_quality")]
    pub quality: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// Pattern mode only.
    #[serde(default = "default_width")]
    pub width: u32,
    /// Pattern mode only.
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_bitrate_bps")]
    pub bitrate_bps: u32,
    #[serde(default = "default_max_frame_rate")]
    pub max_frame_rate: f32,
    /// baseline | main | high
    #[serde(default = "default_profile")]
    pub profile: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_kind")]
    pub kind: String,
    #[serde(default = "default_sink_path")]
    pub path: String,
    #[serde(default = "default_device_id")]
    pub device_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_compression")]
    pub compression: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: f64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,
    #[serde(default = "default_volume_input")]
    pub volume_input: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            url: default_stream_url(),
            quality: default_quality(),
            fps: default_fps(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            bitrate_bps: default_bitrate_bps(),
            max_frame_rate: default_max_frame_rate(),
            profile: default_profile(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: default_sink_kind(),
            path: default_sink_path(),
            device_id: default_device_id(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            interval_secs: default_interval_secs(),
            volume_input: default_volume_input(),
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            api_key_env: default_api_key_env(),
            prompt: default_prompt(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.stream.fps > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "stream.fps must be positive, got {}",
                self.stream.fps
            )));
        }
        self.stream.frame_interval()?;
        self.trigger.initial_delay()?;
        self.trigger.period()?;
        if !(self.encoder.max_frame_rate > 0.0 && self.encoder.max_frame_rate.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "encoder.max_frame_rate must be positive and finite, got {}",
                self.encoder.max_frame_rate
            )));
        }
        if !matches!(self.encoder.profile.as_str(), "baseline" | "main" | "high") {
            return Err(ConfigError::Invalid(format!(
                "encoder.profile must be baseline, main or high, got {:?}",
                self.encoder.profile
            )));
        }
        if !(1..=100).contains(&self.extract.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "extract.jpeg_quality must be in 1..=100, got {}",
                self.extract.jpeg_quality
            )));
        }
        if self.extract.queue_capacity == 0 {
            return Err(ConfigError::Invalid("extract.queue_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

impl StreamConfig {
    /// Time between frames at the configured rate.
    pub fn frame_interval(&self) -> Result<Duration, ConfigError> {
        if !(self.fps > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "stream.fps must be positive, got {}",
                self.fps
            )));
        }
        nonzero_secs("stream.fps", 1.0 / self.fps)
    }
}

impl TriggerConfig {
    pub fn initial_delay(&self) -> Result<Duration, ConfigError> {
        secs("trigger.initial_delay_secs", self.initial_delay_secs)
    }

    pub fn period(&self) -> Result<Duration, ConfigError> {
        nonzero_secs("trigger.interval_secs", self.interval_secs)
    }
}

fn secs(key: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        ConfigError::Invalid(format!("{key} must be a finite, non-negative number of seconds, got {value}"))
    })
}

/// Like `secs`, but a period that rounds down to zero is rejected too.
fn nonzero_secs(key: &str, value: f64) -> Result<Duration, ConfigError> {
    match secs(key, value)? {
        d if d.is_zero() => Err(ConfigError::Invalid(format!(
            "{key} gives a zero-length period ({value})"
        ))),
        d => Ok(d),
    }
}

impl AnalyzerConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<String, ConfigError> {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(ConfigError::MissingCredential(self.api_key_env.clone())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("environment variable {0} is not set")]
    MissingCredential(String),
}

// Default value functions
fn default_mode() -> String {
    "pattern".into()
}
fn default_stream_url() -> String {
    "http://127.0.0.1:8080/stream".into()
}
fn default_quality() -> u32 {
    80
}
fn default_fps() -> f64 {
    30.0
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_bitrate_bps() -> u32 {
    1_000_000
}
fn default_max_frame_rate() -> f32 {
    30.0
}
fn default_profile() -> String {
    "baseline".into()
}
fn default_sink_kind() -> String {
    "annexb".into()
}
fn default_sink_path() -> String {
    "capture.h264".into()
}
fn default_device_id() -> String {
    "squirrelcam-001".into()
}
fn default_topic() -> String {
    "camera.h264".into()
}
fn default_compression() -> String {
    "snappy".into()
}
fn default_initial_delay_secs() -> f64 {
    5.0
}
fn default_interval_secs() -> f64 {
    10.0
}
fn default_volume_input() -> String {
    "none".into()
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_queue_capacity() -> usize {
    4
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "anthropic/claude-haiku-4.5".into()
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_prompt() -> String {
    "You are a squirrel. Give a short, direct, one-sentence (less than 15 words) \
     reaction to this image.\nOn a new line, give a \"squirrel happiness percentage\" \
     as a number (e.g., 85%)."
        .into()
}
fn default_log_level() -> String {
    "info".into()
}
