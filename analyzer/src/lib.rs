//! Still-image analysis for squirrelcam.
//!
//! The capture pipeline only depends on the [`Analyzer`] contract: a prompt
//! and a base64 JPEG go in, free text comes out. [`OpenRouterClient`] is the
//! production implementation; [`reaction`] turns the free text into what the
//! overlay shows.

use std::future::Future;

pub mod client;
pub mod reaction;

pub use client::OpenRouterClient;
pub use reaction::{parse_reply, ParsedReply};

/// One still frame plus the task prompt it should be judged against.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub prompt: String,
    /// Base64 (standard alphabet, padded) JPEG bytes.
    pub image_base64: String,
}

impl AnalysisRequest {
    pub fn new(prompt: impl Into<String>, image_base64: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image_base64: image_base64.into(),
        }
    }

    /// The image as an inline `data:` URL.
    pub fn image_data_url(&self) -> String {
        format!("data:image/jpeg;base64,{}", self.image_base64)
    }
}

/// Remote vision/language service that answers a prompt about an image.
pub trait Analyzer: Send + Sync + 'static {
    fn analyze(
        &self,
        request: &AnalysisRequest,
    ) -> impl Future<Output = Result<String, AnalyzerError>> + Send;
}

/// Failures of the analyzer round trip. The remote side only ever gives us
/// strings, so every variant carries a description rather than a code.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("analyzer request failed: {0}")]
    Transport(String),
    #[error("analyzer returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected analyzer response: {0}")]
    Format(String),
}

impl AnalyzerError {
    /// True for failures of the network leg (as opposed to an unreadable reply).
    pub fn is_transport(&self) -> bool {
        matches!(self, AnalyzerError::Transport(_) | AnalyzerError::Status { .. })
    }
}
