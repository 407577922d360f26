use std::time::Duration;

use serde::{Deserialize, Serialize};
use squirrelcam_common::config::AnalyzerConfig;
use tracing::{debug, warn};

use crate::{AnalysisRequest, Analyzer, AnalyzerError};

/// OpenRouter chat-completions client for single-image questions.
pub struct OpenRouterClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage<'a>>,
    pub max_tokens: u32,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage<'a> {
    pub role: &'static str,
    pub content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Anthropic-style body, returned by some OpenRouter routes.
#[derive(Debug, Deserialize)]
struct ClaudeReply {
    output_text: Option<String>,
    content: Option<Vec<ClaudeContent>>,
}

#[derive(Debug, Deserialize)]
struct ClaudeContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

impl OpenRouterClient {
    pub fn new(config: &AnalyzerConfig, api_key: String) -> Result<Self, AnalyzerError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AnalyzerError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    pub fn chat_request<'a>(&'a self, request: &'a AnalysisRequest) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: &request.prompt,
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: request.image_data_url(),
                        },
                    },
                ],
            }],
            max_tokens: self.max_tokens,
        }
    }
}

impl Analyzer for OpenRouterClient {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, AnalyzerError> {
        let body = self.chat_request(request);
        debug!(
            model = self.model,
            image_b64_bytes = request.image_base64.len(),
            "sending still to analyzer"
        );

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalyzerError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AnalyzerError::Transport(e.to_string()))?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "analyzer returned non-success status");
            return Err(AnalyzerError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        debug!(raw = %text, "raw analyzer response");
        decode_reply(&text)
    }
}

/// Pull the reply text out of a response body, accepting either the
/// OpenAI-compatible or the Anthropic-style shape.
pub fn decode_reply(body: &str) -> Result<String, AnalyzerError> {
    if let Ok(completion) = serde_json::from_str::<ChatCompletion>(body) {
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AnalyzerError::Format("response contained no choices".into()))?;
        return choice
            .message
            .content
            .ok_or_else(|| AnalyzerError::Format("first choice has no content".into()));
    }

    if let Ok(err) = serde_json::from_str::<ErrorReply>(body) {
        return Err(AnalyzerError::Transport(err.error.message));
    }

    match serde_json::from_str::<ClaudeReply>(body) {
        Ok(ClaudeReply {
            output_text: Some(text),
            ..
        }) => Ok(text),
        Ok(ClaudeReply {
            content: Some(items),
            ..
        }) => items
            .into_iter()
            .find_map(|item| item.text)
            .ok_or_else(|| AnalyzerError::Format("response content has no text".into())),
        Ok(_) => Err(AnalyzerError::Format("response has no text content".into())),
        Err(e) => Err(AnalyzerError::Format(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(Option<String>, Value)>>>;

    async fn spawn_mock(status: StatusCode, reply: Value) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route(
                "/api/v1/chat/completions",
                post(
                    move |State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>| {
                        let reply = reply.clone();
                        async move {
                            let auth = headers
                                .get("authorization")
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string);
                            seen.lock().unwrap().push((auth, body));
                            (status, Json(reply))
                        }
                    },
                ),
            )
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/api/v1"), seen)
    }

    fn client_for(base_url: String) -> OpenRouterClient {
        let config = AnalyzerConfig {
            base_url,
            timeout_secs: 5,
            ..AnalyzerConfig::default()
        };
        OpenRouterClient::new(&config, "test-key".into()).unwrap()
    }

    #[test]
    fn request_body_shape() {
        let client = client_for("http://localhost/api/v1/".into());
        assert_eq!(client.endpoint, "http://localhost/api/v1/chat/completions");

        let request = AnalysisRequest::new("react to this", "AAAA");
        let body = serde_json::to_value(client.chat_request(&request)).unwrap();
        assert_eq!(body["model"], "anthropic/claude-haiku-4.5");
        assert_eq!(body["max_tokens"], 2048);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0], json!({"type": "text", "text": "react to this"}));
        assert_eq!(
            body["messages"][0]["content"][1],
            json!({"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,AAAA"}})
        );
    }

    #[test]
    fn decodes_openai_shape() {
        let body = r#"{"id":"x","choices":[{"message":{"role":"assistant","content":"Nuts!\n90%"}}]}"#;
        assert_eq!(decode_reply(body).unwrap(), "Nuts!\n90%");
    }

    #[test]
    fn decodes_claude_shapes() {
        assert_eq!(decode_reply(r#"{"output_text":"hello"}"#).unwrap(), "hello");
        let body = r#"{"content":[{"type":"thinking"},{"type":"text","text":"from content"}]}"#;
        assert_eq!(decode_reply(body).unwrap(), "from content");
    }

    #[test]
    fn empty_choices_is_a_format_error() {
        assert!(matches!(decode_reply(r#"{"choices":[]}"#), Err(AnalyzerError::Format(_))));
        assert!(matches!(decode_reply("not json"), Err(AnalyzerError::Format(_))));
        assert!(matches!(decode_reply(r#"{"id":"nothing"}"#), Err(AnalyzerError::Format(_))));
    }

    #[test]
    fn embedded_error_body_is_transport() {
        let err = decode_reply(r#"{"error":{"message":"rate limited","code":429}}"#).unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("rate limited"));
    }

    #[tokio::test]
    async fn round_trip_against_mock_server() {
        let (base_url, seen) = spawn_mock(
            StatusCode::OK,
            json!({"choices": [{"message": {"content": "The trees are swaying.\n\nHappiness: 82%"}}]}),
        )
        .await;
        let client = client_for(base_url);

        let reply = client
            .analyze(&AnalysisRequest::new("prompt", "Zm9v"))
            .await
            .unwrap();
        assert_eq!(reply, "The trees are swaying.\n\nHappiness: 82%");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (auth, body) = &seen[0];
        assert_eq!(auth.as_deref(), Some("Bearer test-key"));
        assert_eq!(
            body["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,Zm9v"
        );
    }

    #[tokio::test]
    async fn http_error_status_is_reported() {
        let (base_url, _seen) = spawn_mock(
            StatusCode::UNAUTHORIZED,
            json!({"error": {"message": "bad key", "code": 401}}),
        )
        .await;
        let client = client_for(base_url);

        let err = client
            .analyze(&AnalysisRequest::new("prompt", "Zm9v"))
            .await
            .unwrap_err();
        match err {
            AnalyzerError::Status { status, body } => {
                assert_eq!(status, 401);
                assert!(body.contains("bad key"));
            }
            other => panic!("expected Status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_server_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = client_for(format!("http://{addr}/api/v1"));
        let err = client
            .analyze(&AnalysisRequest::new("prompt", "Zm9v"))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::Transport(_)));
    }
}
