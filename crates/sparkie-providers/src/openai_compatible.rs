//! OpenAI-compatible streamed completion client.
//!
//! Posts `{model, messages, stream: true}` to `<base_url>/chat/completions` and
//! concatenates the `delta.content` of every streamed chunk until `[DONE]`.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use sparkie_core::config::CompletionConfig;
use sparkie_core::error::{Result, SparkieError};

use crate::completion::{CompletionClient, CompletionRequest};
use crate::sse::{SseDecoder, SseEvent};

pub struct OpenAiCompatibleClient {
    /// API key for bearer authentication.
    api_key: String,
    /// Base URL for the API (e.g., "https://opencode.ai/zen/v1").
    base_url: String,
    /// Path for chat completions.
    chat_path: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            chat_path: "/chat/completions".to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Build from config; fails with `ApiKeyMissing` when no credential resolves.
    pub fn from_config(config: &CompletionConfig) -> Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| SparkieError::ApiKeyMissing("completion".into()))?;
        Ok(Self::new(&config.base_url, &api_key))
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatibleClient {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let url = format!("{}{}", self.base_url, self.chat_path);
        let body = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": true,
        });

        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| SparkieError::Http(format!("completion connection failed ({url}): {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(SparkieError::Provider(format!(
                "completion API error {status}: {text}"
            )));
        }

        let mut decoder = SseDecoder::new();
        let mut output = String::new();
        let mut stream = resp.bytes_stream();

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SparkieError::Http(format!("completion stream: {e}")))?;
            for event in decoder.push(&chunk) {
                match event {
                    SseEvent::Delta(text) => output.push_str(&text),
                    SseEvent::Done => break 'read,
                }
            }
        }
        if let Some(SseEvent::Delta(text)) = decoder.finish() {
            output.push_str(&text);
        }

        tracing::debug!("completion stream finished ({} chars)", output.len());
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::ChatMessage;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![ChatMessage::user("Do the thing")],
            model: "kimi-k2.5-free".into(),
        }
    }

    fn sse_body(parts: &[&str]) -> String {
        let mut body = String::new();
        for part in parts {
            body.push_str(&format!(
                "data: {}\n\n",
                json!({"choices": [{"delta": {"content": part}}]})
            ));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[tokio::test]
    async fn test_concatenates_stream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"stream": true, "model": "kimi-k2.5-free"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse_body(&["Sent ", "the ", "report."]), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let client = OpenAiCompatibleClient::new(&server.uri(), "sk-test");
        let text = client.complete(&request()).await.unwrap();
        assert_eq!(text, "Sent the report.");
    }

    #[tokio::test]
    async fn test_content_after_done_is_ignored() {
        let server = MockServer::start().await;
        let mut body = sse_body(&["kept"]);
        body.push_str(&format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": "dropped"}}]})
        ));
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = OpenAiCompatibleClient::new(&server.uri(), "sk-test");
        assert_eq!(client.complete(&request()).await.unwrap(), "kept");
    }

    #[tokio::test]
    async fn test_error_status_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = OpenAiCompatibleClient::new(&server.uri(), "sk-test");
        let err = client.complete(&request()).await.unwrap_err();
        assert!(matches!(err, SparkieError::Provider(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_http_error() {
        let client = OpenAiCompatibleClient::new("http://127.0.0.1:1", "sk-test");
        let err = client.complete(&request()).await.unwrap_err();
        assert!(matches!(err, SparkieError::Http(_)));
    }

    #[test]
    fn test_from_config_without_key_fails() {
        let config = CompletionConfig {
            api_key: String::new(),
            ..CompletionConfig::default()
        };
        // Environment may carry a key on developer machines; only assert the error shape.
        if config.resolve_api_key().is_none() {
            assert!(matches!(
                OpenAiCompatibleClient::from_config(&config),
                Err(SparkieError::ApiKeyMissing(_))
            ));
        }
    }
}
