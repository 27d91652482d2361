//! # Sparkie Providers
//!
//! Clients for the autonomous completion service the scheduler delegates task
//! work to. Every client speaks the OpenAI-compatible streamed chat format and
//! returns the concatenated text of the stream.

pub mod completion;
pub mod openai_compatible;
pub mod sse;

use std::sync::Arc;

use sparkie_core::config::CompletionConfig;

pub use completion::{ChatMessage, CompletionClient, CompletionRequest, Role};
pub use openai_compatible::OpenAiCompatibleClient;

/// Create the completion client from configuration.
///
/// Returns `None` when no credential is configured; callers treat that as an
/// inert service rather than an error.
pub fn create_completion_client(config: &CompletionConfig) -> Option<Arc<dyn CompletionClient>> {
    match OpenAiCompatibleClient::from_config(config) {
        Ok(client) => {
            tracing::info!("Completion client ready ({}, model={})", config.base_url, config.model);
            Some(Arc::new(client))
        }
        Err(e) => {
            tracing::info!("Completion service not configured: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_key_creates_client() {
        let config = CompletionConfig {
            api_key: "sk-test".into(),
            ..CompletionConfig::default()
        };
        let client = create_completion_client(&config).unwrap();
        assert_eq!(client.name(), "openai-compatible");
    }
}
