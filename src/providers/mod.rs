pub mod bedrock;
pub mod openrouter;

use crate::events::Usage;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One turn of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub usage: Option<Usage>,
}

/// Events a streaming completion pushes to the consumer. `Done` carries the
/// full response; the conversation layer uses it as the end-of-stream hook.
#[derive(Debug)]
pub enum StreamEvent {
    Delta(String),
    Done(ChatResponse),
    Error(String),
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// One full-history completion.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        routing: Option<&str>,
    ) -> Result<ChatResponse>;

    /// Streaming completion: push deltas into `tx` as they arrive and return
    /// the accumulated response. Providers without wire-level streaming fall
    /// back to a single terminal chunk.
    async fn chat_streaming(
        &self,
        messages: &[ChatMessage],
        model: &str,
        routing: Option<&str>,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<ChatResponse> {
        let response = self.chat(messages, model, routing).await?;
        let _ = tx.send(StreamEvent::Delta(response.text.clone())).await;
        Ok(response)
    }
}

pub fn create_provider(name: &str, api_key: Option<&str>) -> Result<Arc<dyn Provider>> {
    match name {
        "openrouter" => Ok(Arc::new(openrouter::OpenRouterProvider::new(api_key))),
        "bedrock" => Ok(Arc::new(bedrock::BedrockProvider::new())),
        other => anyhow::bail!("Unknown provider: {other}"),
    }
}

/// Turn a non-2xx HTTP response into a readable error.
pub(crate) async fn api_error(provider: &str, response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    let trimmed: String = body.chars().take(500).collect();
    anyhow::anyhow!("{provider} API error ({status}): {trimmed}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, "system");
        assert_eq!(ChatMessage::user("u").role, "user");
        assert_eq!(ChatMessage::assistant("a").role, "assistant");
    }

    #[test]
    fn create_provider_rejects_unknown() {
        assert!(create_provider("parrot", None).is_err());
    }

    #[test]
    fn create_provider_known_names() {
        assert!(create_provider("openrouter", Some("k")).is_ok());
        assert!(create_provider("bedrock", None).is_ok());
    }

    #[tokio::test]
    async fn default_streaming_emits_single_delta() {
        struct Fixed;

        #[async_trait]
        impl Provider for Fixed {
            fn name(&self) -> &str {
                "fixed"
            }

            async fn chat(
                &self,
                _messages: &[ChatMessage],
                _model: &str,
                _routing: Option<&str>,
            ) -> Result<ChatResponse> {
                Ok(ChatResponse {
                    text: "whole response".into(),
                    usage: None,
                })
            }
        }

        let (tx, mut rx) = mpsc::channel(8);
        let response = Fixed
            .chat_streaming(&[ChatMessage::user("hi")], "m", None, &tx)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(response.text, "whole response");
        match rx.recv().await {
            Some(StreamEvent::Delta(chunk)) => assert_eq!(chunk, "whole response"),
            other => panic!("expected a single delta, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }
}
