use crate::events::Usage;
use crate::providers::{ChatMessage, ChatResponse, Provider, StreamEvent};
use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

const API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

// ── Chat completion types ──────────────────────────────────

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<RoutingPreference>,
}

/// OpenRouter routing hint: pin the upstream provider order.
#[derive(Debug, Serialize)]
struct RoutingPreference {
    order: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl WireUsage {
    fn into_usage(self) -> Usage {
        Usage {
            input_tokens: self.prompt_tokens,
            output_tokens: self.completion_tokens,
        }
    }
}

// ── OpenRouterProvider ─────────────────────────────────────

pub struct OpenRouterProvider {
    api_key: Option<String>,
    client: Client,
}

impl OpenRouterProvider {
    pub fn new(api_key: Option<&str>) -> Self {
        Self {
            api_key: api_key.map(str::to_string),
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "OpenRouter API key not set. Set OPENROUTER_API_KEY or api_key in config."
            )
        })
    }

    fn request(
        &self,
        messages: &[ChatMessage],
        model: &str,
        routing: Option<&str>,
        stream: bool,
    ) -> Result<reqwest::RequestBuilder> {
        let body = CompletionRequest {
            model,
            messages,
            stream,
            provider: routing.map(|hint| RoutingPreference {
                order: vec![hint.to_string()],
            }),
        };
        Ok(self
            .client
            .post(API_URL)
            .header("Authorization", format!("Bearer {}", self.key()?))
            .header("Content-Type", "application/json")
            .json(&body))
    }
}

/// Extract the delta text and any usage block from one SSE `data:` payload.
fn parse_sse_data(data: &str) -> (Option<String>, Option<Usage>) {
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) else {
        return (None, None);
    };
    let delta = parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let usage = parsed
        .get("usage")
        .and_then(|u| serde_json::from_value::<WireUsage>(u.clone()).ok())
        .map(WireUsage::into_usage);
    (delta, usage)
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        routing: Option<&str>,
    ) -> Result<ChatResponse> {
        let response = self.request(messages, model, routing, false)?.send().await?;
        if !response.status().is_success() {
            return Err(super::api_error("OpenRouter", response).await);
        }

        let completion: CompletionResponse = response.json().await?;
        let text = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("No choices in OpenRouter response"))?;
        Ok(ChatResponse {
            text,
            usage: completion.usage.map(WireUsage::into_usage),
        })
    }

    async fn chat_streaming(
        &self,
        messages: &[ChatMessage],
        model: &str,
        routing: Option<&str>,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<ChatResponse> {
        let response = self.request(messages, model, routing, true)?.send().await?;
        if !response.status().is_success() {
            return Err(super::api_error("OpenRouter", response).await);
        }

        let mut accumulated = String::new();
        let mut usage: Option<Usage> = None;
        let mut stream = response.bytes_stream();
        // SSE frames can split anywhere; carry the partial line across chunks.
        let mut leftover = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let combined = format!("{leftover}{}", String::from_utf8_lossy(&chunk));
            leftover.clear();

            let mut lines: Vec<&str> = combined.split('\n').collect();
            if !combined.ends_with('\n') {
                if let Some(last) = lines.pop() {
                    leftover = last.to_string();
                }
            }

            for line in lines {
                let line = line.trim();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                let (delta, chunk_usage) = parse_sse_data(data);
                if let Some(delta) = delta {
                    accumulated.push_str(&delta);
                    if tx.send(StreamEvent::Delta(delta)).await.is_err() {
                        // Consumer hung up (early break); stop reading.
                        return Ok(ChatResponse {
                            text: accumulated,
                            usage,
                        });
                    }
                }
                if let Some(u) = chunk_usage {
                    usage = Some(u);
                }
            }
        }

        Ok(ChatResponse {
            text: accumulated,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_without_routing() {
        let req = CompletionRequest {
            model: "anthropic/claude-sonnet-4",
            messages: &[ChatMessage::user("hello")],
            stream: true,
            provider: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"stream\":true"));
        assert!(!json.contains("\"provider\""));
    }

    #[test]
    fn request_serializes_routing_order() {
        let req = CompletionRequest {
            model: "m",
            messages: &[],
            stream: false,
            provider: Some(RoutingPreference {
                order: vec!["groq".into()],
            }),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"provider\":{\"order\":[\"groq\"]}"));
    }

    #[test]
    fn sse_data_extracts_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        let (delta, usage) = parse_sse_data(data);
        assert_eq!(delta.as_deref(), Some("Hel"));
        assert!(usage.is_none());
    }

    #[test]
    fn sse_data_extracts_usage() {
        let data = r#"{"choices":[{"delta":{}}],"usage":{"prompt_tokens":12,"completion_tokens":7}}"#;
        let (delta, usage) = parse_sse_data(data);
        assert!(delta.is_none());
        assert_eq!(
            usage,
            Some(Usage {
                input_tokens: 12,
                output_tokens: 7
            })
        );
    }

    #[test]
    fn sse_data_tolerates_garbage() {
        let (delta, usage) = parse_sse_data("not json at all");
        assert!(delta.is_none());
        assert!(usage.is_none());
    }

    #[test]
    fn completion_response_deserializes() {
        let json = r#"{
            "choices": [{"message": {"role": "assistant", "content": "Hi!"}}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2}
        }"#;
        let resp: CompletionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.choices[0].message.content, "Hi!");
        assert_eq!(resp.usage.as_ref().unwrap().completion_tokens, 2);
    }

    #[tokio::test]
    async fn chat_errors_without_api_key() {
        let provider = OpenRouterProvider::new(None);
        let err = provider
            .chat(&[ChatMessage::user("hi")], "m", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("API key not set"));
    }
}
