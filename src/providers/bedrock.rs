use crate::events::Usage;
use crate::providers::{ChatMessage, ChatResponse, Provider};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ── Credentials ────────────────────────────────────────────

/// AWS credentials plus the target region. Resolution goes through a
/// lookup closure so tests never have to touch process environment.
struct Credentials {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
    region: String,
}

impl Credentials {
    fn from_env() -> Option<Self> {
        Self::resolve(|name| std::env::var(name).ok())
    }

    fn resolve(get: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let clean = |name: &str| {
            get(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Some(Self {
            access_key: clean("AWS_ACCESS_KEY_ID")?,
            secret_key: clean("AWS_SECRET_ACCESS_KEY")?,
            session_token: clean("AWS_SESSION_TOKEN"),
            region: clean("AWS_REGION")
                .or_else(|| clean("AWS_DEFAULT_REGION"))
                .unwrap_or_else(|| "us-east-1".to_string()),
        })
    }
}

// ── Converse API types ─────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConverseRequest {
    messages: Vec<ConverseMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<SystemContent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inference_config: Option<InferenceConfig>,
}

impl ConverseRequest {
    /// Split a full conversation history into the Converse shape: system
    /// messages go into the dedicated `system` field, everything else stays
    /// in order as user/assistant turns.
    fn from_history(history: &[ChatMessage]) -> Self {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for message in history {
            if message.role == "system" {
                system_parts.push(SystemContent {
                    text: message.content.clone(),
                });
            } else {
                messages.push(ConverseMessage {
                    role: message.role.clone(),
                    content: vec![ContentBlock {
                        text: message.content.clone(),
                    }],
                });
            }
        }
        Self {
            messages,
            system: if system_parts.is_empty() {
                None
            } else {
                Some(system_parts)
            },
            inference_config: Some(InferenceConfig {
                max_tokens: Some(4096),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct ConverseMessage {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
struct ContentBlock {
    text: String,
}

#[derive(Debug, Serialize)]
struct SystemContent {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InferenceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseResponse {
    output: ConverseOutput,
    #[serde(default)]
    usage: Option<ConverseUsage>,
}

#[derive(Debug, Deserialize)]
struct ConverseOutput {
    message: ConverseOutputMessage,
}

#[derive(Debug, Deserialize)]
struct ConverseOutputMessage {
    content: Vec<ResponseContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ResponseContentBlock {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

// ── Request signing ────────────────────────────────────────

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

fn hash_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC key of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Everything the HTTP layer needs to attach to a signed request.
struct Signature {
    authorization: String,
    amz_date: String,
}

/// AWS Signature Version 4 for one service.
///
/// The flow: assemble the canonical request from the sorted signed-header
/// set, hash it into the string-to-sign under the credential scope, and MAC
/// that with a key derived by chaining the secret through date, region, and
/// service.
struct SigV4Signer<'a> {
    creds: &'a Credentials,
    service: &'static str,
}

impl<'a> SigV4Signer<'a> {
    fn new(creds: &'a Credentials, service: &'static str) -> Self {
        Self { creds, service }
    }

    /// Headers participating in the signature, sorted by name. The values
    /// also become the canonical-header block, so order matters for both.
    fn signed_headers(&self, host: &str, amz_date: &str) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("content-type", "application/json".to_string()),
            ("host", host.to_string()),
            ("x-amz-date", amz_date.to_string()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token", token.clone()));
        }
        headers.sort_by_key(|(name, _)| *name);
        headers
    }

    fn credential_scope(&self, date: &str) -> String {
        format!(
            "{date}/{}/{}/aws4_request",
            self.creds.region, self.service
        )
    }

    /// The signing key: the secret seeds an HMAC chain over date, region,
    /// service, and the fixed terminator.
    fn derived_key(&self, date: &str) -> Vec<u8> {
        let seed = format!("AWS4{}", self.creds.secret_key).into_bytes();
        [date, self.creds.region.as_str(), self.service, "aws4_request"]
            .iter()
            .fold(seed, |key, part| hmac(&key, part.as_bytes()))
    }

    fn sign(
        &self,
        method: &str,
        url: &reqwest::Url,
        body: &[u8],
        when: &chrono::DateTime<chrono::Utc>,
    ) -> Signature {
        let amz_date = when.format("%Y%m%dT%H%M%SZ").to_string();
        let date = when.format("%Y%m%d").to_string();

        let headers = self.signed_headers(url.host_str().unwrap_or_default(), &amz_date);
        let header_names = headers
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(";");
        let header_block: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();

        let canonical_request = format!(
            "{method}\n{}\n{}\n{header_block}\n{header_names}\n{}",
            url.path(),
            url.query().unwrap_or(""),
            hash_hex(body)
        );

        let scope = self.credential_scope(&date);
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hash_hex(canonical_request.as_bytes())
        );
        let signature = hex::encode(hmac(&self.derived_key(&date), string_to_sign.as_bytes()));

        Signature {
            authorization: format!(
                "{ALGORITHM} Credential={}/{scope}, SignedHeaders={header_names}, \
                 Signature={signature}",
                self.creds.access_key
            ),
            amz_date,
        }
    }
}

// ── BedrockProvider ────────────────────────────────────────

/// AWS Bedrock via the Converse API. No wire-level streaming here: the
/// default `chat_streaming` fallback delivers the reply as one chunk.
pub struct BedrockProvider {
    credentials: Option<Credentials>,
    client: Client,
}

impl BedrockProvider {
    pub fn new() -> Self {
        Self {
            credentials: Credentials::from_env(),
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Model ids may carry `:`, which must be percent-encoded in the path.
    fn endpoint(region: &str, model_id: &str) -> String {
        format!(
            "https://bedrock-runtime.{region}.amazonaws.com/model/{}/converse",
            model_id.replace(':', "%3A")
        )
    }
}

#[async_trait]
impl Provider for BedrockProvider {
    fn name(&self) -> &str {
        "bedrock"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        routing: Option<&str>,
    ) -> anyhow::Result<ChatResponse> {
        let creds = self.credentials.as_ref().ok_or_else(|| {
            anyhow::anyhow!(
                "AWS credentials not found; export AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY first."
            )
        })?;

        if routing.is_some() {
            tracing::debug!("Bedrock has no provider routing; hint ignored");
        }

        let request_body = ConverseRequest::from_history(messages);
        let body = serde_json::to_vec(&request_body)?;
        let url_str = Self::endpoint(&creds.region, model);
        let url: reqwest::Url = url_str.parse()?;

        let signature =
            SigV4Signer::new(creds, "bedrock").sign("POST", &url, &body, &chrono::Utc::now());

        let mut req = self
            .client
            .post(url_str)
            .header("content-type", "application/json")
            .header("x-amz-date", &signature.amz_date)
            .header("Authorization", &signature.authorization);

        if let Some(ref token) = creds.session_token {
            req = req.header("x-amz-security-token", token);
        }

        let response = req.body(body).send().await?;

        if !response.status().is_success() {
            return Err(super::api_error("Bedrock", response).await);
        }

        let converse_response: ConverseResponse = response.json().await?;
        let usage = converse_response.usage.map(|u| Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        });

        let text = converse_response
            .output
            .message
            .content
            .into_iter()
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            anyhow::bail!("No response from Bedrock");
        }
        Ok(ChatResponse { text, usage })
    }
}
