//! OpenRouter-style chat-completion client.
//!
//! One HTTPS collaborator serves every model in a discussion: an
//! OpenAI-compatible gateway that routes by model id. This client is pure
//! transport: it serialises the transcript, carries the bearer credential
//! and attribution headers on every call, and classifies failures into the
//! four [`GatewayError`] kinds. What to send, and whether to retry, is the
//! caller's business.
//!
//! # Example
//!
//! ```rust,no_run
//! use concord::client_wrapper::{ChatMessage, ChatRole, GatewayClient};
//! use concord::clients::openrouter::OpenRouterClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = OpenRouterClient::new(&std::env::var("OPENROUTER_API_KEY")?)
//!     .with_attribution("https://example.org", "My Discussion App");
//!
//! let text = client
//!     .complete_text(
//!         &client.normalize("claude-sonnet-4.5"),
//!         &[ChatMessage::new(ChatRole::User, "Say hello.")],
//!         0.7,
//!         Some(64),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::client_wrapper::{ChatMessage, GatewayClient, GatewayError};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single instance keeps TLS sessions and DNS lookups warm, which
    /// matters when several discussions issue concurrent calls to the same
    /// gateway host. Per-call deadlines are applied per request, so the
    /// pool-level timeout here is only an upper backstop.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Built-in user-friendly → canonical model id mapping.
///
/// Consulted by [`OpenRouterClient::normalize`]; unknown names pass through.
/// The table is the compiled-in default; deployments override it through
/// [`EngineConfig::model_alias_table`](crate::config::EngineConfig).
pub fn default_alias_table() -> HashMap<String, String> {
    let mut table = HashMap::new();
    let entries: &[(&str, &str)] = &[
        ("gpt-4", "openai/gpt-5-chat"),
        ("gpt-4o", "openai/gpt-5-chat"),
        ("gpt-4-turbo", "openai/gpt-5-chat"),
        ("gpt-5", "openai/gpt-5-chat"),
        ("gpt-5-chat", "openai/gpt-5-chat"),
        ("claude-3-opus", "anthropic/claude-sonnet-4.5"),
        ("claude-3-sonnet", "anthropic/claude-sonnet-4.5"),
        ("claude-3.5-sonnet", "anthropic/claude-sonnet-4.5"),
        ("claude-4.5", "anthropic/claude-sonnet-4.5"),
        ("claude-sonnet-4.5", "anthropic/claude-sonnet-4.5"),
        ("gemini-pro", "google/gemini-2.5-pro"),
        ("gemini-1.5-pro", "google/gemini-2.5-pro"),
        ("gemini-2.5-pro", "google/gemini-2.5-pro"),
        ("gemini-ultra", "google/gemini-2.5-pro"),
        ("deepseek", "deepseek/deepseek-v3.2-exp"),
        ("deepseek-chat", "deepseek/deepseek-v3.2-exp"),
        ("deepseek-v3.2", "deepseek/deepseek-v3.2-exp"),
        ("mistral-large", "mistralai/mistral-large"),
    ];
    for (friendly, canonical) in entries {
        table.insert((*friendly).to_string(), (*canonical).to_string());
    }
    table
}

/// Client for an OpenRouter-compatible gateway.
pub struct OpenRouterClient {
    api_key: String,
    base_url: String,
    http_referer: String,
    app_name: String,
    per_call_timeout: Duration,
    aliases: HashMap<String, String>,
}

impl OpenRouterClient {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            http_referer: "https://github.com/concord-ai/concord".to_string(),
            app_name: "Concord Discussion Engine".to_string(),
            per_call_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            aliases: default_alias_table(),
        }
    }

    /// Point the client at a different gateway host (e.g. a local proxy).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override the attribution headers (`HTTP-Referer`, `X-Title`) carried
    /// on every call.
    pub fn with_attribution(
        mut self,
        http_referer: impl Into<String>,
        app_name: impl Into<String>,
    ) -> Self {
        self.http_referer = http_referer.into();
        self.app_name = app_name.into();
        self
    }

    /// Override the per-call deadline (default 60 s).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_call_timeout = timeout;
        self
    }

    /// Replace the alias table consulted by [`GatewayClient::normalize`].
    pub fn with_alias_table(mut self, aliases: HashMap<String, String>) -> Self {
        self.aliases = aliases;
        self
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn serialize_transcript(transcript: &[ChatMessage]) -> Vec<serde_json::Value> {
        transcript
            .iter()
            .map(|msg| {
                serde_json::json!({
                    "role": msg.role.wire_label(),
                    "content": msg.content.as_ref(),
                })
            })
            .collect()
    }

    /// POST a chat-completion body and return the assistant content string.
    ///
    /// Shared by the text and JSON paths; classifies every failure into one
    /// of the four [`GatewayError`] kinds.
    async fn post_chat(
        &self,
        model_id: &str,
        body: serde_json::Value,
    ) -> Result<String, GatewayError> {
        let url = self.chat_url();

        let response = get_shared_http_client()
            .post(&url)
            .timeout(self.per_call_timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.http_referer)
            .header("X-Title", &self.app_name)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if status.as_u16() == 401 || status.as_u16() == 403 {
            log::error!(
                "concord::clients::openrouter::post_chat(...): credentials rejected (HTTP {})",
                status
            );
            return Err(GatewayError::Auth(format!("HTTP {}: {}", status, text)));
        }

        if !status.is_success() {
            log::error!(
                "concord::clients::openrouter::post_chat(...): HTTP {} from {}: {}",
                status,
                url,
                text
            );
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                detail: text,
            });
        }

        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Decode(format!("malformed response body: {}", e)))?;

        if let Some(usage) = parsed.get("usage") {
            log::debug!(
                "concord::clients::openrouter: {} | tokens: {}",
                model_id,
                usage.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0)
            );
        }

        let content = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                GatewayError::Decode("no choices[0].message.content in response".to_string())
            })?;

        Ok(content.to_string())
    }

    /// Fetch the gateway's model catalog (`GET {base}/models`).
    ///
    /// Never called on the discussion hot path; surfaces failures to the
    /// caller instead of swallowing them.
    pub async fn available_models(&self) -> Result<Vec<serde_json::Value>, GatewayError> {
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));

        let response = get_shared_http_client()
            .get(&url)
            .timeout(self.per_call_timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.http_referer)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                detail: format!("model catalog fetch failed from {}", url),
            });
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        Ok(parsed
            .get("data")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl GatewayClient for OpenRouterClient {
    async fn complete_text(
        &self,
        model_id: &str,
        transcript: &[ChatMessage],
        temperature: f32,
        max_output_tokens: Option<u32>,
    ) -> Result<String, GatewayError> {
        let mut body = serde_json::json!({
            "model": model_id,
            "messages": Self::serialize_transcript(transcript),
            "temperature": temperature,
        });
        if let Some(cap) = max_output_tokens {
            body["max_tokens"] = serde_json::json!(cap);
        }

        let content = self.post_chat(model_id, body).await?;

        if content.trim().is_empty() {
            log::warn!(
                "concord::clients::openrouter::complete_text(...): empty response from {} ({} transcript entries)",
                model_id,
                transcript.len()
            );
            return Err(GatewayError::Decode(format!(
                "empty completion from {}",
                model_id
            )));
        }

        Ok(content)
    }

    async fn complete_json(
        &self,
        model_id: &str,
        transcript: &[ChatMessage],
        temperature: f32,
    ) -> Result<serde_json::Value, GatewayError> {
        let body = serde_json::json!({
            "model": model_id,
            "messages": Self::serialize_transcript(transcript),
            "temperature": temperature,
            "response_format": {"type": "json_object"},
        });

        let content = self.post_chat(model_id, body).await?;

        serde_json::from_str(&content).map_err(|e| {
            GatewayError::Decode(format!("unparseable JSON object from {}: {}", model_id, e))
        })
    }

    fn normalize(&self, user_friendly_name: &str) -> String {
        self.aliases
            .get(&user_friendly_name.to_lowercase())
            .cloned()
            .unwrap_or_else(|| user_friendly_name.to_string())
    }
}
