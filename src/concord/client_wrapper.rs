//! Shared primitives for gateway-agnostic LLM access.
//!
//! The discussion engine talks to exactly one outbound collaborator: a
//! chat-completion gateway. Everything above the wire goes through the
//! [`GatewayClient`] trait and the lightweight data types in this module, so
//! the engine itself never knows which vendor (or which test double) is on
//! the other side.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use concord::client_wrapper::{ChatMessage, ChatRole, GatewayClient};
//! use concord::clients::openrouter::OpenRouterClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("OPENROUTER_API_KEY")?;
//!     let client = OpenRouterClient::new(&key);
//!
//!     let reply = client
//!         .complete_text(
//!             "openai/gpt-5-chat",
//!             &[ChatMessage::new(ChatRole::User, "Who are you?")],
//!             0.7,
//!             None,
//!         )
//!         .await?;
//!
//!     println!("Assistant: {}", reply);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Speaker kind for a single transcript entry sent to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatRole {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message.
    User,
    /// An assistant authored message (model output, or exemplars supplied by the caller).
    Assistant,
}

impl ChatRole {
    /// Wire label for the OpenAI-compatible `messages` array.
    pub fn wire_label(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// A single entry in the transcript handed to the gateway.
///
/// The body is stored as `Arc<str>` so transcripts can be cheaply cloned when
/// the orchestrator rebuilds per-role views of the same history.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Arc<str>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl AsRef<str>) -> Self {
        Self {
            role,
            content: Arc::from(content.as_ref()),
        }
    }
}

/// Failure classification for gateway calls.
///
/// The engine keys its fallback behaviour off these four kinds; callers that
/// need the underlying detail get it from the payload string.
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Network failure or timeout before a well-formed response arrived.
    Transport(String),
    /// The gateway rejected our credentials (HTTP 401/403).
    Auth(String),
    /// The gateway answered with a structured failure (any other non-2xx).
    Upstream { status: u16, detail: String },
    /// The response arrived but could not be used: malformed JSON, a missing
    /// `choices[0].message.content`, unparseable structured output, or empty
    /// text where content was required.
    Decode(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Transport(msg) => write!(f, "gateway transport error: {}", msg),
            GatewayError::Auth(msg) => write!(f, "gateway auth error: {}", msg),
            GatewayError::Upstream { status, detail } => {
                write!(f, "gateway upstream error (HTTP {}): {}", status, detail)
            }
            GatewayError::Decode(msg) => write!(f, "gateway decode error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Trait-driven abstraction over the chat-completion gateway.
///
/// Calls are stateless: the caller owns the conversation history and resends
/// it on every call. The client is pure transport: it does not decide what
/// to send or whether to retry; retry policy belongs to the caller.
///
/// Implementations **must** be thread-safe (`Send + Sync`) so a single client
/// can be shared across every running discussion.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Request a plain-text completion.
    ///
    /// Empty assistant content is a [`GatewayError::Decode`], never silently
    /// normalized to `""`.
    async fn complete_text(
        &self,
        model_id: &str,
        transcript: &[ChatMessage],
        temperature: f32,
        max_output_tokens: Option<u32>,
    ) -> Result<String, GatewayError>;

    /// Request a completion constrained to a JSON object
    /// (`response_format = {"type": "json_object"}`) and parse it.
    async fn complete_json(
        &self,
        model_id: &str,
        transcript: &[ChatMessage],
        temperature: f32,
    ) -> Result<serde_json::Value, GatewayError>;

    /// Map a user-friendly model name to the canonical id understood by the
    /// gateway. Unknown names pass through unchanged.
    fn normalize(&self, user_friendly_name: &str) -> String {
        user_friendly_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_labels_match_openai_convention() {
        assert_eq!(ChatRole::System.wire_label(), "system");
        assert_eq!(ChatRole::User.wire_label(), "user");
        assert_eq!(ChatRole::Assistant.wire_label(), "assistant");
    }

    #[test]
    fn gateway_error_display_carries_detail() {
        let err = GatewayError::Upstream {
            status: 429,
            detail: "rate limited".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("429"));
        assert!(rendered.contains("rate limited"));
    }
}
