use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;
use crate::request::UserTurn;
use crate::types::{Message, NormalizedEvent};

pub mod anthropic_messages;
pub mod error;
pub mod ollama;
pub mod openai_chat;
pub mod profile;

pub use profile::{ProviderProfile, profile_for};

/// Backend a session talks to. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Ollama,
    #[serde(alias = "lm_studio", alias = "lm-studio")]
    LmStudio,
    #[serde(alias = "anthropic")]
    Claude,
    OpenAi,
}

impl Target {
    pub const ALL: [Target; 4] = [
        Target::Ollama,
        Target::LmStudio,
        Target::Claude,
        Target::OpenAi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Ollama => "ollama",
            Target::LmStudio => "lmstudio",
            Target::Claude => "claude",
            Target::OpenAi => "openai",
        }
    }

    /// Local servers are addressed by the caller's host and port.
    pub fn is_local(&self) -> bool {
        matches!(self, Target::Ollama | Target::LmStudio)
    }

    pub fn requires_api_key(&self) -> bool {
        !self.is_local()
    }

    /// Port the server listens on out of the box; `None` for cloud targets.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Target::Ollama => Some(11434),
            Target::LmStudio => Some(1234),
            Target::Claude | Target::OpenAi => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = BridgeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Target::Ollama),
            "lmstudio" | "lm_studio" | "lm-studio" => Ok(Target::LmStudio),
            "claude" | "anthropic" => Ok(Target::Claude),
            "openai" => Ok(Target::OpenAi),
            other => Err(BridgeError::invalid_config(
                "target",
                format!("unknown target `{other}`"),
            )),
        }
    }
}

/// How the response body of a streaming chat is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Server-Sent Events: `data: ` payload lines, `[DONE]` sentinel.
    Sse,
    /// One complete JSON object per line.
    JsonLines,
}

impl Framing {
    /// `Accept` header value announcing the framing to the server.
    pub fn accept(&self) -> &'static str {
        match self {
            Framing::Sse => "text/event-stream",
            Framing::JsonLines => "application/json",
        }
    }
}

/// Wire dialect of one target: body shape, stream events and model listings.
///
/// Implementations are pure translations with no I/O, selected once per session by
/// [`protocol_for`].
pub trait ChatProtocol: Send + Sync {
    fn target(&self) -> Target;

    fn framing(&self) -> Framing;

    /// Builds the streaming request body: prior history oldest first, new turn last.
    fn build_body(&self, history: &[Message], turn: &UserTurn, model: &str) -> Value;

    /// Maps one decoded frame to the events it carries, in application order.
    ///
    /// Frames missing the expected fields yield [`NormalizedEvent::Ignorable`].
    fn normalize(&self, payload: &Value) -> Vec<NormalizedEvent>;

    /// Extracts model identifiers from a models endpoint response.
    fn parse_models(&self, body: &Value) -> Vec<String>;
}

/// Shared handle to a dialect.
pub type DynProtocol = Arc<dyn ChatProtocol>;

/// Returns the dialect for `target`.
pub fn protocol_for(target: Target) -> DynProtocol {
    match target {
        Target::Ollama => Arc::new(ollama::OllamaProtocol),
        Target::LmStudio => Arc::new(openai_chat::OpenAiChatProtocol::lm_studio()),
        Target::OpenAi => Arc::new(openai_chat::OpenAiChatProtocol::openai()),
        Target::Claude => Arc::new(anthropic_messages::AnthropicMessagesProtocol),
    }
}
