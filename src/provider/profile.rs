use std::collections::HashMap;

use crate::error::BridgeError;

use super::Target;

const CLAUDE_BASE_URL: &str = "https://api.anthropic.com";
const OPENAI_BASE_URL: &str = "https://api.openai.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Static description of where and how to reach a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub target: Target,
    pub base_url: String,
    pub models_path: &'static str,
    pub chat_path: &'static str,
    pub default_model: &'static str,
}

/// Resolves the profile for `target`.
///
/// Cloud targets ignore `host` and `port` and always use the vendor origin. Local
/// targets are reached at `<host>:<port>`, falling back to the server's usual port.
///
/// # Examples
///
/// ```
/// use chat_bridge::provider::{Target, profile_for};
///
/// let profile = profile_for(Target::Ollama, "http://localhost", None);
/// assert_eq!(profile.chat_url(), "http://localhost:11434/api/chat");
///
/// let profile = profile_for(Target::Claude, "http://localhost", Some(8080));
/// assert_eq!(profile.base_url, "https://api.anthropic.com");
/// ```
pub fn profile_for(target: Target, host: &str, port: Option<u16>) -> ProviderProfile {
    let (models_path, chat_path, default_model) = match target {
        Target::Ollama => ("api/tags", "api/chat", "llama3.2"),
        Target::LmStudio => ("v1/models", "v1/chat/completions", "llama3.2"),
        Target::Claude => ("v1/models", "v1/messages", "claude-3-5-sonnet-20241022"),
        Target::OpenAi => ("v1/models", "v1/chat/completions", "gpt-4"),
    };
    let base_url = match target {
        Target::Claude => CLAUDE_BASE_URL.to_string(),
        Target::OpenAi => OPENAI_BASE_URL.to_string(),
        Target::Ollama | Target::LmStudio => {
            let port = port.or(target.default_port()).unwrap_or(80);
            format!("{}:{port}", host.trim_end_matches('/'))
        }
    };
    ProviderProfile {
        target,
        base_url,
        models_path,
        chat_path,
        default_model,
    }
}

impl ProviderProfile {
    pub fn models_url(&self) -> String {
        format!("{}/{}", self.base_url, self.models_path)
    }

    pub fn chat_url(&self) -> String {
        format!("{}/{}", self.base_url, self.chat_path)
    }

    /// Authentication headers for this target.
    ///
    /// Blank keys count as absent.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::MissingCredential`] when a cloud target has no key.
    pub fn auth_headers(
        &self,
        api_key: Option<&str>,
    ) -> Result<HashMap<String, String>, BridgeError> {
        let key = api_key.map(str::trim).filter(|key| !key.is_empty());
        let mut headers = HashMap::new();
        if !self.target.requires_api_key() {
            return Ok(headers);
        }
        let key = key.ok_or(BridgeError::MissingCredential {
            target: self.target,
        })?;
        if self.target == Target::Claude {
            headers.insert("x-api-key".to_string(), key.to_string());
            headers.insert(
                "anthropic-version".to_string(),
                ANTHROPIC_VERSION.to_string(),
            );
        } else {
            headers.insert("Authorization".to_string(), format!("Bearer {key}"));
        }
        Ok(headers)
    }
}
