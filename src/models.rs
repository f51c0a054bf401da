//! Model discovery against each target's listing endpoint.

use serde_json::Value;

use crate::error::BridgeError;
use crate::http::{HttpRequest, HttpTransport};
use crate::provider::error::server_error;
use crate::provider::{ChatProtocol, ProviderProfile, Target};
use crate::request::build_models_request;

/// Served when the Anthropic listing cannot be used.
pub const CLAUDE_KNOWN_MODELS: [&str; 5] = [
    "claude-3-5-sonnet-20241022",
    "claude-3-5-haiku-20241022",
    "claude-3-opus-20240229",
    "claude-3-sonnet-20240229",
    "claude-3-haiku-20240307",
];

/// Served when the OpenAI listing yields no identifiers.
pub const OPENAI_KNOWN_MODELS: [&str; 4] = [
    "gpt-3.5-turbo",
    "gpt-4",
    "gpt-4-turbo-preview",
    "gpt-4-vision-preview",
];

/// Inputs for [`list_models`].
pub struct ModelQuery<'a> {
    pub transport: &'a dyn HttpTransport,
    pub profile: &'a ProviderProfile,
    pub protocol: &'a dyn ChatProtocol,
    pub api_key: Option<&'a str>,
    /// Surface Claude listing failures instead of serving [`CLAUDE_KNOWN_MODELS`].
    pub strict: bool,
}

/// Lists the model identifiers the target offers.
///
/// Fallbacks per target:
/// - Claude: known models on any fetch failure or empty listing, unless `strict`.
/// - OpenAI: known models when the listing yields no identifiers.
/// - Ollama / LM Studio: the profile's default model when the body has an unexpected shape.
///
/// # Errors
///
/// [`BridgeError::MissingCredential`] is always raised before any request. Network
/// failures and non-200 statuses are surfaced except where a fallback applies.
pub async fn list_models(query: ModelQuery<'_>) -> Result<Vec<String>, BridgeError> {
    let request = build_models_request(query.profile, query.api_key)?;
    tracing::debug!(provider = %query.profile.target, url = %request.url, "listing models");
    let fetched = fetch_json(query.transport, request).await;

    match query.profile.target {
        Target::Claude => match fetched {
            Ok(body) => Ok(or_fallback(
                query.protocol.parse_models(&body),
                &CLAUDE_KNOWN_MODELS,
            )),
            Err(err) if !query.strict => {
                tracing::warn!(error = %err, "model listing failed, serving known Claude models");
                Ok(known(&CLAUDE_KNOWN_MODELS))
            }
            Err(err) => Err(err),
        },
        Target::OpenAi => {
            let ids = match fetched {
                Ok(body) => query.protocol.parse_models(&body),
                Err(BridgeError::Decode { .. }) => Vec::new(),
                Err(err) => return Err(err),
            };
            Ok(or_fallback(ids, &OPENAI_KNOWN_MODELS))
        }
        Target::Ollama | Target::LmStudio => {
            let ids = match fetched {
                Ok(body) => query.protocol.parse_models(&body),
                Err(BridgeError::Decode { .. }) => Vec::new(),
                Err(err) => return Err(err),
            };
            Ok(or_fallback(ids, &[query.profile.default_model]))
        }
    }
}

async fn fetch_json(
    transport: &dyn HttpTransport,
    request: HttpRequest,
) -> Result<Value, BridgeError> {
    let response = transport.send(request).await?;
    let status = response.status;
    let text = response.into_string()?;
    if status != 200 {
        return Err(server_error(status, &text));
    }
    serde_json::from_str(&text)
        .map_err(|err| BridgeError::decode(format!("invalid model listing: {err}")))
}

fn or_fallback(ids: Vec<String>, fallback: &[&str]) -> Vec<String> {
    if ids.is_empty() {
        tracing::warn!("model listing had no identifiers, using fallback list");
        known(fallback)
    } else {
        ids
    }
}

fn known(models: &[&str]) -> Vec<String> {
    models.iter().map(|model| model.to_string()).collect()
}
