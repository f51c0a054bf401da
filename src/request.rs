//! Construction of the HTTP requests the bridge sends.

use std::time::Duration;

use crate::error::BridgeError;
use crate::http::HttpRequest;
use crate::provider::{ChatProtocol, ProviderProfile};
use crate::types::{AttachedImage, Message};

/// The newest user turn: text plus an optional, already encoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTurn {
    pub text: String,
    pub image: Option<AttachedImage>,
}

impl UserTurn {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: AttachedImage) -> Self {
        self.image = Some(image);
        self
    }
}

/// Everything needed to build one streaming chat request.
pub struct ChatRequestParts<'a> {
    pub profile: &'a ProviderProfile,
    pub protocol: &'a dyn ChatProtocol,
    pub api_key: Option<&'a str>,
    /// Prior turns only, oldest first.
    pub history: &'a [Message],
    pub turn: &'a UserTurn,
    pub model: &'a str,
    pub timeout: Option<Duration>,
}

/// Builds the streaming POST for a chat turn.
///
/// Credentials are checked first so a missing key fails before anything is serialized
/// or sent.
///
/// # Errors
///
/// Returns [`BridgeError::MissingCredential`] for a cloud target without a key and
/// [`BridgeError::Validation`] if the body cannot be serialized.
pub fn build_chat_request(parts: ChatRequestParts<'_>) -> Result<HttpRequest, BridgeError> {
    let auth = parts.profile.auth_headers(parts.api_key)?;
    let body = parts
        .protocol
        .build_body(parts.history, parts.turn, parts.model);
    Ok(HttpRequest::post_json(parts.profile.chat_url(), &body)?
        .with_headers(auth)
        .header("Accept", parts.protocol.framing().accept())
        .with_timeout(parts.timeout))
}

/// Builds the GET for the target's model listing.
///
/// # Errors
///
/// Returns [`BridgeError::MissingCredential`] for a cloud target without a key.
pub fn build_models_request(
    profile: &ProviderProfile,
    api_key: Option<&str>,
) -> Result<HttpRequest, BridgeError> {
    let headers = profile.auth_headers(api_key)?;
    Ok(HttpRequest::get(profile.models_url()).with_headers(headers))
}
