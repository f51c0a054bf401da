use thiserror::Error;

use crate::provider::Target;

/// Aggregates every failure mode exposed by the chat bridge.
///
/// `MissingCredential` and `ServerError` are raised before any assistant content is
/// produced. `Transport` can interrupt a running generation, in which case the partial
/// text has already been flushed into the conversation history by the time the error
/// reaches the caller. `Decode` is reported per frame and never aborts a stream.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The target requires an API key and none was configured.
    #[error("missing credential: {target} requires an API key")]
    MissingCredential { target: Target },
    /// The provider answered the initial request with a non-200 status.
    #[error("server error {status}{}", format_server_message(.message))]
    ServerError {
        /// HTTP status code returned by the provider.
        status: u16,
        /// Error message extracted from the response body, when one was present.
        message: Option<String>,
    },
    /// Represents connection or IO failures, including failures mid-stream.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// A single frame or response body could not be decoded.
    #[error("decode error: {message}")]
    Decode { message: String },
    /// The generation was stopped by the caller.
    #[error("generation cancelled by caller")]
    Cancelled,
    /// The operation is not allowed while a generation is streaming.
    #[error("a generation is still active on this session")]
    GenerationActive,
    /// Signals invalid request input, such as an unserializable body.
    #[error("invalid request: {message}")]
    Validation { message: String },
    /// Raised when building or validating configuration fails.
    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfig {
        /// Name of the configuration field that failed validation.
        field: String,
        /// Additional context explaining why the field is invalid.
        reason: String,
    },
}

impl BridgeError {
    /// Creates a [`BridgeError::Transport`] from a textual description.
    ///
    /// # Examples
    ///
    /// ```
    /// use chat_bridge::error::BridgeError;
    ///
    /// let err = BridgeError::transport("connection reset");
    /// assert!(matches!(err, BridgeError::Transport { .. }));
    /// ```
    pub fn transport<T: Into<String>>(message: T) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a [`BridgeError::Decode`] from a textual description.
    pub fn decode<T: Into<String>>(message: T) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates an [`BridgeError::InvalidConfig`] for the named field.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` when the failure happened before the provider produced anything.
    ///
    /// Such errors never leave partial assistant content behind in the history.
    pub fn is_pre_stream(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential { .. } | Self::ServerError { .. } | Self::Validation { .. }
        )
    }
}

fn format_server_message(message: &Option<String>) -> String {
    match message {
        Some(message) => format!(": {message}"),
        None => String::new(),
    }
}
