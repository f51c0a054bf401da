use serde::Deserialize;
use serde_json::Value;

use crate::error::BridgeError;

/// Builds a [`BridgeError::ServerError`] from a non-200 status and its body.
///
/// OpenAI, LM Studio and Anthropic nest the text under `error.message`; Ollama sends a
/// bare `error` string. Anything else leaves the message empty rather than echoing an
/// arbitrary body back to the caller.
pub(crate) fn server_error(status: u16, body: &str) -> BridgeError {
    BridgeError::ServerError {
        status,
        message: extract_error_message(body),
    }
}

fn extract_error_message(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<Value>,
        message: Option<String>,
    }
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let message = match parsed.error {
        Some(Value::String(message)) => Some(message),
        Some(Value::Object(inner)) => inner
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => parsed.message,
    };
    message.filter(|message| !message.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_nested_error_message() {
        let body = r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#;
        match server_error(401, body) {
            BridgeError::ServerError { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message.as_deref(), Some("invalid x-api-key"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn reads_ollama_error_string() {
        let body = r#"{"error":"model 'llama9' not found, try pulling it first"}"#;
        assert_eq!(
            extract_error_message(body).as_deref(),
            Some("model 'llama9' not found, try pulling it first")
        );
    }

    #[test]
    fn ignores_non_json_bodies() {
        assert_eq!(extract_error_message("<html>Bad Gateway</html>"), None);
        assert_eq!(extract_error_message(r#"{"error":{"code":500}}"#), None);
    }
}
