//! The seam between the bridge and whatever HTTP client carries its requests.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use serde::Serialize;

use crate::error::BridgeError;

pub mod reqwest;

/// The bridge only lists models (`GET`) and opens chats (`POST`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// A fully built request: the transport adds nothing but the wire.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    /// Upper bound for the whole exchange, body included. `None` leaves it to the client.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// A model-listing style request without a body.
    ///
    /// # Examples
    ///
    /// ```
    /// use chat_bridge::http::{HttpMethod, HttpRequest};
    ///
    /// let request = HttpRequest::get("http://localhost:11434/api/tags");
    /// assert_eq!(request.method, HttpMethod::Get);
    /// assert!(request.body.is_none());
    /// ```
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// A POST carrying `body` as JSON, with `Content-Type: application/json` set.
    ///
    /// # Examples
    ///
    /// ```
    /// use chat_bridge::http::HttpRequest;
    /// use serde_json::json;
    ///
    /// let request = HttpRequest::post_json("http://localhost:1234/v1/chat/completions", &json!({"stream": true})).unwrap();
    /// assert_eq!(request.headers["Content-Type"], "application/json");
    /// assert_eq!(request.body.as_deref(), Some(&br#"{"stream":true}"#[..]));
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Validation`] if `body` cannot be written as JSON.
    pub fn post_json<T: Serialize + ?Sized>(
        url: impl Into<String>,
        body: &T,
    ) -> Result<Self, BridgeError> {
        let body = serde_json::to_vec(body).map_err(|err| BridgeError::Validation {
            message: format!("request body is not serializable: {err}"),
        })?;
        Ok(Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: HashMap::new(),
            body: Some(body),
            timeout: None,
        }
        .header("Content-Type", "application/json"))
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Adds every header in `headers`, replacing values for names already present.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A response whose body was read to the end.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// The body as text.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Decode`] when the body is not valid UTF-8.
    pub fn into_string(self) -> Result<String, BridgeError> {
        String::from_utf8(self.body)
            .map_err(|err| BridgeError::decode(format!("response body is not UTF-8: {err}")))
    }
}

/// Chunks of a response body in arrival order. Finite once the server closes the stream.
pub type HttpBodyStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, BridgeError>> + Send>>;

/// A response handed over as soon as the status line and headers arrived.
pub struct HttpStreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: HttpBodyStream,
}

impl HttpStreamResponse {
    /// Drains the rest of the body, for reading an error payload.
    ///
    /// Transport failures and invalid UTF-8 yield whatever could be read so far.
    pub async fn drain_text(mut self) -> String {
        let mut bytes = Vec::new();
        while let Some(chunk) = self.body.next().await {
            match chunk {
                Ok(chunk) => bytes.extend_from_slice(&chunk),
                Err(err) => {
                    tracing::debug!(error = %err, "error body cut short");
                    break;
                }
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Carries requests for a session.
///
/// TLS, pooling and connection handling belong to the implementation. Non-200
/// statuses are returned as responses, not errors; interpreting them is up to the
/// caller.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends `request` and reads the whole body.
    ///
    /// # Errors
    ///
    /// Network failures are [`BridgeError::Transport`].
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError>;

    /// Sends `request` and returns once headers arrive, with the body left to stream.
    ///
    /// # Errors
    ///
    /// Failures before the headers arrive are [`BridgeError::Transport`]; failures
    /// while streaming arrive as items of the body.
    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, BridgeError>;
}

pub type DynHttpTransport = Arc<dyn HttpTransport>;
