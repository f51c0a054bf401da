//! [`HttpTransport`] over `reqwest` with rustls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response};

use crate::error::BridgeError;

use super::{
    DynHttpTransport, HttpBodyStream, HttpMethod, HttpRequest, HttpResponse, HttpStreamResponse,
    HttpTransport,
};

/// Connection attempts give up after this long; the exchange itself is bounded per request.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Uses a caller-configured client, e.g. one with a proxy or custom roots.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// A client with [`CONNECT_TIMEOUT`] and otherwise default settings.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the TLS backend cannot be initialised.
    pub fn with_defaults() -> Result<Self, BridgeError> {
        Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map(Self::new)
            .map_err(|err| BridgeError::transport(format!("cannot build HTTP client: {err}")))
    }

    fn prepare(&self, request: HttpRequest) -> Result<RequestBuilder, BridgeError> {
        let method = match request.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        };
        let mut headers = HeaderMap::with_capacity(request.headers.len());
        for (name, value) in request.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|err| BridgeError::transport(format!("bad header name `{name}`: {err}")))?;
            let value = HeaderValue::try_from(value)
                .map_err(|err| BridgeError::transport(format!("bad value for {name}: {err}")))?;
            headers.insert(name, value);
        }

        let mut builder = self.client.request(method, &request.url).headers(headers);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        Ok(builder)
    }

    async fn dispatch(&self, request: HttpRequest) -> Result<Response, BridgeError> {
        let url = request.url.clone();
        let response = self
            .prepare(request)?
            .send()
            .await
            .map_err(transport_error)?;
        tracing::debug!(%url, status = response.status().as_u16(), "response headers received");
        Ok(response)
    }
}

fn transport_error(err: reqwest::Error) -> BridgeError {
    let what = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else if err.is_body() || err.is_decode() {
        "reading body failed"
    } else {
        "request failed"
    };
    BridgeError::transport(format!("{what}: {err}"))
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError> {
        let response = self.dispatch(request).await?;
        let status = response.status().as_u16();
        let headers = header_map(response.headers());
        let body = response.bytes().await.map_err(transport_error)?.to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, BridgeError> {
        let response = self.dispatch(request).await?;
        let status = response.status().as_u16();
        let headers = header_map(response.headers());
        let body: HttpBodyStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(transport_error)),
        );
        Ok(HttpStreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// The transport [`crate::Session::construct`] uses.
///
/// # Errors
///
/// See [`ReqwestTransport::with_defaults`].
pub fn default_dyn_transport() -> Result<DynHttpTransport, BridgeError> {
    Ok(Arc::new(ReqwestTransport::with_defaults()?))
}
