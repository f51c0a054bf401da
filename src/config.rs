use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::provider::Target;

/// Host used for local targets when none is given.
pub const DEFAULT_HOST: &str = "http://localhost";
/// Generation can take minutes on local hardware.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection settings for one session. Immutable once the session is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub target: Target,
    /// Scheme and host of a local server, e.g. `http://192.168.1.10`. Ignored for cloud targets.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port of a local server; the target's usual port when absent.
    #[serde(default)]
    pub port: Option<u16>,
    /// Required for `claude` and `openai`; checked when a request is built.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model used when a turn does not override it; the profile default when absent.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_request_timeout", with = "duration_secs")]
    pub request_timeout: Option<Duration>,
    /// Surface Claude model-listing failures instead of serving the known list.
    #[serde(default)]
    pub strict_model_listing: bool,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_request_timeout() -> Option<Duration> {
    Some(DEFAULT_REQUEST_TIMEOUT)
}

impl SessionConfig {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            host: default_host(),
            port: None,
            api_key: None,
            model: None,
            request_timeout: default_request_timeout(),
            strict_model_listing: false,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// `None` leaves timeouts entirely to the transport.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_strict_model_listing(mut self, strict: bool) -> Self {
        self.strict_model_listing = strict;
        self
    }

    /// Reads `CHAT_BRIDGE_TARGET`, `CHAT_BRIDGE_HOST`, `CHAT_BRIDGE_PORT`,
    /// `CHAT_BRIDGE_API_KEY` and `CHAT_BRIDGE_MODEL`. Blank values count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidConfig`] when the target is missing or unknown, or
    /// the port is not a number.
    pub fn from_env() -> Result<Self, BridgeError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BridgeError> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let target: Target = var("CHAT_BRIDGE_TARGET")
            .ok_or_else(|| BridgeError::invalid_config("target", "CHAT_BRIDGE_TARGET is not set"))?
            .parse()?;
        let mut config = Self::new(target);
        if let Some(host) = var("CHAT_BRIDGE_HOST") {
            config.host = host;
        }
        if let Some(port) = var("CHAT_BRIDGE_PORT") {
            let port = port.trim().parse::<u16>().map_err(|err| {
                BridgeError::invalid_config("port", format!("`{port}` is not a port: {err}"))
            })?;
            config.port = Some(port);
        }
        config.api_key = var("CHAT_BRIDGE_API_KEY");
        config.model = var("CHAT_BRIDGE_MODEL");
        Ok(config)
    }
}

/// Timeouts are written as whole seconds, `null` meaning no bridge-side timeout.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
