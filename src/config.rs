//! Stream client configuration.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::retry::ReconnectPolicy;
use crate::stream::client::StreamClientError;

/// Base URL used when the configured path is relative.
pub const DEFAULT_BASE_URL: &str = "ws://localhost:8000";
/// Query parameter that carries the access token during the handshake.
pub const DEFAULT_TOKEN_PARAM: &str = "token";
/// Upper bound for a single connection handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for one notification subscription.
///
/// A config is immutable once handed to a client. Rotating the token means
/// building a new config and a new client.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    path: String,
    token: Option<SecretString>,
    base_url: String,
    token_param: String,
    reconnect: ReconnectPolicy,
    handshake_timeout: Duration,
}

impl StreamConfig {
    /// Creates a config for the given stream path.
    ///
    /// `path` is either an absolute `ws(s)://` or `http(s)://` URL, or a path
    /// resolved against the base URL (see [`with_base_url`](Self::with_base_url)).
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            token: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            token_param: DEFAULT_TOKEN_PARAM.to_string(),
            reconnect: ReconnectPolicy::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Sets the access token sent with every handshake.
    ///
    /// An empty token is treated as no token.
    pub fn with_token(self, token: impl Into<String>) -> Self {
        self.with_optional_token(Some(token.into()))
    }

    /// Sets or clears the access token.
    pub fn with_optional_token(mut self, token: Option<String>) -> Self {
        self.token = token
            .filter(|token| !token.is_empty())
            .map(SecretString::new);
        self
    }

    /// Sets the base URL used to resolve relative paths.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url = base_url.trim_end().to_string();
        self
    }

    /// Overrides the query parameter name that carries the token.
    pub fn with_token_param(mut self, name: impl Into<String>) -> Self {
        self.token_param = name.into();
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Sets the timeout applied to each connection handshake.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub fn reconnect_policy(&self) -> &ReconnectPolicy {
        &self.reconnect
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Checks the config without resolving the endpoint.
    pub fn validate(&self) -> Result<(), StreamClientError> {
        if self.path.trim().is_empty() {
            return Err(StreamClientError::MissingPath);
        }
        if self.token.is_some() && self.token_param.trim().is_empty() {
            return Err(StreamClientError::InvalidConfig(
                "token_param must not be empty when a token is set".to_string(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(StreamClientError::InvalidConfig(
                "handshake_timeout must be > 0".to_string(),
            ));
        }
        self.reconnect
            .validate()
            .map_err(StreamClientError::InvalidConfig)
    }

    /// Resolves the websocket URL, including the token query parameter.
    ///
    /// The returned URL carries the credential and must not be logged.
    pub(crate) fn endpoint(&self) -> Result<Url, StreamClientError> {
        let path = self.path.trim();
        if path.is_empty() {
            return Err(StreamClientError::MissingPath);
        }

        let mut url = match Url::parse(path) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Url::parse(&self.base_url)?.join(path)?
            }
            Err(err) => return Err(err.into()),
        };

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(StreamClientError::UnsupportedScheme(other.to_string())),
        };
        if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
            return Err(StreamClientError::UnsupportedScheme(url.scheme().to_string()));
        }

        if let Some(token) = &self.token {
            url.query_pairs_mut()
                .append_pair(&self.token_param, token.expose_secret());
        }
        Ok(url)
    }
}
