//! Session configuration.
//!
//! [`ClientConfig`] describes where the esub node lives and how a session
//! talks to it. It carries no transport objects; transports interpret it
//! into concrete connection settings.

use std::env;
use std::time::Duration;

use url::Url;

use crate::{EsubError, Result, Token};

/// Default esub node port.
pub const DEFAULT_PORT: u16 = 8090;

/// Keepalive pongs go out slightly before the broker's ping interval.
const PING_MARGIN: f64 = 0.9;

/// Session configuration and broker endpoint.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // ---
    /// Host name or address of the esub node.
    pub host: String,

    /// esub node port.
    pub port: u16,

    /// URL scheme for HTTP calls (`http` or `https`).
    pub scheme: String,

    /// URL scheme for persistent WebSocket calls (`ws` or `wss`).
    pub ws_scheme: String,

    /// Token used when a call does not carry its own.
    pub token: Option<Token>,

    /// Exchange a receipt for every persistent message.
    ///
    /// Persistent subscribers answer each message with `ok`; persistent
    /// publishers wait for one confirmation frame per message.
    pub confirm_receipt: bool,

    /// Interval of unsolicited keepalive pongs on persistent subscriptions
    /// that do not confirm receipt.
    pub ping_frequency: Duration,

    /// Deadline applied to every call that does not set its own.
    ///
    /// `None` blocks until the operation is fulfilled or canceled.
    pub request_timeout: Option<Duration>,

    /// How long a discovered node IP is reused. Zero disables caching.
    pub node_ip_cache: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        // ---
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            scheme: "http".into(),
            ws_scheme: "ws".into(),
            token: None,
            confirm_receipt: false,
            ping_frequency: Duration::from_secs_f64(60.0 * PING_MARGIN),
            request_timeout: None,
            node_ip_cache: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    // ---

    /// Config pointing at `host:port` with every other setting defaulted.
    pub fn with_endpoint(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Build a config from the `ESUB_*` environment variables.
    ///
    /// | variable | field |
    /// |---|---|
    /// | `ESUB_SERVICE_HOST` | `host` |
    /// | `ESUB_SERVICE_PORT` | `port` |
    /// | `ESUB_PROTOCOL` | `scheme` |
    /// | `ESUB_WEBSOCKET_PROTOCOL` | `ws_scheme` |
    /// | `ESUB_TOKEN` | `token` |
    /// | `ESUB_CONFIRM_RECEIPT` | `confirm_receipt` (set, non-empty, not `0`) |
    /// | `ESUB_PING_FREQUENCY` | `ping_frequency` (seconds, sent at 90%) |
    ///
    /// # Errors
    ///
    /// Returns [`EsubError::InvalidConfig`] when a numeric variable does not
    /// parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // ---
        let mut config = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(host) = non_empty("ESUB_SERVICE_HOST") {
            config.host = host;
        }
        if let Some(port) = non_empty("ESUB_SERVICE_PORT") {
            config.port = port.parse().map_err(|_| {
                EsubError::InvalidConfig(format!("ESUB_SERVICE_PORT is not a port: {port:?}"))
            })?;
        }
        if let Some(scheme) = non_empty("ESUB_PROTOCOL") {
            config.scheme = scheme;
        }
        if let Some(scheme) = non_empty("ESUB_WEBSOCKET_PROTOCOL") {
            config.ws_scheme = scheme;
        }
        config.token = non_empty("ESUB_TOKEN").map(Token::from);
        config.confirm_receipt = non_empty("ESUB_CONFIRM_RECEIPT").is_some_and(|v| v != "0");

        if let Some(secs) = non_empty("ESUB_PING_FREQUENCY") {
            let secs: u64 = secs.parse().map_err(|_| {
                EsubError::InvalidConfig(format!(
                    "ESUB_PING_FREQUENCY is not a number of seconds: {secs:?}"
                ))
            })?;
            config.ping_frequency = Duration::from_secs_f64(secs as f64 * PING_MARGIN);
        }

        Ok(config)
    }

    /// Set the node host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the node port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the session token.
    pub fn with_token(mut self, token: impl Into<Token>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Use TLS for both HTTP and WebSocket calls.
    pub fn with_tls(mut self) -> Self {
        self.scheme = "https".into();
        self.ws_scheme = "wss".into();
        self
    }

    /// Turn per-message receipts on or off.
    pub fn with_confirm_receipt(mut self, confirm: bool) -> Self {
        self.confirm_receipt = confirm;
        self
    }

    /// Set the default deadline for calls.
    ///
    /// # Example
    ///
    /// ```
    /// use esub::ClientConfig;
    /// use std::time::Duration;
    ///
    /// let config = ClientConfig::with_endpoint("esub.internal", 8090)
    ///     .with_request_timeout(Duration::from_secs(30));
    /// assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
    /// ```
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set how long a discovered node IP is cached.
    pub fn with_node_ip_cache(mut self, ttl: Duration) -> Self {
        self.node_ip_cache = ttl;
        self
    }

    /// Base URL for HTTP calls, e.g. `http://localhost:8090/`.
    ///
    /// # Errors
    ///
    /// Returns [`EsubError::InvalidConfig`] if host or scheme do not form a URL.
    pub fn http_base(&self) -> Result<Url> {
        self.base_url(&self.scheme)
    }

    /// Base URL for persistent calls, e.g. `ws://localhost:8090/`.
    ///
    /// # Errors
    ///
    /// Returns [`EsubError::InvalidConfig`] if host or scheme do not form a URL.
    pub fn ws_base(&self) -> Result<Url> {
        self.base_url(&self.ws_scheme)
    }

    fn base_url(&self, scheme: &str) -> Result<Url> {
        // ---
        let raw = format!("{scheme}://{}:{}/", self.host, self.port);
        Url::parse(&raw).map_err(|e| EsubError::InvalidConfig(format!("bad endpoint {raw}: {e}")))
    }
}
