//! esub node transport using `reqwest` and `tokio-tungstenite`.
//!
//! One-shot calls are plain HTTP:
//!
//! - `GET  /sub/{key}?token=T` long-polls until a reply arrives; the body
//!   is the message.
//! - `POST /rep/{key}?token=T&psub=1` carries the message as its body and
//!   returns once the node has handed it over.
//! - `GET  /info` names an available node: `{"ip": "..."}`.
//!
//! Persistent calls (`/psub/{key}`, `/prep`) are WebSockets, see the `ws`
//! module.
//!
//! ## Connections
//!
//! All HTTP calls share one `reqwest::Client` and therefore its connection
//! pool. A `sub` holds its pooled connection for the whole wait; dropping
//! the call's future closes that connection, which is how the node learns
//! the waiter is gone. No call is ever retried here.
//!
//! ## Secrets
//!
//! The token travels as a query parameter, so request URLs are never
//! logged and `reqwest` errors are stripped of their URL before they reach
//! the caller.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use reqwest::Response;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::ws;
use super::{status_error, Call};
use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    CancelReason,
    ClientConfig,
    EsubError,
    Key,
    PersistentSubscription,
    PrepOptions,
    PsubOptions,
    Publisher,
    Result,
    Token,
    Transport,
    TransportPtr,
};

const INFO_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct NodeInfo {
    ip: Option<String>,
}

struct CachedIp {
    fetched: Instant,
    ip: String,
}

/// HTTP/WebSocket implementation of the `Transport` trait.
struct HttpTransport {
    // ---
    name: String,
    client: reqwest::Client,
    base: Url,
    ws_base: Url,
    confirm_receipt: bool,
    ping_frequency: Duration,
    node_ip_cache: Duration,
    cached_ip: Mutex<Option<CachedIp>>,

    /// Parent of every persistent connection this transport opens.
    closed: CancellationToken,
}

impl HttpTransport {
    // ---

    fn ensure_open(&self) -> Result<()> {
        // ---
        if self.closed.is_cancelled() {
            return Err(EsubError::ConnectionFailed(format!("{}: transport closed", self.name)));
        }
        Ok(())
    }

    /// `{base}/{op}/{key}?token=..&extra..`
    fn url(
        base: &Url,
        op: &str,
        key: Option<&Key>,
        token: Option<&Token>,
        extra: &[(&str, &str)],
    ) -> Result<Url> {
        // ---
        // Dot segments are removed by URL normalization in any spelling,
        // `%2E` included, so the node would see no key at all.
        if let Some(key) = key.filter(|k| matches!(k.as_str(), "." | "..")) {
            return Err(EsubError::InvalidKey(format!(
                "{:?} cannot be sent as a path segment",
                key.as_str()
            )));
        }

        let mut url = base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| EsubError::InvalidConfig(format!("endpoint {base} cannot take a path")))?;
            segments.pop_if_empty().push(op);
            if let Some(key) = key {
                segments.push(key.as_str());
            }
        }

        let mut pairs: Vec<(&str, &str)> = Vec::with_capacity(extra.len() + 1);
        if let Some(token) = token {
            pairs.push(("token", token.expose()));
        }
        pairs.extend_from_slice(extra);
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }

        Ok(url)
    }

    async fn fetch_node_ip(&self) -> Result<String> {
        // ---
        let url = Self::url(&self.base, "info", None, None, &[])?;
        let resp = self
            .client
            .get(url)
            .timeout(INFO_TIMEOUT)
            .send()
            .await
            .map_err(request_error)?;
        let resp = check_status(resp, Call::Info, "").await?;
        let body = resp.bytes().await.map_err(request_error)?;

        let info: NodeInfo = serde_json::from_slice(&body)?;
        info.ip.ok_or_else(|| EsubError::Broker {
            status: 200,
            message: "node info carried no ip".into(),
        })
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    // ---
    fn name(&self) -> &str {
        &self.name
    }

    async fn sub(&self, key: &Key, token: Option<&Token>) -> Result<Bytes> {
        // ---
        self.ensure_open()?;
        let url = Self::url(&self.base, "sub", Some(key), token, &[])?;

        log_debug!("{}: sub {key}", self.name);

        let resp = self.client.get(url).send().await.map_err(request_error)?;
        let resp = check_status(resp, Call::Sub, key.as_str()).await?;
        resp.bytes().await.map_err(request_error)
    }

    async fn rep(&self, key: &Key, data: Bytes, token: Option<&Token>, psub: bool) -> Result<()> {
        // ---
        self.ensure_open()?;
        let extra: &[(&str, &str)] = if psub { &[("psub", "1")] } else { &[] };
        let url = Self::url(&self.base, "rep", Some(key), token, extra)?;

        log_debug!("{}: rep {key} ({} bytes, psub: {psub})", self.name, data.len());

        let resp = self
            .client
            .post(url)
            .body(data)
            .send()
            .await
            .map_err(request_error)?;
        check_status(resp, Call::Rep, key.as_str()).await?;
        Ok(())
    }

    async fn psub(
        &self,
        key: &Key,
        token: Option<&Token>,
        opts: PsubOptions,
    ) -> Result<PersistentSubscription> {
        // ---
        self.ensure_open()?;

        let timeout_secs = opts.timeout.map(|t| t.as_secs().max(1).to_string());
        let mut extra: Vec<(&str, &str)> = Vec::new();
        if opts.shared {
            extra.push(("shared", "1"));
        }
        if let Some(secs) = timeout_secs.as_deref() {
            extra.push(("timeout", secs));
        }
        let url = Self::url(&self.ws_base, "psub", Some(key), token, &extra)?;

        log_debug!("{}: psub {key} (shared: {})", self.name, opts.shared);

        ws::open_psub(
            url,
            key.clone(),
            ws::PsubSettings {
                confirm_receipt: self.confirm_receipt,
                ping_frequency: self.ping_frequency,
                timeout: opts.timeout,
            },
            self.closed.child_token(),
        )
        .await
    }

    async fn prep(&self, opts: PrepOptions, session_token: Option<Token>) -> Result<Publisher> {
        // ---
        self.ensure_open()?;
        let url = Self::url(&self.ws_base, "prep", None, None, &[])?;

        log_debug!("{}: prep", self.name);

        ws::open_prep(
            url,
            self.confirm_receipt,
            opts,
            session_token,
            self.closed.child_token(),
        )
        .await
    }

    /// Ask the node for an available node's IP, reusing a recent answer.
    async fn node_ip(&self) -> Result<String> {
        // ---
        self.ensure_open()?;

        if !self.node_ip_cache.is_zero() {
            let cached = lock_ignore_poison(&self.cached_ip);
            if let Some(cached) = cached.as_ref() {
                if cached.fetched.elapsed() < self.node_ip_cache {
                    return Ok(cached.ip.clone());
                }
            }
        }

        let ip = self.fetch_node_ip().await?;
        log_debug!("{}: node ip {ip}", self.name);

        *lock_ignore_poison(&self.cached_ip) = Some(CachedIp {
            fetched: Instant::now(),
            ip: ip.clone(),
        });
        Ok(ip)
    }

    async fn close(&self) -> Result<()> {
        // ---
        log_debug!("{}: closing transport...", self.name);
        self.closed.cancel();
        Ok(())
    }
}

/// Pass successful responses through; turn the rest into errors.
async fn check_status(resp: Response, call: Call, key: &str) -> Result<Response> {
    // ---
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let message = resp.text().await.unwrap_or_default();
    Err(status_error(call, status.as_u16(), key, message))
}

/// Map a `reqwest` failure that happened before or while reading a response.
fn request_error(err: reqwest::Error) -> EsubError {
    // ---
    let err = err.without_url();
    if err.is_timeout() {
        EsubError::Canceled(CancelReason::Timeout)
    } else {
        EsubError::connection(err)
    }
}

/// Create a transport speaking the esub node protocol at `config`'s endpoint.
///
/// No connection is opened until the first call.
///
/// # Errors
///
/// Returns [`EsubError::InvalidConfig`] if the endpoint does not form valid
/// HTTP and WebSocket URLs or the HTTP client cannot be built.
pub async fn create_transport(config: &ClientConfig) -> Result<TransportPtr> {
    // ---
    let base = config.http_base()?;
    let ws_base = config.ws_base()?;

    let client = reqwest::Client::builder()
        .user_agent(format!("esub {}", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| EsubError::InvalidConfig(format!("http client: {e}")))?;

    let name = format!("esub@{}:{}", config.host, config.port);
    log_debug!("{name}: create http transport");

    Ok(Arc::new(HttpTransport {
        name,
        client,
        base,
        ws_base,
        confirm_receipt: config.confirm_receipt,
        ping_frequency: config.ping_frequency,
        node_ip_cache: config.node_ip_cache,
        cached_ip: Mutex::new(None),
        closed: CancellationToken::new(),
    }))
}
