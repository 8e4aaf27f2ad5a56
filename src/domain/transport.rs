// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the seam between an esub session and whatever carries
//! its calls to a broker. It knows nothing about HTTP, WebSockets, or any
//! concrete broker; those live under `src/transport/`.
//!
//! A transport only moves one exchange at a time to the broker and reports
//! the broker's answer. Cancellation, deadlines, token fallback, and the
//! pending-operation bookkeeping are handled by the session in
//! `src/client/`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{EsubError, Key, Result, Token};

/// Options for a persistent subscription.
#[derive(Debug, Clone, Copy, Default)]
pub struct PsubOptions {
    /// Share the key with other persistent subscribers instead of owning it.
    pub shared: bool,

    /// End the subscription after this long.
    pub timeout: Option<Duration>,
}

/// Defaults applied to every message of a persistent publisher.
///
/// Fields set here take precedence over the per-message ones.
#[derive(Debug, Clone, Default)]
pub struct PrepOptions {
    pub key: Option<Key>,
    pub token: Option<Token>,
    pub psub: bool,
}

/// One message on a persistent publisher, in its wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepMessage {
    pub key: String,
    pub token: Option<String>,
    pub psub: bool,
    pub data: String,
}

impl PrepMessage {
    /// Message for `key` carrying `data`, no token, not aimed at a psub.
    pub fn new(key: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: None,
            psub: false,
            data: data.into(),
        }
    }

    pub fn with_token(mut self, token: &Token) -> Self {
        self.token = Some(token.expose().to_string());
        self
    }

    pub fn to_psub(mut self, psub: bool) -> Self {
        self.psub = psub;
        self
    }

    /// Merge publisher defaults, then the session token as last fallback.
    pub(crate) fn resolve(mut self, opts: &PrepOptions, session_token: Option<&Token>) -> Self {
        // ---
        if let Some(key) = &opts.key {
            self.key = key.as_str().to_string();
        }
        self.psub = opts.psub || self.psub;
        if let Some(token) = opts.token.as_ref() {
            self.token = Some(token.expose().to_string());
        } else if self.token.is_none() {
            self.token = session_token.map(|t| t.expose().to_string());
        }
        self
    }
}

/// Stream of messages from a persistent subscription.
///
/// The subscription stays open until this value is dropped or [`close`]d, its
/// timeout elapses, or the connection to the broker ends. After that
/// [`recv`] yields `None`.
///
/// [`close`]: PersistentSubscription::close
/// [`recv`]: PersistentSubscription::recv
pub struct PersistentSubscription {
    // ---
    /// Receiver for delivered messages.
    pub inbox: mpsc::Receiver<Bytes>,
    closer: CancellationToken,
}

impl PersistentSubscription {
    pub fn new(inbox: mpsc::Receiver<Bytes>, closer: CancellationToken) -> Self {
        Self { inbox, closer }
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbox.recv().await
    }

    /// Stop the subscription. Messages already queued can still be read.
    pub fn close(&self) {
        self.closer.cancel();
    }
}

impl Drop for PersistentSubscription {
    fn drop(&mut self) {
        self.closer.cancel();
    }
}

/// Command sent from a [`Publisher`] handle to the task that owns the
/// connection.
pub struct PublishCmd {
    pub msg: PrepMessage,
    pub resp: oneshot::Sender<Result<Option<String>>>,
}

/// Handle to a persistent publisher.
///
/// Cheap to clone; every clone feeds the same connection. Messages are sent
/// in the order `send` is called.
#[derive(Clone)]
pub struct Publisher {
    // ---
    cmd_tx: mpsc::Sender<PublishCmd>,
    closer: CancellationToken,
}

impl Publisher {
    pub fn new(cmd_tx: mpsc::Sender<PublishCmd>, closer: CancellationToken) -> Self {
        Self { cmd_tx, closer }
    }

    /// Send one message.
    ///
    /// Returns the broker's confirmation text when the session confirms
    /// receipts, `None` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`EsubError::ConnectionFailed`] if the publisher connection is
    /// gone, or the error the broker reported for this message.
    pub async fn send(&self, msg: PrepMessage) -> Result<Option<String>> {
        // ---
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(PublishCmd { msg, resp })
            .await
            .map_err(|_| EsubError::ConnectionFailed("publisher closed".into()))?;

        rx.await
            .map_err(|_| EsubError::ConnectionFailed("publisher dropped the message".into()))?
    }

    /// Close the underlying connection. Pending sends fail.
    pub fn close(&self) {
        self.closer.cancel();
    }
}

/// Transport abstraction.
///
/// Implementations must ensure that:
/// - `sub` resolves only when a reply is delivered, the broker ends the wait,
///   or the connection fails. Dropping the future abandons the wait and
///   releases its connection.
/// - `rep` resolves once the broker acknowledged the delivery or rejected it.
/// - No retries happen at this layer.
///
/// Tokens passed here are already resolved (per-call token or session
/// token); `None` means the call goes out without one.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Short name used in log lines.
    fn name(&self) -> &str;

    /// Wait on `key` for a single reply.
    async fn sub(&self, key: &Key, token: Option<&Token>) -> Result<Bytes>;

    /// Deliver `data` to a waiter on `key`, or to a persistent subscriber
    /// when `psub` is set.
    async fn rep(&self, key: &Key, data: Bytes, token: Option<&Token>, psub: bool) -> Result<()>;

    /// Open a persistent subscription on `key`.
    async fn psub(
        &self,
        key: &Key,
        token: Option<&Token>,
        opts: PsubOptions,
    ) -> Result<PersistentSubscription>;

    /// Open a persistent publisher.
    ///
    /// `session_token` is applied to messages that carry no token after
    /// `opts` were merged in.
    async fn prep(&self, opts: PrepOptions, session_token: Option<Token>) -> Result<Publisher>;

    /// Address of an available broker node.
    async fn node_ip(&self) -> Result<String> {
        Err(EsubError::InvalidConfig(format!(
            "{}: node discovery is not supported",
            self.name()
        )))
    }

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// Clones share the same underlying connection pool.
pub type TransportPtr = Arc<dyn Transport>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_prep_message_wire_shape() {
        // ---
        let msg = PrepMessage::new("orders", "shipped#42").to_psub(true);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"key": "orders", "token": null, "psub": true, "data": "shipped#42"})
        );
    }

    #[test]
    fn test_prep_message_resolve_precedence() {
        // ---
        let session = Token::from("session");
        let own = Token::from("own");

        let opts = PrepOptions::default();
        let msg = PrepMessage::new("a", "x").resolve(&opts, Some(&session));
        assert_eq!(msg.token.as_deref(), Some("session"));

        let msg = PrepMessage::new("a", "x")
            .with_token(&own)
            .resolve(&opts, Some(&session));
        assert_eq!(msg.token.as_deref(), Some("own"));

        let opts = PrepOptions {
            key: Some(Key::new("fixed").unwrap()),
            token: Some(Token::from("publisher")),
            psub: true,
        };
        let msg = PrepMessage::new("a", "x")
            .with_token(&own)
            .resolve(&opts, Some(&session));
        assert_eq!(msg.key, "fixed");
        assert_eq!(msg.token.as_deref(), Some("publisher"));
        assert!(msg.psub);
    }
}
