// src/client/mod.rs
//! esub session.
//!
//! [`EsubClient`] issues `subscribe` and `reply` calls over a transport and
//! owns everything around the network exchange: token fallback, deadlines,
//! caller cancellation, and the registry of in-flight operations.
//!
//! # Cancellation
//!
//! Every call races the transport exchange against three signals: the
//! caller's `CancellationToken`, the call's deadline, and the session
//! closing. Whichever wins, the losing exchange future is dropped, which
//! releases its connection; the broker sees the waiter disappear and can no
//! longer deliver to it.
//!
//! # Concurrency
//!
//! Calls on one session are independent. The pending registry is a mutex
//! around a `HashMap`, held only for an insert or a remove.

mod handle;
mod pending;

pub use handle::SubscribeHandle;

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use pending::PendingOperations;

use crate::transport::deadline;
use crate::{
    // ---
    create_http_transport,
    lock_ignore_poison,
    log_debug,
    log_info,
    CancelReason,
    ClientConfig,
    EsubError,
    Key,
    OperationId,
    OperationKind,
    OperationState,
    PersistentSubscription,
    PrepOptions,
    PsubOptions,
    Publisher,
    Result,
    Token,
    TransportPtr,
};

/// Per-call options for [`EsubClient::subscribe_with`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Give up after this long. Overrides `ClientConfig::request_timeout`.
    pub timeout: Option<Duration>,

    /// Cancel the call from elsewhere.
    pub cancel: Option<CancellationToken>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Per-call options for [`EsubClient::reply_with`].
#[derive(Debug, Clone, Default)]
pub struct ReplyOptions {
    /// Give up after this long. Overrides `ClientConfig::request_timeout`.
    pub timeout: Option<Duration>,

    /// Cancel the call from elsewhere.
    pub cancel: Option<CancellationToken>,

    /// Deliver to a persistent subscriber instead of a one-shot waiter.
    pub psub: bool,
}

impl ReplyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn to_psub(mut self, psub: bool) -> Self {
        self.psub = psub;
        self
    }
}

/// An esub session.
///
/// Cheap to clone (internally `Arc`-backed); clones share the transport and
/// the pending registry.
///
/// # Example
///
/// ```
/// use esub::{create_memory_transport, ClientConfig, EsubClient, MemoryHub, Token};
///
/// # async fn example() -> esub::Result<()> {
/// let config = ClientConfig::default();
/// let transport = create_memory_transport(&config, MemoryHub::new()).await?;
/// let client = EsubClient::with_transport(transport, config);
///
/// let token = Token::from("secret");
/// let waiter = {
///     let client = client.clone();
///     let token = token.clone();
///     tokio::spawn(async move { client.subscribe("orders", Some(&token)).await })
/// };
///
/// // Retry until the subscriber is registered.
/// while client.reply("orders", "shipped#42", Some(&token)).await.is_err() {
///     tokio::task::yield_now().await;
/// }
/// assert_eq!(&waiter.await.unwrap()?[..], b"shipped#42");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EsubClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    transport: TransportPtr,
    config: ClientConfig,
    pending: Mutex<PendingOperations>,
}

/// Removes an operation from the registry however its call ends.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: OperationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_ignore_poison(&self.inner.pending).remove(&self.id);
    }
}

impl EsubClient {
    // ---

    /// Create a session speaking the esub node protocol at `config`'s
    /// endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EsubError::InvalidConfig`] if the endpoint is unusable.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        // ---
        let transport = create_http_transport(&config).await?;
        Ok(Self::with_transport(transport, config))
    }

    /// Create a session over an explicitly provided transport.
    ///
    /// This is the constructor for tests and in-process use.
    pub fn with_transport(transport: TransportPtr, config: ClientConfig) -> Self {
        // ---
        log_debug!("session on {}", transport.name());

        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                pending: Mutex::new(PendingOperations::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Number of `subscribe`/`reply` calls currently in flight.
    pub fn pending_operations(&self) -> usize {
        lock_ignore_poison(&self.inner.pending).len()
    }

    /// Wait on `key` for one message.
    ///
    /// Blocks until a reply on `key` is delivered, the session's request
    /// timeout elapses, or the session is closed. With no token the
    /// session token is used.
    ///
    /// # Errors
    ///
    /// - [`EsubError::InvalidKey`] - `key` is empty
    /// - [`EsubError::Canceled`] - timed out, session closed, or the broker
    ///   ended the wait
    /// - [`EsubError::Unauthorized`] - the broker rejected the token
    /// - [`EsubError::ConnectionFailed`] - the broker is unreachable or the
    ///   connection dropped mid-wait
    pub async fn subscribe(&self, key: &str, token: Option<&Token>) -> Result<Bytes> {
        // ---
        self.subscribe_with(key, token, SubscribeOptions::default())
            .await
    }

    /// [`subscribe`](Self::subscribe) with a per-call timeout and/or
    /// cancellation token.
    ///
    /// # Errors
    ///
    /// As `subscribe`; caller cancellation yields `Canceled(Caller)`.
    pub async fn subscribe_with(
        &self,
        key: &str,
        token: Option<&Token>,
        opts: SubscribeOptions,
    ) -> Result<Bytes> {
        // ---
        let key = Key::new(key)?;
        self.run_subscribe(OperationId::generate(), key, token.cloned(), opts)
            .await
    }

    /// Run a subscribe on its own task and return a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EsubError::InvalidKey`] immediately if `key` is empty;
    /// everything else is reported by [`SubscribeHandle::join`].
    pub fn spawn_subscribe(
        &self,
        key: &str,
        token: Option<&Token>,
        opts: SubscribeOptions,
    ) -> Result<SubscribeHandle> {
        // ---
        let key = Key::new(key)?;
        let id = OperationId::generate();

        let cancel = opts
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let opts = SubscribeOptions {
            cancel: Some(cancel.clone()),
            ..opts
        };

        let (state_tx, state_rx) = watch::channel(OperationState::Issued);
        let client = self.clone();
        let token = token.cloned();
        let task = {
            let (id, key) = (id.clone(), key.clone());
            tokio::spawn(async move {
                let outcome = client.run_subscribe(id, key, token, opts).await;
                let _ = state_tx.send(OperationState::from_outcome(&outcome));
                outcome
            })
        };

        Ok(SubscribeHandle::new(id, key, cancel, state_rx, task))
    }

    /// Deliver `data` to a subscriber waiting on `key`.
    ///
    /// Blocks until the broker acknowledged delivery.
    ///
    /// # Errors
    ///
    /// - [`EsubError::InvalidKey`] - `key` is empty
    /// - [`EsubError::NoSubscriber`] - nobody is waiting on `key`
    /// - [`EsubError::Unauthorized`] - the broker rejected the token
    /// - [`EsubError::ConnectionFailed`] - the broker is unreachable
    /// - [`EsubError::Canceled`] - timed out or the session was closed
    pub async fn reply(&self, key: &str, data: impl Into<Bytes>, token: Option<&Token>) -> Result<()> {
        // ---
        self.reply_with(key, data, token, ReplyOptions::default())
            .await
    }

    /// [`reply`](Self::reply) with a per-call timeout, cancellation token,
    /// or persistent-subscriber target.
    ///
    /// # Errors
    ///
    /// As `reply`; caller cancellation yields `Canceled(Caller)`.
    pub async fn reply_with(
        &self,
        key: &str,
        data: impl Into<Bytes>,
        token: Option<&Token>,
        opts: ReplyOptions,
    ) -> Result<()> {
        // ---
        let key = Key::new(key)?;
        let data = data.into();
        let token = self.resolve_token(token);
        let transport = self.inner.transport.clone();
        let psub = opts.psub;

        let exchange = {
            let key = key.clone();
            async move { transport.rep(&key, data, token.as_ref(), psub).await }
        };

        self.drive(
            OperationId::generate(),
            OperationKind::Reply,
            &key,
            opts.timeout,
            opts.cancel,
            exchange,
        )
        .await
    }

    /// Open a persistent subscription on `key`.
    ///
    /// Messages arrive on the returned stream until it is closed or
    /// dropped, `opts.timeout` elapses, the session is closed, or the
    /// connection ends.
    ///
    /// # Errors
    ///
    /// - [`EsubError::InvalidKey`] - `key` is empty
    /// - [`EsubError::KeyInUse`] - an exclusive subscriber owns `key`, or an
    ///   exclusive one was asked for while the key is in use
    /// - [`EsubError::Unauthorized`], [`EsubError::ConnectionFailed`]
    /// - [`EsubError::Canceled`] - the session is closed
    pub async fn persistent_subscribe(
        &self,
        key: &str,
        token: Option<&Token>,
        opts: PsubOptions,
    ) -> Result<PersistentSubscription> {
        // ---
        let key = Key::new(key)?;
        self.ensure_open()?;

        let token = self.resolve_token(token);
        let sub = self.inner.transport.psub(&key, token.as_ref(), opts).await?;
        log_info!("persistent subscription on {key} (shared: {})", opts.shared);
        Ok(sub)
    }

    /// Open a persistent publisher.
    ///
    /// Messages without a token after `opts` are applied carry the session
    /// token.
    ///
    /// # Errors
    ///
    /// [`EsubError::ConnectionFailed`] if the broker cannot be reached,
    /// [`EsubError::Canceled`] if the session is closed.
    pub async fn persistent_publisher(&self, opts: PrepOptions) -> Result<Publisher> {
        // ---
        self.ensure_open()?;

        let publisher = self
            .inner
            .transport
            .prep(opts, self.inner.config.token.clone())
            .await?;
        log_info!("persistent publisher opened");
        Ok(publisher)
    }

    /// IP of an available esub node.
    ///
    /// # Errors
    ///
    /// Fails if the transport has no node discovery or the broker cannot
    /// be reached.
    pub async fn node_ip(&self) -> Result<String> {
        // ---
        self.ensure_open()?;
        self.inner.transport.node_ip().await
    }

    /// A new session bound directly to the node [`node_ip`](Self::node_ip)
    /// names, with this session's configuration otherwise.
    ///
    /// # Errors
    ///
    /// As `node_ip`.
    pub async fn pinned_to_node(&self) -> Result<Self> {
        // ---
        let ip = self.node_ip().await?;
        log_debug!("pinning session to node {ip}");
        Self::new(self.inner.config.clone().with_host(ip)).await
    }

    /// Close the session.
    ///
    /// Every pending operation ends with `Canceled(Shutdown)`, persistent
    /// connections are closed, and later calls fail with
    /// `Canceled(Shutdown)`.
    ///
    /// # Errors
    ///
    /// Propagates a failure to close the transport.
    pub async fn close(&self) -> Result<()> {
        // ---
        let canceled = lock_ignore_poison(&self.inner.pending).close();
        for (_id, _entry) in &canceled {
            log_debug!("{} {_id} on {}: canceled by close", _entry.kind, _entry.key);
        }
        log_info!(
            "closing session on {} ({} pending operations canceled)",
            self.inner.transport.name(),
            canceled.len()
        );

        self.inner.transport.close().await
    }

    fn resolve_token(&self, token: Option<&Token>) -> Option<Token> {
        token.or(self.inner.config.token.as_ref()).cloned()
    }

    fn ensure_open(&self) -> Result<()> {
        // ---
        if lock_ignore_poison(&self.inner.pending).is_closed() {
            return Err(EsubError::Canceled(CancelReason::Shutdown));
        }
        Ok(())
    }

    async fn run_subscribe(
        &self,
        id: OperationId,
        key: Key,
        token: Option<Token>,
        opts: SubscribeOptions,
    ) -> Result<Bytes> {
        // ---
        let token = self.resolve_token(token.as_ref());
        let transport = self.inner.transport.clone();

        let exchange = {
            let key = key.clone();
            async move { transport.sub(&key, token.as_ref()).await }
        };

        self.drive(
            id,
            OperationKind::Subscribe,
            &key,
            opts.timeout,
            opts.cancel,
            exchange,
        )
        .await
    }

    /// Run one exchange as a registered operation.
    ///
    /// Cancellation is checked before the exchange is first polled, so an
    /// already-canceled call never reaches the broker. After that a ready
    /// exchange wins over any cancel signal: a message the broker already
    /// handed over is returned, not dropped.
    async fn drive<T, F>(
        &self,
        id: OperationId,
        kind: OperationKind,
        key: &Key,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
        exchange: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        // ---
        let shutdown = lock_ignore_poison(&self.inner.pending)
            .register(id.clone(), kind, key.clone())
            .ok_or(EsubError::Canceled(CancelReason::Shutdown))?;
        let _guard = PendingGuard {
            inner: &self.inner,
            id: id.clone(),
        };

        let cancel = cancel.unwrap_or_default();
        let until = timeout
            .or(self.inner.config.request_timeout)
            .map(|t| Instant::now() + t);

        log_debug!("{kind} {id} on {key}: issued");

        let outcome = if shutdown.is_cancelled() {
            Err(EsubError::Canceled(CancelReason::Shutdown))
        } else if cancel.is_cancelled() {
            Err(EsubError::Canceled(CancelReason::Caller))
        } else {
            tokio::select! {
                biased;
                result = exchange => result,
                _ = shutdown.cancelled() => Err(EsubError::Canceled(CancelReason::Shutdown)),
                _ = cancel.cancelled() => Err(EsubError::Canceled(CancelReason::Caller)),
                _ = deadline(until) => Err(EsubError::Canceled(CancelReason::Timeout)),
            }
        };

        match &outcome {
            Ok(_) => {
                log_debug!("{kind} {id} on {key}: fulfilled");
            }
            Err(_err) => {
                log_debug!(
                    "{kind} {id} on {key}: {:?} ({_err})",
                    OperationState::from_outcome(&outcome)
                );
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_transport, MemoryHub};

    async fn session(hub: &Arc<MemoryHub>, config: ClientConfig) -> EsubClient {
        // ---
        let transport = create_memory_transport(&config, hub.clone()).await.unwrap();
        EsubClient::with_transport(transport, config)
    }

    async fn wait_for_waiters(hub: &MemoryHub, key: &str, n: usize) {
        // ---
        let key = Key::new(key).unwrap();
        while hub.waiting(&key) < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_empty_key_rejected_before_sending() {
        // ---
        let hub = MemoryHub::new();
        let client = session(&hub, ClientConfig::default()).await;

        assert!(matches!(client.subscribe("", None).await, Err(EsubError::InvalidKey(_))));
        assert!(matches!(client.reply("", "x", None).await, Err(EsubError::InvalidKey(_))));
        assert_eq!(client.pending_operations(), 0);
    }

    #[tokio::test]
    async fn test_session_token_is_fallback() {
        // ---
        let hub = MemoryHub::with_tokens(["secret"]);
        let client = session(&hub, ClientConfig::default().with_token("secret")).await;

        let waiter = tokio::spawn({
            let client = client.clone();
            async move { client.subscribe("orders", None).await }
        });
        wait_for_waiters(&hub, "orders", 1).await;

        client.reply("orders", "shipped#42", None).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), Bytes::from("shipped#42"));
    }

    #[tokio::test]
    async fn test_precanceled_call_never_reaches_broker() {
        // ---
        let hub = MemoryHub::new();
        let client = session(&hub, ClientConfig::default()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .subscribe_with("orders", None, SubscribeOptions::new().with_cancel(cancel))
            .await
            .unwrap_err();
        assert!(matches!(err, EsubError::Canceled(CancelReason::Caller)));
        assert_eq!(hub.waiting(&Key::new("orders").unwrap()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_timeout_applies_to_every_call() {
        // ---
        let hub = MemoryHub::new();
        let config = ClientConfig::default().with_request_timeout(Duration::from_secs(5));
        let client = session(&hub, config).await;

        let err = client.subscribe("orders", None).await.unwrap_err();
        assert!(matches!(err, EsubError::Canceled(CancelReason::Timeout)));
        assert_eq!(client.pending_operations(), 0);
        assert_eq!(hub.waiting(&Key::new("orders").unwrap()), 0);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_and_later_calls() {
        // ---
        let hub = MemoryHub::new();
        let client = session(&hub, ClientConfig::default()).await;

        let waiter = tokio::spawn({
            let client = client.clone();
            async move { client.subscribe("orders", None).await }
        });
        wait_for_waiters(&hub, "orders", 1).await;
        assert_eq!(client.pending_operations(), 1);

        client.close().await.unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, EsubError::Canceled(CancelReason::Shutdown)));
        assert!(matches!(
            client.reply("orders", "x", None).await,
            Err(EsubError::Canceled(CancelReason::Shutdown))
        ));
        assert!(matches!(
            client.persistent_subscribe("feed", None, PsubOptions::default()).await,
            Err(EsubError::Canceled(CancelReason::Shutdown))
        ));
        assert_eq!(client.pending_operations(), 0);
    }

    #[tokio::test]
    async fn test_spawned_subscribe_reports_state() {
        // ---
        let hub = MemoryHub::new();
        let client = session(&hub, ClientConfig::default()).await;

        let mut handle = client
            .spawn_subscribe("orders", None, SubscribeOptions::default())
            .unwrap();
        assert_eq!(handle.key().as_str(), "orders");
        wait_for_waiters(&hub, "orders", 1).await;
        assert_eq!(handle.state(), OperationState::Issued);

        client.reply("orders", "shipped#42", None).await.unwrap();

        assert_eq!(handle.wait_terminal().await, OperationState::Fulfilled);
        assert_eq!(handle.join().await.unwrap(), Bytes::from("shipped#42"));
    }

    #[tokio::test]
    async fn test_spawned_subscribe_cancel() {
        // ---
        let hub = MemoryHub::new();
        let client = session(&hub, ClientConfig::default()).await;

        let mut handle = client
            .spawn_subscribe("orders", None, SubscribeOptions::default())
            .unwrap();
        wait_for_waiters(&hub, "orders", 1).await;

        handle.cancel();
        assert_eq!(handle.wait_terminal().await, OperationState::Canceled);
        assert!(matches!(
            handle.join().await,
            Err(EsubError::Canceled(CancelReason::Caller))
        ));

        let err = client.reply("orders", "late", None).await.unwrap_err();
        assert!(matches!(err, EsubError::NoSubscriber(_)));
    }

    #[tokio::test]
    async fn test_delivered_message_wins_over_later_cancel() {
        // ---
        let hub = MemoryHub::new();
        let client = session(&hub, ClientConfig::default()).await;
        let cancel = CancellationToken::new();

        let handle = client
            .spawn_subscribe("orders", None, SubscribeOptions::new().with_cancel(cancel.clone()))
            .unwrap();
        wait_for_waiters(&hub, "orders", 1).await;

        // The hub hands the message over before the spawned call runs again.
        client.reply("orders", "shipped#42", None).await.unwrap();
        cancel.cancel();

        assert_eq!(handle.join().await.unwrap(), Bytes::from("shipped#42"));
        assert_eq!(client.pending_operations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_message_wins_over_elapsed_deadline() {
        // ---
        let hub = MemoryHub::new();
        let client = session(&hub, ClientConfig::default()).await;

        let opts = SubscribeOptions::new().with_timeout(Duration::from_millis(100));
        let handle = client.spawn_subscribe("orders", None, opts).unwrap();
        wait_for_waiters(&hub, "orders", 1).await;

        client.reply("orders", "shipped#42", None).await.unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;

        assert_eq!(handle.join().await.unwrap(), Bytes::from("shipped#42"));
    }

    #[tokio::test]
    async fn test_reply_to_persistent_subscriber() {
        // ---
        let hub = MemoryHub::new();
        let client = session(&hub, ClientConfig::default()).await;

        let mut feed = client
            .persistent_subscribe("feed", None, PsubOptions::default())
            .await
            .unwrap();

        client
            .reply_with("feed", "tick", None, ReplyOptions::new().to_psub(true))
            .await
            .unwrap();
        assert_eq!(feed.recv().await.unwrap(), Bytes::from("tick"));
    }

    #[tokio::test]
    async fn test_node_ip_unsupported_in_memory() {
        // ---
        let hub = MemoryHub::new();
        let client = session(&hub, ClientConfig::default()).await;

        assert!(matches!(client.node_ip().await, Err(EsubError::InvalidConfig(_))));
    }
}
