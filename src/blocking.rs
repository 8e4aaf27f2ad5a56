//! Blocking esub session.
//!
//! [`Client`] wraps an [`EsubClient`] together with the tokio runtime that
//! drives it, so plain threads can call `subscribe` and `reply` and simply
//! block. One client can be shared across threads; each call blocks only
//! the thread that made it.
//!
//! Do not use these types from inside an async runtime: blocking there
//! panics. Use [`EsubClient`] instead.
//!
//! # Example
//!
//! ```
//! use std::thread;
//! use esub::blocking::Client;
//! use esub::{ClientConfig, MemoryHub, Token};
//!
//! # fn main() -> esub::Result<()> {
//! let client = Client::with_hub(ClientConfig::default(), MemoryHub::new())?;
//! let token = Token::from("secret");
//!
//! let subscriber = {
//!     let client = client.clone();
//!     let token = token.clone();
//!     thread::spawn(move || client.subscribe("orders", Some(&token)))
//! };
//!
//! while client.reply("orders", "shipped#42", Some(&token)).is_err() {
//!     thread::yield_now();
//! }
//! assert_eq!(&subscriber.join().unwrap()?[..], b"shipped#42");
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::{self, Runtime};

use crate::{
    // ---
    create_memory_transport,
    ClientConfig,
    EsubClient,
    EsubError,
    MemoryHub,
    OperationId,
    OperationState,
    PrepMessage,
    PrepOptions,
    PsubOptions,
    ReplyOptions,
    Result,
    SubscribeHandle,
    SubscribeOptions,
    Token,
};

/// Worker threads of the runtime behind a blocking client.
const WORKER_THREADS: usize = 2;

fn build_runtime() -> Result<Arc<Runtime>> {
    // ---
    runtime::Builder::new_multi_thread()
        .worker_threads(WORKER_THREADS)
        .thread_name("esub-worker")
        .enable_all()
        .build()
        .map(Arc::new)
        .map_err(|e| EsubError::InvalidConfig(format!("cannot start runtime: {e}")))
}

/// Blocking esub session.
///
/// Cheap to clone; clones share the runtime and the session.
#[derive(Clone)]
pub struct Client {
    // ---
    rt: Arc<Runtime>,
    inner: EsubClient,
}

impl Client {
    // ---

    /// Create a session speaking the esub node protocol at `config`'s
    /// endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EsubError::InvalidConfig`] if the endpoint is unusable or
    /// the runtime cannot start.
    pub fn new(config: ClientConfig) -> Result<Self> {
        // ---
        let rt = build_runtime()?;
        let inner = rt.block_on(EsubClient::new(config))?;
        Ok(Self { rt, inner })
    }

    /// Create a session from the `ESUB_*` environment variables.
    ///
    /// # Errors
    ///
    /// As [`ClientConfig::from_env`] and [`Client::new`].
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Create a session against an in-process [`MemoryHub`].
    ///
    /// # Errors
    ///
    /// Returns [`EsubError::InvalidConfig`] if the runtime cannot start.
    pub fn with_hub(config: ClientConfig, hub: Arc<MemoryHub>) -> Result<Self> {
        // ---
        let rt = build_runtime()?;
        let inner = rt.block_on(async {
            let transport = create_memory_transport(&config, hub).await?;
            Ok::<_, EsubError>(EsubClient::with_transport(transport, config))
        })?;
        Ok(Self { rt, inner })
    }

    /// The async session behind this client.
    pub fn session(&self) -> &EsubClient {
        &self.inner
    }

    /// Block until a message arrives on `key`. See [`EsubClient::subscribe`].
    pub fn subscribe(&self, key: &str, token: Option<&Token>) -> Result<Bytes> {
        self.rt.block_on(self.inner.subscribe(key, token))
    }

    /// See [`EsubClient::subscribe_with`].
    pub fn subscribe_with(
        &self,
        key: &str,
        token: Option<&Token>,
        opts: SubscribeOptions,
    ) -> Result<Bytes> {
        self.rt.block_on(self.inner.subscribe_with(key, token, opts))
    }

    /// Start a subscribe in the background.
    ///
    /// The returned [`PendingSubscribe`] can be canceled from any thread and
    /// waited on from one.
    pub fn spawn_subscribe(
        &self,
        key: &str,
        token: Option<&Token>,
        opts: SubscribeOptions,
    ) -> Result<PendingSubscribe> {
        // ---
        let _enter = self.rt.enter();
        let handle = self.inner.spawn_subscribe(key, token, opts)?;
        Ok(PendingSubscribe {
            rt: self.rt.clone(),
            handle,
        })
    }

    /// Block until the broker acknowledged delivery. See [`EsubClient::reply`].
    pub fn reply(&self, key: &str, data: impl Into<Bytes>, token: Option<&Token>) -> Result<()> {
        self.rt.block_on(self.inner.reply(key, data, token))
    }

    /// See [`EsubClient::reply_with`].
    pub fn reply_with(
        &self,
        key: &str,
        data: impl Into<Bytes>,
        token: Option<&Token>,
        opts: ReplyOptions,
    ) -> Result<()> {
        self.rt.block_on(self.inner.reply_with(key, data, token, opts))
    }

    /// See [`EsubClient::persistent_subscribe`].
    pub fn persistent_subscribe(
        &self,
        key: &str,
        token: Option<&Token>,
        opts: PsubOptions,
    ) -> Result<Subscription> {
        // ---
        let inner = self
            .rt
            .block_on(self.inner.persistent_subscribe(key, token, opts))?;
        Ok(Subscription {
            rt: self.rt.clone(),
            inner,
        })
    }

    /// See [`EsubClient::persistent_publisher`].
    pub fn persistent_publisher(&self, opts: PrepOptions) -> Result<Publisher> {
        // ---
        let inner = self.rt.block_on(self.inner.persistent_publisher(opts))?;
        Ok(Publisher {
            rt: self.rt.clone(),
            inner,
        })
    }

    /// See [`EsubClient::node_ip`].
    pub fn node_ip(&self) -> Result<String> {
        self.rt.block_on(self.inner.node_ip())
    }

    /// See [`EsubClient::pinned_to_node`].
    pub fn pinned_to_node(&self) -> Result<Self> {
        // ---
        let inner = self.rt.block_on(self.inner.pinned_to_node())?;
        Ok(Self {
            rt: self.rt.clone(),
            inner,
        })
    }

    /// Close the session. See [`EsubClient::close`].
    pub fn close(&self) -> Result<()> {
        self.rt.block_on(self.inner.close())
    }
}

/// A background subscribe started by [`Client::spawn_subscribe`].
pub struct PendingSubscribe {
    rt: Arc<Runtime>,
    handle: SubscribeHandle,
}

impl PendingSubscribe {
    // ---

    pub fn id(&self) -> &OperationId {
        self.handle.id()
    }

    /// Cancel the subscribe; [`wait`](Self::wait) then yields
    /// `Canceled(Caller)` unless the message already arrived.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn state(&self) -> OperationState {
        self.handle.state()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the subscribe ends.
    pub fn wait(self) -> Result<Bytes> {
        self.rt.block_on(self.handle.join())
    }
}

/// Blocking view of a persistent subscription.
///
/// Also an iterator over the delivered messages.
pub struct Subscription {
    rt: Arc<Runtime>,
    inner: crate::PersistentSubscription,
}

impl Subscription {
    /// Block until the next message, or `None` once the subscription ended.
    pub fn recv(&mut self) -> Option<Bytes> {
        self.rt.block_on(self.inner.recv())
    }

    pub fn close(&self) {
        self.inner.close();
    }
}

impl Iterator for Subscription {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        self.recv()
    }
}

/// Blocking view of a persistent publisher.
#[derive(Clone)]
pub struct Publisher {
    rt: Arc<Runtime>,
    inner: crate::Publisher,
}

impl Publisher {
    /// Send one message; see [`crate::Publisher::send`].
    pub fn send(&self, msg: PrepMessage) -> Result<Option<String>> {
        self.rt.block_on(self.inner.send(msg))
    }

    pub fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::thread;
    use std::time::Duration;

    use crate::{CancelReason, Key};

    fn wait_for_waiters(hub: &MemoryHub, key: &str, n: usize) {
        // ---
        let key = Key::new(key).unwrap();
        while hub.waiting(&key) < n {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_pending_subscribe_cancel_from_other_thread() {
        // ---
        let hub = MemoryHub::new();
        let client = Client::with_hub(ClientConfig::default(), hub.clone()).unwrap();

        let pending = client
            .spawn_subscribe("orders", None, SubscribeOptions::default())
            .unwrap();
        wait_for_waiters(&hub, "orders", 1);
        assert_eq!(pending.state(), OperationState::Issued);

        pending.cancel();
        assert!(matches!(
            pending.wait(),
            Err(EsubError::Canceled(CancelReason::Caller))
        ));
    }

    #[test]
    fn test_subscription_iterates_until_closed() {
        // ---
        let hub = MemoryHub::new();
        let client = Client::with_hub(ClientConfig::default(), hub.clone()).unwrap();

        let mut feed = client
            .persistent_subscribe("feed", None, PsubOptions::default())
            .unwrap();
        let publisher = client.persistent_publisher(PrepOptions::default()).unwrap();

        for i in 0..3 {
            let msg = PrepMessage::new("feed", format!("tick{i}")).to_psub(true);
            assert_eq!(publisher.send(msg).unwrap(), None);
        }

        let got: Vec<Bytes> = feed.by_ref().take(3).collect();
        assert_eq!(got, vec!["tick0", "tick1", "tick2"]);

        feed.close();
        assert!(feed.recv().is_none());
    }
}
