//! In-memory transport implementation.
//!
//! [`MemoryHub`] is a broker living inside the process. Any number of
//! memory transports can share one hub, exactly as sessions on different
//! hosts share an esub node. The hub is the reference for how this crate
//! expects a broker to pair calls:
//!
//! - Waiters on a key are served oldest first. A reply goes to the oldest
//!   live waiter holding the same token as the reply.
//! - Waiters exist but none holds the reply's token: `Unauthorized`.
//! - Nobody waiting: `NoSubscriber`, immediately.
//! - A canceled wait removes its waiter before anyone can deliver to it.
//! - Persistent subscribers are exclusive (one per key) or shared
//!   (served round robin). `reply(psub = true)` targets them.
//! - [`MemoryHub::shutdown`] behaves like the node going away: every blocked
//!   call fails with `ConnectionFailed`, and so does every later one.
//!
//! The hub does not emulate persistence or cross-process delivery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::deadline;

use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_info,
    ClientConfig,
    EsubError,
    Key,
    PersistentSubscription,
    PrepMessage,
    PrepOptions,
    PsubOptions,
    PublishCmd,
    Publisher,
    Result,
    Token,
    Transport,
    TransportPtr,
};

/// Queue depth of each persistent subscriber.
const PSUB_BUFFER: usize = 16;

/// Queue depth of a persistent publisher's command channel.
const PREP_BUFFER: usize = 16;

struct Waiter {
    id: u64,
    token: Option<Token>,
    tx: oneshot::Sender<Bytes>,
}

struct PsubMember {
    token: Option<Token>,
    tx: mpsc::Sender<Bytes>,
}

struct PsubGroup {
    shared: bool,
    members: Vec<PsubMember>,
    next: usize,
}

#[derive(Default)]
struct HubState {
    next_waiter: u64,
    waiters: HashMap<Key, VecDeque<Waiter>>,
    psubs: HashMap<Key, PsubGroup>,
    closed: bool,
}

/// In-process esub broker.
///
/// See the module docs for the pairing rules.
///
/// # Example
///
/// ```
/// # use esub::{Key, MemoryHub};
/// # use bytes::Bytes;
/// # async fn example() -> esub::Result<()> {
/// let hub = MemoryHub::new();
/// let key = Key::new("orders")?;
///
/// let waiter = {
///     let hub = hub.clone();
///     let key = key.clone();
///     tokio::spawn(async move { hub.sub(&key, None).await })
/// };
///
/// while hub.waiting(&key) == 0 {
///     tokio::task::yield_now().await;
/// }
/// hub.rep(&key, Bytes::from("shipped#42"), None, false).await?;
/// assert_eq!(waiter.await.unwrap()?, Bytes::from("shipped#42"));
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    state: Mutex<HubState>,
    allowed: Option<HashSet<Token>>,
}

impl MemoryHub {
    /// Create a hub that accepts any token, including none.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// Create a hub that only accepts calls carrying one of `tokens`.
    pub fn with_tokens<I, T>(tokens: I) -> Arc<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<Token>,
    {
        // ---
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
            allowed: Some(tokens.into_iter().map(Into::into).collect()),
        })
    }

    fn authorize(&self, token: Option<&Token>) -> Result<()> {
        // ---
        match &self.allowed {
            None => Ok(()),
            Some(allowed) => match token {
                Some(token) if allowed.contains(token) => Ok(()),
                _ => Err(EsubError::Unauthorized),
            },
        }
    }

    /// Wait on `key` for one reply.
    ///
    /// # Errors
    ///
    /// - [`EsubError::Unauthorized`] if the token is not accepted.
    /// - [`EsubError::ConnectionFailed`] if the hub is or gets shut down.
    pub async fn sub(&self, key: &Key, token: Option<&Token>) -> Result<Bytes> {
        // ---
        self.authorize(token)?;

        let (id, rx) = {
            let mut state = lock_ignore_poison(&self.state);
            if state.closed {
                return Err(hub_closed());
            }

            let id = state.next_waiter;
            state.next_waiter += 1;

            let (tx, rx) = oneshot::channel();
            state.waiters.entry(key.clone()).or_default().push_back(Waiter {
                id,
                token: token.cloned(),
                tx,
            });
            (id, rx)
        };

        log_debug!("memory hub: waiter {id} on {key}");

        let _guard = WaiterGuard { hub: self, key, id };
        rx.await.map_err(|_| hub_closed())
    }

    /// Hand `data` to a waiter on `key`, or to a persistent subscriber when
    /// `psub` is set.
    ///
    /// # Errors
    ///
    /// - [`EsubError::NoSubscriber`] if nobody is waiting.
    /// - [`EsubError::Unauthorized`] if the token is not accepted or matches
    ///   none of the waiters.
    /// - [`EsubError::ConnectionFailed`] if the hub is shut down.
    pub async fn rep(
        &self,
        key: &Key,
        data: Bytes,
        token: Option<&Token>,
        psub: bool,
    ) -> Result<()> {
        // ---
        self.authorize(token)?;

        if psub {
            return self.rep_psub(key, data, token).await;
        }

        let mut guard = lock_ignore_poison(&self.state);
        let state = &mut *guard;
        if state.closed {
            return Err(hub_closed());
        }

        let mut data = data;
        loop {
            let Some(queue) = state.waiters.get_mut(key) else {
                return Err(EsubError::NoSubscriber(key.to_string()));
            };

            queue.retain(|w| !w.tx.is_closed());
            if queue.is_empty() {
                state.waiters.remove(key);
                return Err(EsubError::NoSubscriber(key.to_string()));
            }

            let Some(pos) = queue.iter().position(|w| w.token.as_ref() == token) else {
                return Err(EsubError::Unauthorized);
            };

            let Some(waiter) = queue.remove(pos) else {
                return Err(EsubError::NoSubscriber(key.to_string()));
            };

            match waiter.tx.send(data) {
                Ok(()) => {
                    log_debug!("memory hub: delivered to waiter {} on {key}", waiter.id);
                    return Ok(());
                }
                // Waiter went away between the liveness check and the send.
                Err(returned) => data = returned,
            }
        }
    }

    async fn rep_psub(&self, key: &Key, data: Bytes, token: Option<&Token>) -> Result<()> {
        // ---
        let mut data = data;
        loop {
            let tx = {
                let mut guard = lock_ignore_poison(&self.state);
                let state = &mut *guard;
                if state.closed {
                    return Err(hub_closed());
                }

                let Some(group) = state.psubs.get_mut(key) else {
                    return Err(EsubError::NoSubscriber(key.to_string()));
                };

                group.members.retain(|m| !m.tx.is_closed());
                if group.members.is_empty() {
                    state.psubs.remove(key);
                    return Err(EsubError::NoSubscriber(key.to_string()));
                }

                let n = group.members.len();
                let start = group.next % n;
                let Some(idx) = (0..n)
                    .map(|i| (start + i) % n)
                    .find(|&i| group.members[i].token.as_ref() == token)
                else {
                    return Err(EsubError::Unauthorized);
                };

                group.next = idx + 1;
                group.members[idx].tx.clone()
            };

            match tx.send(data).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => data = returned,
            }
        }
    }

    /// Register a persistent subscriber on `key`.
    ///
    /// # Errors
    ///
    /// - [`EsubError::KeyInUse`] if an exclusive subscriber holds the key, or
    ///   an exclusive one is requested while any subscriber is live.
    /// - [`EsubError::Unauthorized`] if the token is not accepted.
    /// - [`EsubError::ConnectionFailed`] if the hub is shut down.
    pub fn psub(
        &self,
        key: &Key,
        token: Option<&Token>,
        shared: bool,
    ) -> Result<mpsc::Receiver<Bytes>> {
        // ---
        self.authorize(token)?;

        let mut state = lock_ignore_poison(&self.state);
        if state.closed {
            return Err(hub_closed());
        }

        let group = state.psubs.entry(key.clone()).or_insert_with(|| PsubGroup {
            shared,
            members: Vec::new(),
            next: 0,
        });

        group.members.retain(|m| !m.tx.is_closed());
        if !group.members.is_empty() && !(shared && group.shared) {
            return Err(EsubError::KeyInUse(key.to_string()));
        }

        group.shared = shared;
        let (tx, rx) = mpsc::channel(PSUB_BUFFER);
        group.members.push(PsubMember {
            token: token.cloned(),
            tx,
        });

        log_debug!("memory hub: persistent subscriber on {key} (shared: {shared})");
        Ok(rx)
    }

    /// Number of live one-shot waiters on `key`.
    pub fn waiting(&self, key: &Key) -> usize {
        // ---
        let state = lock_ignore_poison(&self.state);
        state
            .waiters
            .get(key)
            .map(|q| q.iter().filter(|w| !w.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Number of live persistent subscribers on `key`.
    pub fn persistent_subscribers(&self, key: &Key) -> usize {
        // ---
        let state = lock_ignore_poison(&self.state);
        state
            .psubs
            .get(key)
            .map(|g| g.members.iter().filter(|m| !m.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Take the hub down. Blocked and future calls fail with
    /// [`EsubError::ConnectionFailed`].
    pub fn shutdown(&self) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.closed = true;
        state.waiters.clear();
        state.psubs.clear();
        log_info!("memory hub: shut down");
    }

    fn forget_waiter(&self, key: &Key, id: u64) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if let Some(queue) = state.waiters.get_mut(key) {
            queue.retain(|w| w.id != id);
            if queue.is_empty() {
                state.waiters.remove(key);
            }
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            allowed: None,
        }
    }
}

/// Removes a waiter from the hub when its `sub` call ends for any reason.
struct WaiterGuard<'a> {
    hub: &'a MemoryHub,
    key: &'a Key,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.hub.forget_waiter(self.key, self.id);
    }
}

fn hub_closed() -> EsubError {
    EsubError::ConnectionFailed("memory hub shut down".into())
}

/// Session-side view of a [`MemoryHub`].
struct MemoryTransport {
    // ---
    name: String,
    hub: Arc<MemoryHub>,
    confirm_receipt: bool,

    /// Parent of every persistent task this transport spawns.
    closed: CancellationToken,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        // ---
        if self.closed.is_cancelled() {
            return Err(EsubError::ConnectionFailed(format!("{}: transport closed", self.name)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn name(&self) -> &str {
        &self.name
    }

    async fn sub(&self, key: &Key, token: Option<&Token>) -> Result<Bytes> {
        self.ensure_open()?;
        self.hub.sub(key, token).await
    }

    async fn rep(&self, key: &Key, data: Bytes, token: Option<&Token>, psub: bool) -> Result<()> {
        self.ensure_open()?;
        self.hub.rep(key, data, token, psub).await
    }

    /// Forward the hub's stream into a fresh inbox until closed or timed out.
    async fn psub(
        &self,
        key: &Key,
        token: Option<&Token>,
        opts: PsubOptions,
    ) -> Result<PersistentSubscription> {
        // ---
        self.ensure_open()?;

        let mut from_hub = self.hub.psub(key, token, opts.shared)?;
        let (tx, inbox) = mpsc::channel(PSUB_BUFFER);
        let closer = self.closed.child_token();
        let stop = closer.clone();
        let until = opts.timeout.map(|t: Duration| Instant::now() + t);
        let _key = key.clone();

        tokio::spawn(async move {
            // ---
            loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = deadline(until) => {
                        log_debug!("memory psub on {_key}: timeout reached");
                        break;
                    }
                    msg = from_hub.recv() => msg,
                };

                match next {
                    Some(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            log_debug!("memory psub on {_key}: closed");
        });

        Ok(PersistentSubscription::new(inbox, closer))
    }

    async fn prep(&self, opts: PrepOptions, session_token: Option<Token>) -> Result<Publisher> {
        // ---
        self.ensure_open()?;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<PublishCmd>(PREP_BUFFER);
        let closer = self.closed.child_token();
        let stop = closer.clone();
        let hub = self.hub.clone();
        let confirm = self.confirm_receipt;

        tokio::spawn(async move {
            // ---
            loop {
                let cmd = tokio::select! {
                    _ = stop.cancelled() => break,
                    cmd = cmd_rx.recv() => cmd,
                };
                let Some(PublishCmd { msg, resp }) = cmd else {
                    break;
                };

                let msg = msg.resolve(&opts, session_token.as_ref());
                let result = deliver(&hub, msg)
                    .await
                    .map(|()| confirm.then(|| "ok".to_string()));
                let _ = resp.send(result);
            }
        });

        Ok(Publisher::new(cmd_tx, closer))
    }

    /// Cancels this transport's persistent tasks. The hub itself stays up
    /// for any other transport sharing it.
    async fn close(&self) -> Result<()> {
        // ---
        log_debug!("{}: closing transport...", self.name);
        self.closed.cancel();
        Ok(())
    }
}

async fn deliver(hub: &MemoryHub, msg: PrepMessage) -> Result<()> {
    // ---
    let key = Key::new(msg.key)?;
    let token = msg.token.map(Token::from);
    hub.rep(&key, Bytes::from(msg.data), token.as_ref(), msg.psub)
        .await
}

/// Create a transport that talks to `hub`.
///
/// Only `confirm_receipt` is read from `config`; the endpoint fields are
/// ignored.
///
/// # Errors
///
/// Currently infallible.
pub async fn create_memory_transport(
    config: &ClientConfig,
    hub: Arc<MemoryHub>,
) -> Result<TransportPtr> {
    // ---
    log_debug!("create memory transport");

    let transport = MemoryTransport {
        name: "memory".into(),
        hub,
        confirm_receipt: config.confirm_receipt,
        closed: CancellationToken::new(),
    };

    Ok(Arc::new(transport))
}
