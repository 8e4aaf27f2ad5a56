//! Client for the esub micro message-passing service.
//!
//! An esub node pairs two blocking calls by key: [`EsubClient::subscribe`]
//! waits on a key until someone calls [`EsubClient::reply`] on the same key,
//! then returns that reply's payload. Both calls can be canceled, time out,
//! and report broker-side failures through [`EsubError`].
//!
//! The async [`EsubClient`] is the core; [`blocking::Client`] wraps it for
//! plain threads. Persistent subscriptions and publishers keep one
//! connection open for many messages.
//!
//! Transports sit behind the [`Transport`] trait:
//!
//! - [`create_http_transport`] speaks the esub node protocol.
//! - [`create_memory_transport`] talks to an in-process [`MemoryHub`].
//!

use std::sync::{Mutex, MutexGuard};

// Import all sub modules once...
mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

mod client;
mod domain;
mod transport;

mod config;

mod error;
mod key;
mod operation;

pub mod blocking;

// Re-export main types
pub use client::{EsubClient, ReplyOptions, SubscribeHandle, SubscribeOptions};

pub use config::{ClientConfig, DEFAULT_PORT};

pub use error::{CancelReason, EsubError, Result};
pub use key::{Key, Token};
pub use operation::{OperationId, OperationKind, OperationState};

pub use transport::{create_http_transport, create_memory_transport, MemoryHub};

// --- public re-exports
pub use domain::{
    //
    PersistentSubscription,
    PrepMessage,
    PrepOptions,
    PsubOptions,
    PublishCmd,
    Publisher,
    Transport,
    TransportPtr,
};

/// Acquire a mutex guard, ignoring poisoning.
///
/// Every mutex in this crate guards plain collections updated by single
/// inserts and removes, so a panic elsewhere cannot leave one half-updated.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Re-exported so callers can build cancellation tokens without a direct
/// `tokio-util` dependency.
pub use tokio_util::sync::CancellationToken;
