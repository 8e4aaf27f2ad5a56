//! Transport implementations.
//!
//! Concrete implementations of the domain-level `Transport` trait, exposed
//! only through constructor functions:
//!
//! - [`create_http_transport`]: the esub node's HTTP/WebSocket protocol
//! - [`create_memory_transport`]: an in-process [`MemoryHub`]
//!
//! Session code must not depend on transport-specific types.

mod http;
mod memory;
mod ws;

pub use http::create_transport as create_http_transport;
pub use memory::{create_memory_transport, MemoryHub};

use tokio::time::{self, Instant};

use crate::{CancelReason, EsubError};

/// Which broker endpoint produced a status, for mapping it to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Call {
    Sub,
    Rep,
    Psub,
    Prep,
    Info,
}

/// Map a non-success broker status to the error a caller sees.
///
/// | status | error |
/// |---|---|
/// | 401, 403 | `Unauthorized` |
/// | 404 on `rep` | `NoSubscriber` |
/// | 408, 504 | `Canceled(Broker)` |
/// | 409 on `psub` | `KeyInUse` |
/// | anything else | `Broker { status, message }` |
pub(crate) fn status_error(call: Call, status: u16, key: &str, message: String) -> EsubError {
    // ---
    match (status, call) {
        (401 | 403, _) => EsubError::Unauthorized,
        (404, Call::Rep) => EsubError::NoSubscriber(key.to_string()),
        (408 | 504, _) => EsubError::Canceled(CancelReason::Broker),
        (409, Call::Psub) => EsubError::KeyInUse(key.to_string()),
        (status, _) => EsubError::Broker { status, message },
    }
}

/// Resolves at `at`, or never.
pub(crate) async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_status_mapping() {
        // ---
        assert!(matches!(
            status_error(Call::Sub, 401, "k", String::new()),
            EsubError::Unauthorized
        ));
        assert!(matches!(
            status_error(Call::Rep, 403, "k", String::new()),
            EsubError::Unauthorized
        ));
        assert!(matches!(
            status_error(Call::Rep, 404, "k", String::new()),
            EsubError::NoSubscriber(k) if k == "k"
        ));
        assert!(matches!(
            status_error(Call::Sub, 404, "k", "gone".into()),
            EsubError::Broker { status: 404, .. }
        ));
        assert!(matches!(
            status_error(Call::Sub, 504, "k", String::new()),
            EsubError::Canceled(CancelReason::Broker)
        ));
        assert!(matches!(
            status_error(Call::Psub, 409, "k", String::new()),
            EsubError::KeyInUse(_)
        ));
        assert!(matches!(
            status_error(Call::Info, 500, "", "boom".into()),
            EsubError::Broker { status: 500, message } if message == "boom"
        ));
    }
}
