use std::fmt;

use thiserror::Error;

/// Why a blocking wait ended before it was fulfilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller triggered the operation's cancellation token.
    Caller,

    /// The per-call or session timeout elapsed.
    Timeout,

    /// The session was closed while the operation was pending.
    Shutdown,

    /// The broker ended the wait on its side (e.g. its own timeout).
    Broker,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let reason = match self {
            CancelReason::Caller => "canceled by caller",
            CancelReason::Timeout => "timed out",
            CancelReason::Shutdown => "session closed",
            CancelReason::Broker => "canceled by broker",
        };
        f.write_str(reason)
    }
}

/// Errors surfaced by esub operations.
///
/// The client never recovers from or retries any of these on its own; every
/// error reaches the caller of `subscribe`/`reply` unchanged.
#[derive(Error, Debug)]
pub enum EsubError {
    /// The blocking wait was aborted before fulfillment.
    #[error("operation {0}")]
    Canceled(CancelReason),

    /// The broker rejected the token.
    #[error("token rejected by broker")]
    Unauthorized,

    /// The broker could not be reached or the connection dropped mid-wait.
    #[error("connection to broker failed: {0}")]
    ConnectionFailed(String),

    /// A reply found nobody waiting on the key.
    #[error("no subscriber waiting on key {0:?}")]
    NoSubscriber(String),

    /// An exclusive persistent subscriber already owns the key.
    #[error("key {0:?} already has an exclusive persistent subscriber")]
    KeyInUse(String),

    /// The key failed validation before anything was sent.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A configuration value could not be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The broker answered with a status this client has no mapping for.
    #[error("broker returned status {status}: {message}")]
    Broker { status: u16, message: String },

    /// Local I/O failed (reading input, writing output).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EsubError {
    /// True for every `Canceled` variant, whatever the reason.
    pub fn is_canceled(&self) -> bool {
        matches!(self, EsubError::Canceled(_))
    }

    pub(crate) fn connection(err: impl fmt::Display) -> Self {
        EsubError::ConnectionFailed(err.to_string())
    }
}

/// Result type alias for esub operations
pub type Result<T> = std::result::Result<T, EsubError>;
