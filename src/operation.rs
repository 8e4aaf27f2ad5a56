use std::fmt;

use uuid::Uuid;

use crate::{EsubError, Result};

/// Unique identifier of one in-flight `subscribe` or `reply`.
///
/// Local to the session; never sent to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generate a new unique operation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which blocking call an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Subscribe,
    Reply,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Subscribe => f.write_str("subscribe"),
            OperationKind::Reply => f.write_str("reply"),
        }
    }
}

/// Lifecycle of a pending operation.
///
/// ```text
/// Issued --(broker delivers/acks)--> Fulfilled
/// Issued --(cancel signal)---------> Canceled
/// Issued --(transport error)-------> Failed
/// ```
///
/// The three right-hand states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Issued,
    Fulfilled,
    Canceled,
    Failed,
}

impl OperationState {
    /// Terminal state reached by an operation that finished with `outcome`.
    pub fn from_outcome<T>(outcome: &Result<T>) -> Self {
        // ---
        match outcome {
            Ok(_) => OperationState::Fulfilled,
            Err(EsubError::Canceled(_)) => OperationState::Canceled,
            Err(_) => OperationState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationState::Issued)
    }
}
