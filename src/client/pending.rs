use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::{Key, OperationId, OperationKind};

/// One in-flight operation as seen by the registry.
#[derive(Debug)]
pub(super) struct PendingEntry {
    pub kind: OperationKind,
    pub key: Key,
    shutdown: CancellationToken,
}

/// Tracks the session's in-flight operations.
///
/// Each registered operation gets its own shutdown token. Closing the
/// registry fires all of them and refuses later registrations, so an
/// operation either sees the close or is never issued.
pub(super) struct PendingOperations {
    // ---
    ops: HashMap<OperationId, PendingEntry>,
    closed: bool,
}

impl PendingOperations {
    // ---

    pub fn new() -> Self {
        // ---
        Self {
            ops: HashMap::new(),
            closed: false,
        }
    }

    /// Register an operation.
    ///
    /// Returns the token that fires when the session closes, or `None` if
    /// it already has.
    pub fn register(
        &mut self,
        id: OperationId,
        kind: OperationKind,
        key: Key,
    ) -> Option<CancellationToken> {
        // ---
        if self.closed {
            return None;
        }

        let shutdown = CancellationToken::new();
        self.ops.insert(
            id,
            PendingEntry {
                kind,
                key,
                shutdown: shutdown.clone(),
            },
        );
        Some(shutdown)
    }

    /// Forget a finished operation.
    ///
    /// Returns the entry if the id was still registered.
    pub fn remove(&mut self, id: &OperationId) -> Option<PendingEntry> {
        // ---
        self.ops.remove(id)
    }

    /// Cancel every registered operation and refuse new ones.
    ///
    /// Returns the canceled operations.
    pub fn close(&mut self) -> Vec<(OperationId, PendingEntry)> {
        // ---
        self.closed = true;
        let canceled: Vec<_> = self.ops.drain().collect();
        for (_, entry) in &canceled {
            entry.shutdown.cancel();
        }
        canceled
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Get the number of in-flight operations
    pub fn len(&self) -> usize {
        // ---
        self.ops.len()
    }
}
