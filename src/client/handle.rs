use std::panic;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{CancelReason, EsubError, Key, OperationId, OperationState, Result};

/// A `subscribe` running on its own task.
///
/// Returned by [`EsubClient::spawn_subscribe`](crate::EsubClient::spawn_subscribe).
/// Dropping the handle detaches the operation; it still ends on delivery,
/// timeout, or session close.
pub struct SubscribeHandle {
    // ---
    id: OperationId,
    key: Key,
    cancel: CancellationToken,
    state: watch::Receiver<OperationState>,
    task: JoinHandle<Result<Bytes>>,
}

impl SubscribeHandle {
    // ---

    pub(crate) fn new(
        id: OperationId,
        key: Key,
        cancel: CancellationToken,
        state: watch::Receiver<OperationState>,
        task: JoinHandle<Result<Bytes>>,
    ) -> Self {
        Self {
            id,
            key,
            cancel,
            state,
            task,
        }
    }

    pub fn id(&self) -> &OperationId {
        &self.id
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Ask the operation to stop. [`join`](Self::join) then yields
    /// `Canceled(Caller)` unless the message was already delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OperationState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the operation to reach a terminal state.
    pub async fn wait_terminal(&mut self) -> OperationState {
        // ---
        match self.state.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            // The task is gone without reporting; it was aborted with the runtime.
            Err(_) => OperationState::Canceled,
        }
    }

    /// Wait for the message.
    ///
    /// # Errors
    ///
    /// Any error `subscribe` can return. If the runtime dropped the task
    /// first, `Canceled(Shutdown)`.
    pub async fn join(self) -> Result<Bytes> {
        // ---
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
            Err(_) => Err(EsubError::Canceled(CancelReason::Shutdown)),
        }
    }
}
