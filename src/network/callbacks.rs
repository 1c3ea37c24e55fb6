//! Request/response correlation
//!
//! A request that expects a Value or Ack registers its message id here
//! before it is sent. The matching reply completes the one-shot handle.
//! Waiting always has a deadline and always removes the entry.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::protocol::Value;

/// A correlated reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value(Value),
    Ack(Value),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CallbackError {
    #[error("No reply to {0} within {1:?}")]
    Timeout(Uuid, Duration),

    #[error("Request {0} was cancelled")]
    Cancelled(Uuid),
}

/// Outstanding requests keyed by message id
#[derive(Debug, Default)]
pub struct PendingCallbacks {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Reply>>>,
}

impl PendingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: Uuid) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        rx
    }

    /// Complete a pending request. Returns false if nothing was waiting.
    pub async fn fulfil(&self, id: &Uuid, reply: Reply) -> bool {
        let Some(tx) = self.pending.lock().await.remove(id) else {
            return false;
        };
        tx.send(reply).is_ok()
    }

    pub async fn cancel(&self, id: &Uuid) {
        self.pending.lock().await.remove(id);
    }

    /// Wait for the reply registered under `id`
    pub async fn wait(
        &self,
        id: Uuid,
        rx: oneshot::Receiver<Reply>,
        timeout: Duration,
    ) -> Result<Reply, CallbackError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CallbackError::Cancelled(id)),
            Err(_) => {
                self.cancel(&id).await;
                Err(CallbackError::Timeout(id, timeout))
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }
}
