//! One-shot acknowledgment slots.
//!
//! The transport creates a slot per inbound event that asked for a reply and
//! keeps the [`AckReceiver`]. The dispatcher carries the [`AckHandle`] and
//! consumes it with [`AckHandle::fulfill`], so a slot is answered at most once.
//! Dropping the handle unanswered (the connection went away first) surfaces on
//! the receiver as [`AckError::Discarded`].

use std::time::Duration;

use hyperf_core::FieldErrors;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

/// Body of an acknowledgment, as the caller sees it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AckResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<FieldErrors>,
}

impl AckResponse {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            errors: None,
        }
    }

    pub fn failure(errors: FieldErrors) -> Self {
        Self {
            success: false,
            data: None,
            errors: Some(errors),
        }
    }
}

impl From<Result<Value, FieldErrors>> for AckResponse {
    fn from(result: Result<Value, FieldErrors>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(errors) => Self::failure(errors),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AckError {
    #[error("acknowledgment timed out after {0:?}")]
    TimedOut(Duration),
    #[error("acknowledgment discarded before completion")]
    Discarded,
}

/// Create a linked handle/receiver pair.
pub fn channel() -> (AckHandle, AckReceiver) {
    let (tx, rx) = oneshot::channel();
    (AckHandle { tx }, AckReceiver { rx })
}

/// Dispatcher side of a slot.
#[derive(Debug)]
pub struct AckHandle {
    tx: oneshot::Sender<AckResponse>,
}

impl AckHandle {
    /// Answer the slot. Returns `false` if nobody is waiting any more.
    pub fn fulfill(self, response: AckResponse) -> bool {
        self.tx.send(response).is_ok()
    }

    /// Whether the receiving side has already given up.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Transport side of a slot.
#[derive(Debug)]
pub struct AckReceiver {
    rx: oneshot::Receiver<AckResponse>,
}

impl AckReceiver {
    /// Wait without a deadline.
    pub async fn recv(self) -> Result<AckResponse, AckError> {
        self.rx.await.map_err(|_| AckError::Discarded)
    }

    /// Wait at most `timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<AckResponse, AckError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(AckError::Discarded),
            Err(_) => Err(AckError::TimedOut(timeout)),
        }
    }
}
