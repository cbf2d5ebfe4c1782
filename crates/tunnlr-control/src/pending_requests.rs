//! Correlation of forwarded requests with agent responses
//!
//! Each forwarded request installs a one-shot slot keyed by its request id. The slot is
//! removed exactly once, either by [`PendingRequests::deliver`] or by the waiter's timeout.
//! Whichever side removes the map entry wins; the other side becomes a no-op.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use tunnlr_proto::ResponseEnvelope;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AwaitError {
    #[error("Timed out waiting for response")]
    TimedOut,

    #[error("Pending request was cancelled")]
    Cancelled,

    #[error("Request {0} is already pending")]
    Duplicate(String),
}

/// Outcome of delivering a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A waiter was released
    Resolved,
    /// No waiter for that id (unknown, timed out, or cancelled)
    Unknown,
}

/// Tracks requests awaiting a response from an agent
#[derive(Clone, Default)]
pub struct PendingRequests {
    requests: Arc<DashMap<String, oneshot::Sender<ResponseEnvelope>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a pending entry. Call this before the request is sent so a fast response cannot
    /// arrive ahead of its waiter.
    pub fn register(&self, request_id: impl Into<String>) -> Result<PendingResponse, AwaitError> {
        let request_id = request_id.into();
        let (tx, rx) = oneshot::channel();

        match self.requests.entry(request_id.clone()) {
            Entry::Occupied(_) => return Err(AwaitError::Duplicate(request_id)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        debug!("Registered pending request {}", request_id);

        Ok(PendingResponse {
            request_id,
            rx,
            requests: self.requests.clone(),
            finished: false,
        })
    }

    /// Register and wait in one step
    pub async fn await_response(
        &self,
        request_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, AwaitError> {
        self.register(request_id)?.wait(timeout).await
    }

    /// Hand a response to its waiter
    pub fn deliver(&self, response: ResponseEnvelope) -> Delivery {
        let request_id = response.request_id.clone();

        match self.requests.remove(&request_id) {
            Some((_, tx)) => {
                if tx.send(response).is_err() {
                    warn!("Waiter for request {} went away", request_id);
                    return Delivery::Unknown;
                }
                debug!("Delivered response for request {}", request_id);
                Delivery::Resolved
            }
            None => {
                debug!(
                    "No pending request {} (timed out or unknown), dropping response",
                    request_id
                );
                Delivery::Unknown
            }
        }
    }

    /// Drop a pending entry; its waiter observes [`AwaitError::Cancelled`]
    pub fn cancel(&self, request_id: &str) -> bool {
        let removed = self.requests.remove(request_id).is_some();
        if removed {
            debug!("Cancelled pending request {}", request_id);
        }
        removed
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.requests.contains_key(request_id)
    }

    pub fn count(&self) -> usize {
        self.requests.len()
    }
}

/// The waiting half of a pending request.
///
/// Dropping it before completion removes the entry, so a caller that goes away never leaves
/// a slot behind.
pub struct PendingResponse {
    request_id: String,
    rx: oneshot::Receiver<ResponseEnvelope>,
    requests: Arc<DashMap<String, oneshot::Sender<ResponseEnvelope>>>,
    finished: bool,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the response, giving up after `timeout`
    pub async fn wait(mut self, timeout: Duration) -> Result<ResponseEnvelope, AwaitError> {
        let result = match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(AwaitError::Cancelled),
            Err(_) => {
                if self.requests.remove(&self.request_id).is_some() {
                    debug!("Request {} timed out after {:?}", self.request_id, timeout);
                    Err(AwaitError::TimedOut)
                } else {
                    // deliver() won the removal; its value is already on the way
                    (&mut self.rx).await.map_err(|_| AwaitError::Cancelled)
                }
            }
        };

        self.finished = true;
        result
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.finished {
            self.requests.remove(&self.request_id);
        }
    }
}
