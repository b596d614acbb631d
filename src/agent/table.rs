//! Correlation table: the single record of which request ids are in flight.
//!
//! Every operation takes the one table mutex for its whole duration and never
//! holds it across an `.await`, so no caller can observe a half-applied
//! change for an id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::error::{RequestFailure, TableError};
use crate::protocol::RequestId;

/// Lifecycle of one relayed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Received, waiting for a concurrency slot
    Pending,
    /// Local call dispatched, no response headers yet
    Executing,
    /// `meta` published, body being relayed
    StreamingResponse,
    Completed,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }

    fn can_become(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Pending, Executing) | (Executing, StreamingResponse) => true,
            (StreamingResponse, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Why a request's task was told to stop early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The edge router reported the public client gone
    Cancelled,
    ShuttingDown,
}

impl From<AbortReason> for RequestFailure {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Cancelled => RequestFailure::Cancelled,
            AbortReason::ShuttingDown => RequestFailure::AgentShuttingDown,
        }
    }
}

/// Handle stored in the table to stop a request's task
#[derive(Debug)]
pub struct RequestHandle {
    tx: watch::Sender<Option<AbortReason>>,
}

/// Receiving side, raced against the request's work
#[derive(Debug)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<AbortReason>>,
}

/// Create a connected handle/signal pair for one request
pub fn abort_pair() -> (RequestHandle, AbortSignal) {
    let (tx, rx) = watch::channel(None);
    (RequestHandle { tx }, AbortSignal { rx })
}

impl RequestHandle {
    /// Signal the task; the first reason wins. Returns whether this call set it.
    pub fn abort(&self, reason: AbortReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }
}

impl AbortSignal {
    /// Resolves once the request has been aborted
    pub async fn aborted(&mut self) -> AbortReason {
        loop {
            let current = *self.rx.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without aborting: never fires
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Bookkeeping for one request while it is in flight.
///
/// Headers and body are owned by the request's task, not duplicated here.
#[derive(Debug, Clone)]
pub struct InFlightRequest {
    pub id: RequestId,
    pub method: String,
    pub path: String,
    pub arrived_at: Instant,
    pub deadline: Instant,
    pub state: RequestState,
}

impl InFlightRequest {
    pub fn new(id: RequestId, method: &str, path: &str, timeout: Duration) -> Self {
        let arrived_at = Instant::now();
        Self {
            id,
            method: method.to_string(),
            path: path.to_string(),
            arrived_at,
            deadline: arrived_at + timeout,
            state: RequestState::Pending,
        }
    }
}

struct Entry {
    request: InFlightRequest,
    handle: RequestHandle,
}

#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<RequestId, Entry>>,
    idle: Notify,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, request: InFlightRequest, handle: RequestHandle) -> Result<(), TableError> {
        let mut entries = self.lock();
        if entries.contains_key(&request.id) {
            return Err(TableError::DuplicateId(request.id));
        }
        entries.insert(request.id.clone(), Entry { request, handle });
        Ok(())
    }

    /// Move `id` to `to`, returning the previous state
    pub fn transition(&self, id: &RequestId, to: RequestState) -> Result<RequestState, TableError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| TableError::UnknownId(id.clone()))?;

        let from = entry.request.state;
        if !from.can_become(to) {
            return Err(TableError::InvalidTransition {
                id: id.clone(),
                from,
                to,
            });
        }
        entry.request.state = to;
        Ok(from)
    }

    /// Apply a terminal transition and drop the entry in one step
    pub fn finish(&self, id: &RequestId, to: RequestState) -> Result<InFlightRequest, TableError> {
        debug_assert!(to.is_terminal());
        let mut entries = self.lock();
        let from = entries
            .get(id)
            .map(|e| e.request.state)
            .ok_or_else(|| TableError::UnknownId(id.clone()))?;
        if !from.can_become(to) {
            return Err(TableError::InvalidTransition {
                id: id.clone(),
                from,
                to,
            });
        }

        let mut entry = entries
            .remove(id)
            .ok_or_else(|| TableError::UnknownId(id.clone()))?;
        entry.request.state = to;
        if entries.is_empty() {
            self.idle.notify_waiters();
        }
        Ok(entry.request)
    }

    /// Idempotent removal
    pub fn remove(&self, id: &RequestId) -> Option<InFlightRequest> {
        let mut entries = self.lock();
        let removed = entries.remove(id).map(|e| e.request);
        if entries.is_empty() {
            self.idle.notify_waiters();
        }
        removed
    }

    pub fn state(&self, id: &RequestId) -> Option<RequestState> {
        self.lock().get(id).map(|e| e.request.state)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<InFlightRequest> {
        self.lock().values().map(|e| e.request.clone()).collect()
    }

    /// Signal one request's task to stop
    pub fn abort(&self, id: &RequestId, reason: AbortReason) -> Result<bool, TableError> {
        let entries = self.lock();
        let entry = entries
            .get(id)
            .ok_or_else(|| TableError::UnknownId(id.clone()))?;
        Ok(entry.handle.abort(reason))
    }

    /// Signal every request whose state matches; returns how many were newly aborted
    pub fn abort_where<F>(&self, filter: F, reason: AbortReason) -> usize
    where
        F: Fn(RequestState) -> bool,
    {
        self.lock()
            .values()
            .filter(|e| filter(e.request.state))
            .filter(|e| e.handle.abort(reason))
            .count()
    }

    /// Wait until the table is empty; `false` if `timeout` elapsed first
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.idle.notified();
                if self.is_empty() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}
