use std::time::Duration;
use tokio::sync::mpsc;

use crate::protocol::{RequestId, SessionState, Subdomain};

/// Events that flow from the agent to whoever supervises it
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Session changed state
    SessionStatus {
        subdomain: Subdomain,
        state: SessionState,
    },
    /// A heartbeat could not be announced
    HeartbeatFailed {
        consecutive: u32,
        reason: String,
    },
    /// Request accepted from the bus
    RequestReceived(RequestEvent),
    /// Request reached a terminal state
    RequestFinished(ResponseEvent),
    /// Session establishment gave up or the bus was lost for good
    Fatal { reason: String },
}

#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub request_id: RequestId,
    pub method: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub request_id: RequestId,
    /// Status relayed to the edge, if `meta` was published
    pub status: Option<u16>,
    /// Error code, if the request failed
    pub error: Option<String>,
    pub chunks: u64,
    pub duration: Duration,
}

/// Optional status callback. Events are dropped when nobody listens or the
/// listener lags behind, so a slow observer never stalls request handling.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<AgentEvent>>,
}

impl EventSink {
    pub fn new(tx: Option<mpsc::Sender<AgentEvent>>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }
}

/// Create the channel an [`EventSink`] feeds
pub fn create_event_channel() -> (mpsc::Sender<AgentEvent>, mpsc::Receiver<AgentEvent>) {
    mpsc::channel(1000)
}
