use thiserror::Error;

use crate::agent::RequestState;
use crate::protocol::{RequestId, Subdomain};

/// Errors establishing or running a tunnel session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("bus rejected credentials: {0}")]
    Auth(String),

    #[error("subdomain '{0}' is already bound to another live agent")]
    BindConflict(Subdomain),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SessionError {
    /// Whether establishing the session again may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SessionError::Auth(_) | SessionError::Config(_))
    }
}

/// Errors reported by a message bus implementation
#[derive(Error, Debug)]
pub enum BusError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("subdomain '{0}' is claimed by another session")]
    Conflict(String),

    #[error("bus connection lost")]
    Disconnected,

    #[error("publish to released channel {0}")]
    ChannelReleased(String),

    #[error("bus rejected operation: {code} - {message}")]
    Rejected { code: String, message: String },

    #[error("bus operation timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Correlation table misuse
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("duplicate request id {0}")]
    DuplicateId(RequestId),

    #[error("unknown request id {0}")]
    UnknownId(RequestId),

    #[error("request {id}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        id: RequestId,
        from: RequestState,
        to: RequestState,
    },
}

/// Why a single relayed request did not complete normally
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestFailure {
    #[error("local connection failed: {0}")]
    LocalConnectionRefused(String),

    #[error("request deadline exceeded")]
    Timeout,

    #[error("agent at capacity")]
    Overloaded,

    #[error("agent shutting down")]
    AgentShuttingDown,

    #[error("cancelled by edge")]
    Cancelled,

    #[error("local response stream failed: {0}")]
    UpstreamError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RequestFailure {
    /// Error code carried by the `error` message on the response channel
    pub fn code(&self) -> &'static str {
        match self {
            RequestFailure::LocalConnectionRefused(_) => "local_connection_refused",
            RequestFailure::Timeout => "timeout",
            RequestFailure::Overloaded => "overloaded",
            RequestFailure::AgentShuttingDown => "agent_shutting_down",
            RequestFailure::Cancelled => "cancelled",
            RequestFailure::UpstreamError(_) => "upstream_error",
            RequestFailure::Internal(_) => "internal_error",
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            RequestFailure::LocalConnectionRefused(d)
            | RequestFailure::UpstreamError(d)
            | RequestFailure::Internal(d) => Some(d.clone()),
            _ => None,
        }
    }
}

/// Inbound bus message that failed validation
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("request id is empty")]
    EmptyId,

    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),

    #[error("invalid request path '{0}'")]
    InvalidPath(String),

    #[error("undecodable body: {0}")]
    InvalidBody(String),
}
