//! The tunnel agent: session lifecycle, request dispatch and everything a
//! single relayed request goes through.
//!
//! - `session` - claim, heartbeat and graceful stop for one subdomain
//! - `dispatcher` - inbound messages to local HTTP calls and back
//! - `limiter` - concurrency cap with a bounded wait queue
//! - `table` - per-request state and abort handles
//! - `supervisor` - reconnection with backoff

mod backoff;
mod dispatcher;
mod events;
mod forward;
mod limiter;
mod response;
mod session;
pub mod supervisor;
mod table;

pub use backoff::ExponentialBackoff;
pub use dispatcher::Dispatcher;
pub use events::{create_event_channel, AgentEvent, EventSink, RequestEvent, ResponseEvent};
pub use forward::{LocalForwarder, LocalResponse};
pub use limiter::{Admission, ConcurrencyLimiter, QueueTicket};
pub use response::ResponseChannel;
pub use session::{Agent, TunnelSession};
pub use supervisor::supervise;
pub use table::{
    abort_pair, AbortReason, AbortSignal, CorrelationTable, InFlightRequest, RequestHandle,
    RequestState,
};
