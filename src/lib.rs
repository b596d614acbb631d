//! Relay agent library.
//!
//! Exposes a local HTTP server through a publish/subscribe relay: requests
//! arrive on `tunnel:{subdomain}:req`, and each one is answered on its own
//! `tunnel:{subdomain}:res:{id}` channel as `meta`, `chunk`s and a terminal
//! `end` or `error`.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

pub mod agent;
pub mod bus;
pub mod config;
pub mod error;
pub mod protocol;

pub use agent::{Agent, AgentEvent, EventSink};
pub use bus::{MemoryBus, MessageBus, SharedBus, WsBus};
pub use config::{AgentConfig, Config};
pub use error::{BusError, RequestFailure, SessionError};
