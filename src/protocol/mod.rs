//! Protocol message types for relay communication.
//!
//! Defines the JSON message format carried on the bus:
//! - [`InboundMessage`] - `request` / `cancel`, published by the edge router
//! - [`OutboundMessage`] - `meta` / `chunk` / `end` / `error`, published by the agent
//!
//! Also provides type-safe ID wrappers for compile-time safety.

mod ids;
mod messages;

pub use ids::*;
pub use messages::*;
