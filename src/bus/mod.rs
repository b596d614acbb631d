//! Publish/subscribe bus abstraction.
//!
//! The agent only talks to the relay through [`MessageBus`]:
//! - [`MemoryBus`] - in-process bus, used by tests and embedders
//! - [`WsBus`] - WebSocket client for a remote relay

mod memory;
mod ws;

pub use memory::MemoryBus;
pub use ws::WsBus;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::BusError;
use crate::protocol::{Presence, SessionId, Subdomain};

/// Buffer size of each subscription's delivery channel
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// Contract the agent relies on from the bus.
///
/// Messages published on one channel by one publisher are delivered to current
/// subscribers in publish order. All methods are safe to call concurrently.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Present the opaque session credential
    async fn authenticate(&self, credential: &str) -> Result<(), BusError>;

    /// Become the exclusive handler for `subdomain`; fails with
    /// [`BusError::Conflict`] if another live session holds it
    async fn claim(&self, subdomain: &Subdomain, session: &SessionId) -> Result<(), BusError>;

    /// Give up a claim made by `session`; releasing a claim that is not held is a no-op
    async fn release_claim(&self, subdomain: &Subdomain, session: &SessionId)
        -> Result<(), BusError>;

    /// Record liveness in the registry
    async fn announce(&self, subdomain: &Subdomain, presence: &Presence) -> Result<(), BusError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError>;

    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError>;

    /// Forget an ephemeral channel; nothing is published to it afterwards
    async fn release(&self, channel: &str);
}

pub type SharedBus = Arc<dyn MessageBus>;

/// Messages delivered on one subscribed channel.
///
/// `recv` returns `None` once the bus connection is gone.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    pub fn new(channel: &str, rx: mpsc::Receiver<String>) -> Self {
        Self {
            channel: channel.to_string(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Refuse further deliveries. Messages already buffered can still be
    /// received, after which `recv` returns `None`.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
