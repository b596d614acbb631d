use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{MessageBus, Subscription, SUBSCRIPTION_BUFFER};
use crate::error::BusError;
use crate::protocol::{OutboundMessage, Presence, SessionId, Subdomain};

/// In-process bus.
///
/// Keeps the full history of every channel so tests can inspect exactly what
/// was published, and records publishes to released channels as violations
/// instead of delivering them.
pub struct MemoryBus {
    inner: Mutex<Inner>,
}

struct Inner {
    /// Accepted credentials; `None` accepts anything
    credentials: Option<HashSet<String>>,
    claims: HashMap<Subdomain, SessionId>,
    presence: HashMap<Subdomain, Presence>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
    history: HashMap<String, Vec<String>>,
    released: HashSet<String>,
    violations: Vec<String>,
    connected: bool,
    fail_publishes: bool,
    fail_announces: bool,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Bus accepting any credential
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                credentials: None,
                claims: HashMap::new(),
                presence: HashMap::new(),
                subscribers: HashMap::new(),
                history: HashMap::new(),
                released: HashSet::new(),
                violations: Vec::new(),
                connected: true,
                fail_publishes: false,
                fail_announces: false,
            }),
        }
    }

    /// Bus accepting only the given credentials
    pub fn with_credentials<I, S>(credentials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bus = Self::new();
        bus.lock().credentials = Some(credentials.into_iter().map(Into::into).collect());
        bus
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the connection: every subscription ends and claims expire
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        inner.connected = false;
        inner.subscribers.clear();
        inner.claims.clear();
    }

    /// Accept operations again after [`MemoryBus::disconnect`]
    pub fn reconnect(&self) {
        self.lock().connected = true;
    }

    /// Make every publish fail with [`BusError::Transport`]
    pub fn set_fail_publishes(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }

    /// Make every presence announcement fail with [`BusError::Transport`]
    pub fn set_fail_announces(&self, fail: bool) {
        self.lock().fail_announces = fail;
    }

    /// Raw payloads published on `channel`, in publish order
    pub fn history(&self, channel: &str) -> Vec<String> {
        self.lock().history.get(channel).cloned().unwrap_or_default()
    }

    /// Agent responses published on `channel`, skipping anything unparseable
    pub fn responses(&self, channel: &str) -> Vec<OutboundMessage> {
        self.history(channel)
            .iter()
            .filter_map(|json| OutboundMessage::from_json(json).ok())
            .collect()
    }

    pub fn presence(&self, subdomain: &Subdomain) -> Option<Presence> {
        self.lock().presence.get(subdomain).cloned()
    }

    pub fn claim_holder(&self, subdomain: &Subdomain) -> Option<SessionId> {
        self.lock().claims.get(subdomain).cloned()
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.lock()
            .subscribers
            .get(channel)
            .map(|subs| subs.iter().any(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    pub fn is_released(&self, channel: &str) -> bool {
        self.lock().released.contains(channel)
    }

    /// Channels that saw a publish after being released
    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    fn ensure_connected(inner: &Inner) -> Result<(), BusError> {
        if inner.connected {
            Ok(())
        } else {
            Err(BusError::Disconnected)
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn authenticate(&self, credential: &str) -> Result<(), BusError> {
        let inner = self.lock();
        Self::ensure_connected(&inner)?;
        match &inner.credentials {
            Some(accepted) if !accepted.contains(credential) => {
                Err(BusError::Unauthorized("credential rejected".to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn claim(&self, subdomain: &Subdomain, session: &SessionId) -> Result<(), BusError> {
        let mut inner = self.lock();
        Self::ensure_connected(&inner)?;
        let held_by_other =
            matches!(inner.claims.get(subdomain), Some(holder) if holder != session);
        if held_by_other {
            return Err(BusError::Conflict(subdomain.to_string()));
        }
        inner.claims.insert(subdomain.clone(), session.clone());
        Ok(())
    }

    async fn release_claim(
        &self,
        subdomain: &Subdomain,
        session: &SessionId,
    ) -> Result<(), BusError> {
        let mut inner = self.lock();
        Self::ensure_connected(&inner)?;
        if inner.claims.get(subdomain) == Some(session) {
            inner.claims.remove(subdomain);
        }
        Ok(())
    }

    async fn announce(&self, subdomain: &Subdomain, presence: &Presence) -> Result<(), BusError> {
        let mut inner = self.lock();
        Self::ensure_connected(&inner)?;
        if inner.fail_announces {
            return Err(BusError::Transport("announce failed".to_string()));
        }
        inner.presence.insert(subdomain.clone(), presence.clone());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let mut inner = self.lock();
        Self::ensure_connected(&inner)?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        inner
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        debug!("memory bus: subscribed to {}", channel);
        Ok(Subscription::new(channel, rx))
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        let mut inner = self.lock();
        inner.subscribers.remove(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        let targets = {
            let mut inner = self.lock();
            Self::ensure_connected(&inner)?;
            if inner.released.contains(channel) {
                warn!("memory bus: publish to released channel {}", channel);
                inner.violations.push(channel.to_string());
                return Err(BusError::ChannelReleased(channel.to_string()));
            }
            if inner.fail_publishes {
                return Err(BusError::Transport("publish failed".to_string()));
            }
            inner
                .history
                .entry(channel.to_string())
                .or_default()
                .push(payload.clone());
            inner.subscribers.get(channel).cloned().unwrap_or_default()
        };

        // Deliver outside the lock; a full subscriber applies backpressure
        for tx in targets {
            let _ = tx.send(payload.clone()).await;
        }
        Ok(())
    }

    async fn release(&self, channel: &str) {
        let mut inner = self.lock();
        inner.released.insert(channel.to_string());
    }
}
