//! Session manager: owns the agent's membership on the bus as the exclusive
//! handler for one subdomain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatcher::Dispatcher;
use super::events::{AgentEvent, EventSink};
use super::forward::LocalForwarder;
use crate::bus::{SharedBus, Subscription};
use crate::config::AgentConfig;
use crate::error::{BusError, SessionError};
use crate::protocol::{Presence, SessionId, SessionState, Subdomain};

/// Upper bound on waiting for aborted requests to publish their final message
const ABORT_FLUSH: Duration = Duration::from_secs(2);

/// One agent's session for one subdomain.
///
/// Passed explicitly to everything that needs it, so several sessions can
/// live in one process.
#[derive(Debug)]
pub struct TunnelSession {
    id: SessionId,
    subdomain: Subdomain,
    local_port: u16,
    state: watch::Sender<SessionState>,
    events: EventSink,
}

impl TunnelSession {
    pub fn new(subdomain: Subdomain, local_port: u16, events: EventSink) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            id: SessionId::generate(),
            subdomain,
            local_port,
            state,
            events,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn subdomain(&self) -> &Subdomain {
        &self.subdomain
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Apply a state change. `Closed` is terminal.
    fn set_state(&self, next: SessionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == SessionState::Closed || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });

        if changed {
            info!("Session {} for '{}' is now {}", self.id, self.subdomain, next);
            self.events.emit(AgentEvent::SessionStatus {
                subdomain: self.subdomain.clone(),
                state: next,
            });
        }
        changed
    }

    /// Connecting or Degraded -> Online
    pub fn mark_online(&self) -> bool {
        match self.state() {
            SessionState::Connecting | SessionState::Degraded => {
                self.set_state(SessionState::Online)
            }
            _ => false,
        }
    }

    /// Online -> Degraded
    pub fn mark_degraded(&self) -> bool {
        match self.state() {
            SessionState::Online => self.set_state(SessionState::Degraded),
            _ => false,
        }
    }

    pub fn close(&self) -> bool {
        self.set_state(SessionState::Closed)
    }

    /// Resolves once the session is Closed
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }
}

/// A running tunnel agent: a session, its dispatcher, and the background
/// ingress and heartbeat tasks.
pub struct Agent {
    session: Arc<TunnelSession>,
    dispatcher: Arc<Dispatcher>,
    bus: SharedBus,
    shutdown_grace: Duration,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopping: AtomicBool,
}

impl Agent {
    /// Authenticate, claim the subdomain, subscribe to its request channel and
    /// announce the session online.
    pub async fn start(
        bus: SharedBus,
        config: &AgentConfig,
        events: EventSink,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let forwarder = LocalForwarder::new(config.local_port, config.connect_timeout)
            .map_err(|e| SessionError::Config(format!("HTTP client: {}", e)))?;
        let session = Arc::new(TunnelSession::new(
            config.subdomain.clone(),
            config.local_port,
            events.clone(),
        ));
        info!(
            "Starting session {} for '{}' -> localhost:{}",
            session.id(),
            session.subdomain(),
            session.local_port()
        );

        bus.authenticate(&config.credential)
            .await
            .map_err(|e| match e {
                BusError::Unauthorized(msg) => SessionError::Auth(msg),
                other => SessionError::Bus(other),
            })?;

        bus.claim(session.subdomain(), session.id())
            .await
            .map_err(|e| match e {
                BusError::Conflict(_) => SessionError::BindConflict(session.subdomain().clone()),
                other => SessionError::Bus(other),
            })?;

        let request_channel = session.subdomain().request_channel();
        let subscription = match bus.subscribe(&request_channel).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let _ = bus.release_claim(session.subdomain(), session.id()).await;
                return Err(e.into());
            }
        };

        let presence = Presence::now(session.id(), SessionState::Online);
        if let Err(e) = bus.announce(session.subdomain(), &presence).await {
            let _ = bus.unsubscribe(&request_channel).await;
            let _ = bus.release_claim(session.subdomain(), session.id()).await;
            return Err(e.into());
        }
        session.mark_online();

        let dispatcher = Arc::new(Dispatcher::new(
            session.clone(),
            bus.clone(),
            forwarder,
            config,
            events.clone(),
        ));
        let shutdown = CancellationToken::new();

        let ingress = tokio::spawn(ingress_loop(
            subscription,
            dispatcher.clone(),
            session.clone(),
            shutdown.clone(),
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(
            bus.clone(),
            session.clone(),
            config.heartbeat_interval,
            config.max_missed_heartbeats,
            shutdown.clone(),
            events,
        ));

        Ok(Self {
            session,
            dispatcher,
            bus,
            shutdown_grace: config.shutdown_grace,
            shutdown,
            tasks: Mutex::new(vec![ingress, heartbeat]),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> &Arc<TunnelSession> {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Requests currently tracked in the correlation table
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Resolves when the session is Closed, by `stop()` or by bus disconnect
    pub async fn closed(&self) {
        self.session.closed().await
    }

    /// Graceful shutdown.
    ///
    /// New requests are refused, queued ones fail with `agent_shutting_down`,
    /// running ones get `shutdown_grace` to finish before being aborted.
    /// Calling it again (or concurrently) waits for the same Closed state.
    pub async fn stop(&self) -> Result<(), SessionError> {
        if self.stopping.swap(true, Ordering::AcqRel) {
            self.session.closed().await;
            return Ok(());
        }

        info!("Stopping session {}...", self.session.id());
        self.dispatcher.stop_accepting();
        self.shutdown.cancel();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }

        let request_channel = self.session.subdomain().request_channel();
        if let Err(e) = self.bus.unsubscribe(&request_channel).await {
            debug!("Unsubscribe from {} failed: {}", request_channel, e);
        }

        let queued = self.dispatcher.abort_queued();
        if queued > 0 {
            info!("Failing {} queued requests", queued);
        }

        if !self.dispatcher.drain(self.shutdown_grace).await {
            let aborted = self.dispatcher.abort_all();
            warn!(
                "{} requests still running after {:?}, aborting",
                aborted, self.shutdown_grace
            );
            if !self.dispatcher.drain(ABORT_FLUSH).await {
                warn!(
                    "{} requests did not finish flushing",
                    self.dispatcher.in_flight()
                );
            }
        }

        let subdomain = self.session.subdomain();
        let presence = Presence::now(self.session.id(), SessionState::Closed);
        if let Err(e) = self.bus.announce(subdomain, &presence).await {
            debug!("Final presence not delivered: {}", e);
        }
        if let Err(e) = self.bus.release_claim(subdomain, self.session.id()).await {
            debug!("Claim release failed: {}", e);
        }

        self.session.close();
        info!("Session {} closed", self.session.id());
        Ok(())
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Feed request-channel messages to the dispatcher, in arrival order
async fn ingress_loop(
    mut subscription: Subscription,
    dispatcher: Arc<Dispatcher>,
    session: Arc<TunnelSession>,
    shutdown: CancellationToken,
) {
    debug!("Listening on {}", subscription.channel());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                // Requests already delivered still get an answer
                subscription.close();
                let mut drained = 0;
                while let Some(payload) = subscription.recv().await {
                    dispatcher.handle(&payload);
                    drained += 1;
                }
                if drained > 0 {
                    debug!("Handled {} buffered messages after stop", drained);
                }
                break;
            }
            msg = subscription.recv() => match msg {
                Some(payload) => dispatcher.handle(&payload),
                None => {
                    error!("Bus connection lost on {}", subscription.channel());
                    shutdown.cancel();
                    session.close();
                    break;
                }
            },
        }
    }
}

async fn heartbeat_loop(
    bus: SharedBus,
    session: Arc<TunnelSession>,
    interval: Duration,
    max_missed: u32,
    shutdown: CancellationToken,
    events: EventSink,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; start() already announced
    ticker.tick().await;

    let mut missed: u32 = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let state = session.state();
        if state == SessionState::Closed {
            break;
        }

        let presence = Presence::now(session.id(), state);
        match bus.announce(session.subdomain(), &presence).await {
            Ok(()) => {
                if missed > 0 {
                    info!("Heartbeat recovered after {} misses", missed);
                }
                missed = 0;
                session.mark_online();
            }
            Err(e) => {
                missed += 1;
                warn!("Heartbeat failed ({} in a row): {}", missed, e);
                events.emit(AgentEvent::HeartbeatFailed {
                    consecutive: missed,
                    reason: e.to_string(),
                });
                if missed >= max_missed {
                    session.mark_degraded();
                }
            }
        }
    }
    debug!("Heartbeat stopped");
}
