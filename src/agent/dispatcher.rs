//! Turns inbound bus messages into local HTTP calls and streams the results.
//!
//! Each accepted request runs in its own task. The task races three things:
//! the work itself, the request deadline, and its abort signal. Whichever
//! loses is dropped, which closes the local connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::events::{AgentEvent, EventSink, RequestEvent, ResponseEvent};
use super::forward::LocalForwarder;
use super::limiter::{Admission, ConcurrencyLimiter};
use super::response::ResponseChannel;
use super::session::TunnelSession;
use super::table::{
    abort_pair, AbortReason, AbortSignal, CorrelationTable, InFlightRequest, RequestState,
};
use crate::bus::SharedBus;
use crate::config::AgentConfig;
use crate::error::{BusError, RequestFailure};
use crate::protocol::{Inbound, InboundMessage, RequestId, RequestSpec};

/// Tries at publishing the final `error` once the bus has failed
const TERMINAL_ATTEMPTS: u32 = 4;
const TERMINAL_RETRY_DELAY: Duration = Duration::from_millis(250);

/// How the work part of a request ended
enum Outcome {
    /// `end` published after the full body
    Completed,
    /// Local server unreachable; synthetic `meta{502}` + `end` published
    LocalUnavailable(RequestFailure),
    /// Needs an `error` terminal, unless one is already out
    Failed(RequestFailure),
    /// Publishing to the bus failed
    BusLost(BusError),
}

pub struct Dispatcher {
    session: Arc<TunnelSession>,
    bus: SharedBus,
    table: Arc<CorrelationTable>,
    limiter: ConcurrencyLimiter,
    forwarder: LocalForwarder,
    request_timeout: Duration,
    max_chunk: usize,
    accepting: AtomicBool,
    events: EventSink,
}

impl Dispatcher {
    pub fn new(
        session: Arc<TunnelSession>,
        bus: SharedBus,
        forwarder: LocalForwarder,
        config: &AgentConfig,
        events: EventSink,
    ) -> Self {
        Self {
            session,
            bus,
            table: Arc::new(CorrelationTable::new()),
            limiter: ConcurrencyLimiter::new(config.max_concurrent_requests, config.queue_depth),
            forwarder,
            request_timeout: config.request_timeout,
            max_chunk: config.max_chunk_bytes,
            accepting: AtomicBool::new(true),
            events,
        }
    }

    /// Handle one raw payload from the request channel.
    ///
    /// Admission is decided before returning, so calling this in arrival order
    /// is what makes the concurrency limit deterministic.
    pub fn handle(self: &Arc<Self>, payload: &str) {
        match InboundMessage::parse(payload) {
            Ok(Inbound::Request(spec)) => self.accept(spec),
            Ok(Inbound::Cancel(id)) => self.cancel(&id),
            Err(e) => warn!("Dropping inbound message: {}", e),
        }
    }

    fn accept(self: &Arc<Self>, spec: RequestSpec) {
        let request = InFlightRequest::new(
            spec.id.clone(),
            spec.method.as_str(),
            &spec.path,
            self.request_timeout,
        );
        let (arrived_at, deadline) = (request.arrived_at, request.deadline);
        let (handle, signal) = abort_pair();

        // A duplicate means the bus redelivered; never execute twice
        if let Err(e) = self.table.insert(request, handle) {
            warn!("Dropping request: {}", e);
            return;
        }

        debug!(
            "{} {} {} -> {}",
            spec.id,
            spec.method,
            spec.path,
            self.forwarder.authority()
        );
        self.events.emit(AgentEvent::RequestReceived(RequestEvent {
            request_id: spec.id.clone(),
            method: spec.method.to_string(),
            path: spec.path.clone(),
        }));

        let admission = if self.accepting.load(Ordering::Acquire) {
            Some(self.limiter.try_admit())
        } else {
            None
        };

        let this = self.clone();
        tokio::spawn(async move {
            this.run_request(spec, arrived_at, deadline, admission, signal)
                .await;
        });
    }

    fn cancel(&self, id: &RequestId) {
        match self.table.abort(id, AbortReason::Cancelled) {
            Ok(true) => info!("{}: cancelled by edge", id),
            Ok(false) => debug!("{}: already aborting", id),
            Err(e) => debug!("Ignoring cancel: {}", e),
        }
    }

    async fn run_request(
        self: Arc<Self>,
        spec: RequestSpec,
        arrived_at: Instant,
        deadline: Instant,
        admission: Option<Admission>,
        mut signal: AbortSignal,
    ) {
        let id = spec.id.clone();
        let mut channel =
            ResponseChannel::new(self.bus.clone(), self.session.subdomain(), &id, self.max_chunk);

        let outcome = match admission {
            // Arrived after stop() began
            None => Outcome::Failed(RequestFailure::AgentShuttingDown),
            Some(Admission::Overloaded) => Outcome::Failed(RequestFailure::Overloaded),
            Some(admission) => {
                let work = self.execute(spec, admission, &mut channel);
                tokio::pin!(work);
                tokio::select! {
                    outcome = &mut work => outcome,
                    _ = tokio::time::sleep_until(deadline) => Outcome::Failed(RequestFailure::Timeout),
                    reason = signal.aborted() => Outcome::Failed(reason.into()),
                }
            }
        };

        let state = self
            .conclude(&id, outcome, &mut channel, arrived_at, deadline, &mut signal)
            .await;

        channel.release().await;
        if let Err(e) = self.table.finish(&id, state) {
            warn!("{}", e);
            self.table.remove(&id);
        }
    }

    /// Wait for a slot, call the local server, and relay the response
    async fn execute(
        &self,
        spec: RequestSpec,
        admission: Admission,
        channel: &mut ResponseChannel,
    ) -> Outcome {
        let _permit = match admission {
            Admission::Ready(permit) => permit,
            Admission::Queued(ticket) => match ticket.wait().await {
                Some(permit) => permit,
                None => return Outcome::Failed(RequestFailure::AgentShuttingDown),
            },
            Admission::Overloaded => return Outcome::Failed(RequestFailure::Overloaded),
        };

        let id = spec.id.clone();
        if let Err(e) = self.table.transition(&id, RequestState::Executing) {
            return Outcome::Failed(RequestFailure::Internal(e.to_string()));
        }

        let response = match self.forwarder.send(spec).await {
            Ok(response) => response,
            Err(failure) => {
                info!("{}: {}", id, failure);
                let headers = vec![("x-tunnel-error".to_string(), failure.code().to_string())];
                if let Err(e) = channel.meta(502, headers).await {
                    return Outcome::BusLost(e);
                }
                if let Err(e) = channel.end().await {
                    return Outcome::BusLost(e);
                }
                return Outcome::LocalUnavailable(failure);
            }
        };

        if let Err(e) = self.table.transition(&id, RequestState::StreamingResponse) {
            return Outcome::Failed(RequestFailure::Internal(e.to_string()));
        }
        if let Err(e) = channel.meta(response.status, response.headers).await {
            return Outcome::BusLost(e);
        }

        let mut body = response.body;
        loop {
            match body.chunk().await {
                Ok(Some(bytes)) => {
                    if let Err(e) = channel.body(&bytes).await {
                        return Outcome::BusLost(e);
                    }
                }
                Ok(None) => break,
                Err(e) => return Outcome::Failed(RequestFailure::UpstreamError(e.to_string())),
            }
        }

        match channel.end().await {
            Ok(()) => Outcome::Completed,
            Err(e) => Outcome::BusLost(e),
        }
    }

    /// Publish whatever terminal message is still owed and pick the final state
    async fn conclude(
        &self,
        id: &RequestId,
        outcome: Outcome,
        channel: &mut ResponseChannel,
        arrived_at: Instant,
        deadline: Instant,
        signal: &mut AbortSignal,
    ) -> RequestState {
        let (state, error) = match outcome {
            Outcome::Completed => (RequestState::Completed, None),
            Outcome::LocalUnavailable(failure) => (RequestState::Failed, Some(failure)),
            Outcome::Failed(failure) => {
                let delivered = channel.is_finished() || channel.fail(&failure).await.is_ok();
                if delivered {
                    (RequestState::Failed, Some(failure))
                } else {
                    warn!("{}: could not publish {}", id, failure.code());
                    let failure = self.recover_terminal(id, channel, deadline, signal).await;
                    (RequestState::Failed, Some(failure))
                }
            }
            Outcome::BusLost(err) => {
                warn!("{}: publish failed: {}", id, err);
                let failure = self.recover_terminal(id, channel, deadline, signal).await;
                (RequestState::Failed, Some(failure))
            }
        };

        let duration = arrived_at.elapsed();
        match &error {
            None => debug!(
                "{} -> {} ({} chunks, {:?})",
                id,
                channel.status().unwrap_or_default(),
                channel.seq_count(),
                duration
            ),
            Some(failure) => info!("{} -> {} after {:?}", id, failure.code(), duration),
        }

        self.events.emit(AgentEvent::RequestFinished(ResponseEvent {
            request_id: id.clone(),
            status: channel.status(),
            error: error.map(|f| f.code().to_string()),
            chunks: channel.seq_count(),
            duration,
        }));

        state
    }

    /// After a failed publish: wait out the deadline, then keep trying to get
    /// one terminal `error` to the edge for a short while
    async fn recover_terminal(
        &self,
        id: &RequestId,
        channel: &mut ResponseChannel,
        deadline: Instant,
        signal: &mut AbortSignal,
    ) -> RequestFailure {
        self.session.mark_degraded();

        let failure = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => RequestFailure::Timeout,
            reason = signal.aborted() => reason.into(),
        };

        for attempt in 1..=TERMINAL_ATTEMPTS {
            if channel.is_finished() {
                break;
            }
            match channel.fail(&failure).await {
                Ok(()) => break,
                Err(e) if attempt == TERMINAL_ATTEMPTS => {
                    warn!("{}: {} not delivered: {}", id, failure.code(), e);
                }
                Err(e) => {
                    debug!("{}: {} attempt {} failed: {}", id, failure.code(), attempt, e);
                    tokio::time::sleep(TERMINAL_RETRY_DELAY).await;
                }
            }
        }
        failure
    }

    /// Refuse new requests from now on
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Fail every request still waiting for a slot
    pub fn abort_queued(&self) -> usize {
        self.limiter.close();
        self.table
            .abort_where(|s| s == RequestState::Pending, AbortReason::ShuttingDown)
    }

    /// Force-fail everything still in flight
    pub fn abort_all(&self) -> usize {
        for request in self.table.snapshot() {
            warn!(
                "{}: aborting {} {} ({:?}, running {:?})",
                request.id,
                request.method,
                request.path,
                request.state,
                request.arrived_at.elapsed()
            );
        }
        self.table
            .abort_where(|s| !s.is_terminal(), AbortReason::ShuttingDown)
    }

    /// Wait for in-flight requests to finish; `false` if `grace` ran out
    pub async fn drain(&self, grace: Duration) -> bool {
        self.table.wait_idle(grace).await
    }

    pub fn in_flight(&self) -> usize {
        self.table.len()
    }
}
