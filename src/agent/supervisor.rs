//! Keeps one session alive: establishes it with retry, and re-establishes it
//! after the bus connection is lost.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::backoff::ExponentialBackoff;
use super::events::{AgentEvent, EventSink};
use super::session::Agent;
use crate::bus::SharedBus;
use crate::config::AgentConfig;
use crate::error::{BusError, SessionError};

/// Run a session until `shutdown` fires.
///
/// `connect` opens a fresh bus connection for every attempt. Auth and
/// config errors end supervision at once; anything else is retried up to
/// `start_max_attempts` times in a row.
pub async fn supervise<F, Fut>(
    mut connect: F,
    config: &AgentConfig,
    events: EventSink,
    shutdown: CancellationToken,
) -> Result<(), SessionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<SharedBus, BusError>>,
{
    let mut backoff = ExponentialBackoff::from_config(config);
    let mut failures: u32 = 0;

    loop {
        let attempt = async {
            let bus = connect().await?;
            Agent::start(bus, config, events.clone()).await
        };

        let result = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = attempt => result,
        };

        match result {
            Ok(agent) => {
                failures = 0;
                backoff.reset();

                let stopping = tokio::select! {
                    _ = shutdown.cancelled() => true,
                    _ = agent.closed() => false,
                };
                if stopping {
                    return agent.stop().await;
                }
                warn!("Session for '{}' lost its bus connection, reconnecting", config.subdomain);
            }
            Err(e) if !e.is_retryable() => {
                error!("Cannot start session: {}", e);
                events.emit(AgentEvent::Fatal {
                    reason: e.to_string(),
                });
                return Err(e);
            }
            Err(e) => {
                failures += 1;
                if failures >= config.start_max_attempts {
                    error!("Giving up after {} attempts: {}", failures, e);
                    events.emit(AgentEvent::Fatal {
                        reason: e.to_string(),
                    });
                    return Err(e);
                }

                let delay = backoff.next_delay();
                warn!(
                    "Session start failed ({}/{}): {}. Retrying in {:?}",
                    failures, config.start_max_attempts, e, delay
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
                info!("Retrying session for '{}'", config.subdomain);
            }
        }
    }
}
