use tracing::debug;

use crate::bus::SharedBus;
use crate::error::{BusError, RequestFailure};
use crate::protocol::{OutboundMessage, RequestId, Subdomain};

/// Publisher side of one request's ephemeral response channel.
///
/// Chunks carry a contiguous `seq` from 0. Exactly one terminal message
/// (`end` or `error`) can go out; after it every publish is refused locally.
pub struct ResponseChannel {
    bus: SharedBus,
    name: String,
    next_seq: u64,
    max_chunk: usize,
    status: Option<u16>,
    /// A terminal message was published
    finished: bool,
    /// A terminal publish started and has not reported failure. Stays set if
    /// the publishing future is dropped, since it may have gone out.
    terminal_in_flight: bool,
    released: bool,
}

impl ResponseChannel {
    pub fn new(bus: SharedBus, subdomain: &Subdomain, id: &RequestId, max_chunk: usize) -> Self {
        Self {
            bus,
            name: subdomain.response_channel(id),
            next_seq: 0,
            max_chunk: max_chunk.max(1),
            status: None,
            finished: false,
            terminal_in_flight: false,
            released: false,
        }
    }

    /// Number of chunks published so far
    pub fn seq_count(&self) -> u64 {
        self.next_seq
    }

    /// Status carried by the published `meta`, if any
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Whether a terminal message went out, or may have
    pub fn is_finished(&self) -> bool {
        self.finished || self.terminal_in_flight
    }

    async fn send(&mut self, msg: OutboundMessage) -> Result<(), BusError> {
        if self.is_finished() || self.released {
            return Err(BusError::ChannelReleased(self.name.clone()));
        }
        let json = msg.to_json()?;
        if !msg.is_terminal() {
            return self.bus.publish(&self.name, json).await;
        }

        self.terminal_in_flight = true;
        let result = self.bus.publish(&self.name, json).await;
        self.terminal_in_flight = false;
        if result.is_ok() {
            self.finished = true;
        }
        result
    }

    pub async fn meta(
        &mut self,
        status: u16,
        headers: Vec<(String, String)>,
    ) -> Result<(), BusError> {
        self.send(OutboundMessage::meta(status, headers)).await?;
        self.status = Some(status);
        Ok(())
    }

    /// Publish body bytes, split into chunks of at most `max_chunk` bytes
    pub async fn body(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        for piece in bytes.chunks(self.max_chunk) {
            self.send(OutboundMessage::chunk(self.next_seq, piece)).await?;
            self.next_seq += 1;
        }
        Ok(())
    }

    pub async fn end(&mut self) -> Result<(), BusError> {
        self.send(OutboundMessage::end(self.next_seq)).await
    }

    pub async fn fail(&mut self, failure: &RequestFailure) -> Result<(), BusError> {
        self.send(OutboundMessage::error(failure)).await
    }

    /// Forget the channel on the bus. Safe to call more than once.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.finished = true;
        self.bus.release(&self.name).await;
        debug!("Released {}", self.name);
    }
}
