use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
};
use tracing::{debug, info, warn};

use super::{MessageBus, Subscription, SUBSCRIPTION_BUFFER};
use crate::error::BusError;
use crate::protocol::{Presence, SessionId, Subdomain};

/// How long a control operation waits for the relay's acknowledgement
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames sent to the relay
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientFrame {
    Auth {
        #[serde(rename = "ref")]
        id: u64,
        token: String,
    },
    Claim {
        #[serde(rename = "ref")]
        id: u64,
        subdomain: String,
        session: String,
    },
    Release {
        #[serde(rename = "ref")]
        id: u64,
        subdomain: String,
        session: String,
    },
    Presence {
        #[serde(rename = "ref")]
        id: u64,
        subdomain: String,
        #[serde(flatten)]
        presence: Presence,
    },
    Subscribe {
        #[serde(rename = "ref")]
        id: u64,
        channel: String,
    },
    Unsubscribe {
        #[serde(rename = "ref")]
        id: u64,
        channel: String,
    },
    Publish {
        #[serde(rename = "ref")]
        id: u64,
        channel: String,
        data: String,
    },
}

/// Frames received from the relay
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ServerFrame {
    Ack {
        #[serde(rename = "ref")]
        id: u64,
    },
    Nack {
        #[serde(rename = "ref")]
        id: u64,
        code: String,
        #[serde(default)]
        message: String,
    },
    Message {
        channel: String,
        data: String,
    },
}

type AckSender = oneshot::Sender<Result<(), BusError>>;

/// How many released channel names are remembered per connection
const RELEASED_MEMORY: usize = 4096;

#[derive(Default)]
struct Shared {
    pending: HashMap<u64, AckSender>,
    subscribers: HashMap<String, mpsc::Sender<String>>,
    released: HashSet<String>,
    /// Release order, oldest first, for evicting from `released`
    released_order: VecDeque<String>,
    closed: bool,
}

impl Shared {
    fn mark_released(&mut self, channel: &str) {
        if !self.released.insert(channel.to_string()) {
            return;
        }
        self.released_order.push_back(channel.to_string());
        if self.released_order.len() > RELEASED_MEMORY {
            if let Some(oldest) = self.released_order.pop_front() {
                self.released.remove(&oldest);
            }
        }
    }
}

/// Bus client speaking JSON frames to a relay over one WebSocket.
///
/// A writer task exclusively owns the sink; a reader task routes acks to
/// waiting operations and channel messages to subscriptions. When the socket
/// closes every subscription ends and pending operations fail with
/// [`BusError::Disconnected`].
pub struct WsBus {
    outgoing: mpsc::Sender<Message>,
    shared: Arc<Mutex<Shared>>,
    next_ref: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WsBus {
    /// Connect to a relay at `url` (`ws://` or `wss://`)
    pub async fn connect(url: &str) -> Result<Arc<Self>, BusError> {
        info!("Connecting to bus at {}...", url);

        let mut request = url
            .into_client_request()
            .map_err(|e| BusError::Transport(e.to_string()))?;
        request.headers_mut().insert(
            http::header::USER_AGENT,
            http::HeaderValue::from_static(concat!("relay-agent/", env!("CARGO_PKG_VERSION"))),
        );

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        debug!("Bus handshake status: {}", response.status());

        let (write, read) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(256);
        let shared = Arc::new(Mutex::new(Shared::default()));

        // This task exclusively owns the write half - no locks needed
        let writer = tokio::spawn(async move {
            let mut write = write;
            while let Some(msg) = outgoing_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    debug!("Bus send error: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader_shared = shared.clone();
        let pong_tx = outgoing.clone();
        let reader = tokio::spawn(async move {
            let mut read = read;
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => route_frame(&reader_shared, &text).await,
                    Ok(Message::Ping(data)) => {
                        let _ = pong_tx.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(frame)) => {
                        info!(
                            "Bus closed connection: {:?}",
                            frame.map(|f| f.reason.to_string())
                        );
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Bus read error: {}", e);
                        break;
                    }
                }
            }

            // Ends every subscription and fails every waiting operation
            let mut shared = lock(&reader_shared);
            shared.closed = true;
            shared.subscribers.clear();
            shared.pending.clear();
        });

        info!("Connected to bus");
        Ok(Arc::new(Self {
            outgoing,
            shared,
            next_ref: AtomicU64::new(1),
            tasks: vec![writer, reader],
        }))
    }

    fn next_id(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a frame and wait for the relay to acknowledge it
    async fn request(&self, id: u64, frame: ClientFrame) -> Result<(), BusError> {
        let json = serde_json::to_string(&frame)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut shared = lock(&self.shared);
            if shared.closed {
                return Err(BusError::Disconnected);
            }
            shared.pending.insert(id, tx);
        }

        if self.outgoing.send(Message::Text(json)).await.is_err() {
            lock(&self.shared).pending.remove(&id);
            return Err(BusError::Disconnected);
        }

        match tokio::time::timeout(ACK_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::Disconnected),
            Err(_) => {
                lock(&self.shared).pending.remove(&id);
                Err(BusError::Timeout)
            }
        }
    }
}

impl Drop for WsBus {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn route_frame(shared: &Mutex<Shared>, text: &str) {
    let frame = match serde_json::from_str::<ServerFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Ignoring unparseable bus frame: {}", e);
            return;
        }
    };

    match frame {
        ServerFrame::Ack { id } => {
            if let Some(tx) = lock(shared).pending.remove(&id) {
                let _ = tx.send(Ok(()));
            }
        }
        ServerFrame::Nack { id, code, message } => {
            let err = match code.as_str() {
                "unauthorized" => BusError::Unauthorized(message),
                "conflict" => BusError::Conflict(message),
                _ => BusError::Rejected { code, message },
            };
            if let Some(tx) = lock(shared).pending.remove(&id) {
                let _ = tx.send(Err(err));
            }
        }
        ServerFrame::Message { channel, data } => {
            let target = lock(shared).subscribers.get(&channel).cloned();
            match target {
                Some(tx) => {
                    let _ = tx.send(data).await;
                }
                None => debug!("Message for unsubscribed channel {}", channel),
            }
        }
    }
}

#[async_trait]
impl MessageBus for WsBus {
    async fn authenticate(&self, credential: &str) -> Result<(), BusError> {
        let id = self.next_id();
        self.request(
            id,
            ClientFrame::Auth {
                id,
                token: credential.to_string(),
            },
        )
        .await
    }

    async fn claim(&self, subdomain: &Subdomain, session: &SessionId) -> Result<(), BusError> {
        let id = self.next_id();
        self.request(
            id,
            ClientFrame::Claim {
                id,
                subdomain: subdomain.to_string(),
                session: session.to_string(),
            },
        )
        .await
    }

    async fn release_claim(
        &self,
        subdomain: &Subdomain,
        session: &SessionId,
    ) -> Result<(), BusError> {
        let id = self.next_id();
        self.request(
            id,
            ClientFrame::Release {
                id,
                subdomain: subdomain.to_string(),
                session: session.to_string(),
            },
        )
        .await
    }

    async fn announce(&self, subdomain: &Subdomain, presence: &Presence) -> Result<(), BusError> {
        let id = self.next_id();
        self.request(
            id,
            ClientFrame::Presence {
                id,
                subdomain: subdomain.to_string(),
                presence: presence.clone(),
            },
        )
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        {
            let mut shared = lock(&self.shared);
            if shared.closed {
                return Err(BusError::Disconnected);
            }
            shared.subscribers.insert(channel.to_string(), tx);
        }

        let id = self.next_id();
        let result = self
            .request(
                id,
                ClientFrame::Subscribe {
                    id,
                    channel: channel.to_string(),
                },
            )
            .await;

        match result {
            Ok(()) => Ok(Subscription::new(channel, rx)),
            Err(e) => {
                lock(&self.shared).subscribers.remove(channel);
                Err(e)
            }
        }
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        lock(&self.shared).subscribers.remove(channel);
        let id = self.next_id();
        self.request(
            id,
            ClientFrame::Unsubscribe {
                id,
                channel: channel.to_string(),
            },
        )
        .await
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        if lock(&self.shared).released.contains(channel) {
            warn!("Refusing publish to released channel {}", channel);
            return Err(BusError::ChannelReleased(channel.to_string()));
        }
        let id = self.next_id();
        self.request(
            id,
            ClientFrame::Publish {
                id,
                channel: channel.to_string(),
                data: payload,
            },
        )
        .await
    }

    async fn release(&self, channel: &str) {
        // Publish channels are implicit on the relay; only the local guard changes
        lock(&self.shared).mark_released(channel);
        debug!("Released response channel {}", channel);
    }
}
