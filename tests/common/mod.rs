//! Shared fixtures: a scriptable local HTTP server and helpers for driving an
//! agent over the in-memory bus.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use relay_agent::agent::{Agent, EventSink};
use relay_agent::bus::{MemoryBus, MessageBus};
use relay_agent::config::AgentConfig;
use relay_agent::protocol::{InboundMessage, OutboundMessage};

pub const SUBDOMAIN: &str = "app";

/// How the local server answers one request
#[derive(Clone, Debug)]
pub enum Reply {
    /// `status` with `body` after `delay`
    After {
        delay: Duration,
        status: u16,
        body: Vec<u8>,
    },
    /// Echo the request body back with status 200
    Echo,
    /// Chunked response, each part written after its delay. An empty part
    /// only delays the terminating chunk.
    Chunked(Vec<(Duration, Vec<u8>)>),
    /// Read the request and never answer
    Hang,
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Reply::After {
            delay: Duration::ZERO,
            status: 200,
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn slow(delay: Duration, body: &str) -> Self {
        Reply::After {
            delay,
            status: 200,
            body: body.as_bytes().to_vec(),
        }
    }
}

/// Counters kept by [`LocalServer`]
#[derive(Default, Debug)]
pub struct Stats {
    pub hits: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    /// Connections the client closed before the response was complete
    pub abandoned: AtomicUsize,
}

impl Stats {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }
}

pub struct LocalServer {
    pub port: u16,
    pub stats: Arc<Stats>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for LocalServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl LocalServer {
    /// Serve every request with `route(path)`
    pub async fn start<F>(route: F) -> Self
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stats = Arc::new(Stats::default());
        let route = Arc::new(route);

        let task = {
            let stats = stats.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let stats = stats.clone();
                    let route = route.clone();
                    tokio::spawn(async move {
                        serve(stream, stats, move |path| route(path)).await;
                    });
                }
            })
        };

        Self { port, stats, task }
    }

    pub async fn fixed(reply: Reply) -> Self {
        Self::start(move |_| reply.clone()).await
    }
}

/// A port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn serve<F>(mut stream: TcpStream, stats: Arc<Stats>, route: F)
where
    F: Fn(&str) -> Reply,
{
    let mut buf = vec![0u8; 8192];
    let mut data = Vec::new();
    let head_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => data.extend_from_slice(&buf[..n]),
        }
    };

    let head = String::from_utf8_lossy(&data[..head_end]).to_string();
    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = data[head_end..].to_vec();
    while body.len() < content_length {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => body.extend_from_slice(&buf[..n]),
        }
    }

    stats.hits.fetch_add(1, Ordering::SeqCst);
    let now = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
    stats.max_active.fetch_max(now, Ordering::SeqCst);

    let completed = respond(&mut stream, route(&path), body).await;
    if !completed {
        stats.abandoned.fetch_add(1, Ordering::SeqCst);
    }
    stats.active.fetch_sub(1, Ordering::SeqCst);
}

/// Sleep unless the client hangs up first; `false` if it did
async fn wait_or_hangup(stream: &mut TcpStream, delay: Duration) -> bool {
    let mut scratch = [0u8; 1];
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = stream.read(&mut scratch) => false,
    }
}

async fn respond(stream: &mut TcpStream, reply: Reply, request_body: Vec<u8>) -> bool {
    match reply {
        Reply::After {
            delay,
            status,
            body,
        } => {
            if !wait_or_hangup(stream, delay).await {
                return false;
            }
            let head = format!(
                "HTTP/1.1 {} OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            stream.write_all(head.as_bytes()).await.is_ok() && stream.write_all(&body).await.is_ok()
        }
        Reply::Echo => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                request_body.len()
            );
            stream.write_all(head.as_bytes()).await.is_ok()
                && stream.write_all(&request_body).await.is_ok()
        }
        Reply::Chunked(parts) => {
            let head = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";
            if stream.write_all(head.as_bytes()).await.is_err() {
                return false;
            }
            for (delay, part) in parts {
                if !wait_or_hangup(stream, delay).await {
                    return false;
                }
                if part.is_empty() {
                    continue;
                }
                let mut frame = format!("{:x}\r\n", part.len()).into_bytes();
                frame.extend_from_slice(&part);
                frame.extend_from_slice(b"\r\n");
                if stream.write_all(&frame).await.is_err() {
                    return false;
                }
            }
            stream.write_all(b"0\r\n\r\n").await.is_ok()
        }
        Reply::Hang => {
            let mut scratch = [0u8; 64];
            loop {
                match stream.read(&mut scratch).await {
                    Ok(0) | Err(_) => return false,
                    Ok(_) => {}
                }
            }
        }
    }
}

/// Agent settings for tests: generous timeout, quick shutdown
pub fn config(port: u16) -> AgentConfig {
    let mut config = AgentConfig::new("secret", SUBDOMAIN, port);
    config.request_timeout = Duration::from_secs(10);
    config.shutdown_grace = Duration::from_secs(2);
    config
}

pub async fn start_agent(bus: &Arc<MemoryBus>, config: AgentConfig) -> Agent {
    Agent::start(bus.clone(), &config, EventSink::default())
        .await
        .unwrap()
}

pub fn response_channel(id: &str) -> String {
    format!("tunnel:{}:res:{}", SUBDOMAIN, id)
}

pub async fn send(bus: &MemoryBus, msg: InboundMessage) {
    let channel = format!("tunnel:{}:req", SUBDOMAIN);
    bus.publish(&channel, msg.to_json().unwrap()).await.unwrap();
}

pub async fn get(bus: &MemoryBus, id: &str, path: &str) {
    send(bus, InboundMessage::request(id, "GET", path, vec![], None)).await;
}

/// Wait until the response channel carries a terminal message
pub async fn finished(bus: &MemoryBus, id: &str, within: Duration) -> Vec<OutboundMessage> {
    let channel = response_channel(id);
    tokio::time::timeout(within, async {
        loop {
            let sent = bus.responses(&channel);
            if sent.iter().any(OutboundMessage::is_terminal) {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} did not finish within {:?}", id, within))
}

/// Poll `cond` until it holds
pub async fn eventually<F: Fn() -> bool>(within: Duration, cond: F) {
    tokio::time::timeout(within, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Concatenated chunk payloads
pub fn body_of(sent: &[OutboundMessage]) -> Vec<u8> {
    sent.iter().filter_map(OutboundMessage::chunk_bytes).collect::<Vec<_>>().concat()
}

pub fn error_code(sent: &[OutboundMessage]) -> Option<&str> {
    sent.iter().find_map(|m| match m {
        OutboundMessage::Error { code, .. } => Some(code.as_str()),
        _ => None,
    })
}
