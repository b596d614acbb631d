//! End-to-end request relaying over the in-memory bus

mod common;

use common::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::assert_ok;

use relay_agent::bus::{MemoryBus, MessageBus};
use relay_agent::protocol::{InboundMessage, OutboundMessage, SessionState};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn simple_get_is_relayed() {
    let server = LocalServer::fixed(Reply::ok("ok")).await;
    let bus = Arc::new(MemoryBus::new());
    let agent = start_agent(&bus, config(server.port)).await;

    get(&bus, "r1", "/health").await;
    let sent = finished(&bus, "r1", WAIT).await;

    assert_eq!(sent.len(), 3);
    match &sent[0] {
        OutboundMessage::Meta { status, headers } => {
            assert_eq!(*status, 200);
            assert_eq!(headers.get("content-type"), Some("text/plain"));
        }
        other => panic!("expected meta, got {:?}", other),
    }
    assert_eq!(sent[1], OutboundMessage::chunk(0, b"ok"));
    assert_eq!(sent[2], OutboundMessage::end(1));

    assert_ok!(agent.stop().await);
    assert!(bus.violations().is_empty());
}

#[tokio::test]
async fn post_body_reaches_local_server() {
    let server = LocalServer::fixed(Reply::Echo).await;
    let bus = Arc::new(MemoryBus::new());
    let agent = start_agent(&bus, config(server.port)).await;

    send(
        &bus,
        InboundMessage::request(
            "r2",
            "POST",
            "/echo",
            vec![("content-type".into(), "application/json".into())],
            Some(b"{\"a\":1}".to_vec()),
        ),
    )
    .await;
    let sent = finished(&bus, "r2", WAIT).await;

    assert!(matches!(sent[0], OutboundMessage::Meta { status: 200, .. }));
    assert_eq!(body_of(&sent), b"{\"a\":1}".to_vec());

    // Binary bodies travel base64-encoded
    let binary = vec![0u8, 159, 146, 150, 255];
    send(
        &bus,
        InboundMessage::request("r3", "PUT", "/bin", vec![], Some(binary.clone())),
    )
    .await;
    let sent = finished(&bus, "r3", WAIT).await;
    assert_eq!(body_of(&sent), binary);

    agent.stop().await.unwrap();
}

#[tokio::test]
async fn overload_rejects_beyond_queue() {
    let server = LocalServer::fixed(Reply::slow(Duration::from_millis(500), "done")).await;
    let bus = Arc::new(MemoryBus::new());
    let mut cfg = config(server.port);
    cfg.max_concurrent_requests = 10;
    cfg.queue_depth = 20;
    let agent = start_agent(&bus, cfg).await;

    for i in 0..50 {
        get(&bus, &format!("c{}", i), "/slow").await;
    }

    let mut ok = Vec::new();
    let mut overloaded = Vec::new();
    for i in 0..50 {
        let id = format!("c{}", i);
        let sent = finished(&bus, &id, WAIT).await;
        match error_code(&sent) {
            Some("overloaded") => {
                // Rejected without ever reaching the local server
                assert_eq!(sent.len(), 1);
                overloaded.push(i);
            }
            None => {
                assert!(matches!(sent[0], OutboundMessage::Meta { status: 200, .. }));
                assert_eq!(body_of(&sent), b"done".to_vec());
                ok.push(i);
            }
            Some(other) => panic!("{}: unexpected error {}", id, other),
        }
    }

    assert_eq!(ok, (0..30).collect::<Vec<_>>());
    assert_eq!(overloaded, (30..50).collect::<Vec<_>>());
    assert_eq!(server.stats.hits(), 30);
    assert!(server.stats.max_active() <= 10);

    agent.stop().await.unwrap();
    assert!(bus.violations().is_empty());
}

#[tokio::test]
async fn timeout_sends_one_error_and_closes_local_connection() {
    let server = LocalServer::fixed(Reply::Hang).await;
    let bus = Arc::new(MemoryBus::new());
    let mut cfg = config(server.port);
    cfg.request_timeout = Duration::from_millis(300);
    let agent = start_agent(&bus, cfg).await;

    let started = Instant::now();
    get(&bus, "d1", "/hang").await;
    let sent = finished(&bus, "d1", WAIT).await;
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(sent.len(), 1);
    assert_eq!(error_code(&sent), Some("timeout"));

    eventually(WAIT, || server.stats.abandoned() == 1).await;

    // Nothing more is published for that id
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bus.history(&response_channel("d1")).len(), 1);
    assert!(bus.is_released(&response_channel("d1")));
    assert_eq!(agent.in_flight(), 0);

    agent.stop().await.unwrap();
}

#[tokio::test]
async fn cancel_aborts_local_request() {
    let server = LocalServer::fixed(Reply::Hang).await;
    let bus = Arc::new(MemoryBus::new());
    let agent = start_agent(&bus, config(server.port)).await;

    get(&bus, "x1", "/hang").await;
    eventually(WAIT, || server.stats.hits() == 1).await;

    send(&bus, InboundMessage::cancel("x1")).await;
    let sent = finished(&bus, "x1", WAIT).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(error_code(&sent), Some("cancelled"));
    eventually(WAIT, || server.stats.abandoned() == 1).await;

    // Cancelling something unknown or finished is ignored
    send(&bus, InboundMessage::cancel("x1")).await;
    send(&bus, InboundMessage::cancel("nope")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bus.history(&response_channel("x1")).len(), 1);
    assert!(bus.history(&response_channel("nope")).is_empty());

    agent.stop().await.unwrap();
    assert!(bus.violations().is_empty());
}

#[tokio::test]
async fn duplicate_request_runs_once() {
    let server = LocalServer::fixed(Reply::slow(Duration::from_millis(200), "once")).await;
    let bus = Arc::new(MemoryBus::new());
    let agent = start_agent(&bus, config(server.port)).await;

    get(&bus, "dup", "/").await;
    get(&bus, "dup", "/").await;
    let sent = finished(&bus, "dup", WAIT).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.stats.hits(), 1);
    let terminals = bus
        .responses(&response_channel("dup"))
        .iter()
        .filter(|m| m.is_terminal())
        .count();
    assert_eq!(terminals, 1);
    assert_eq!(body_of(&sent), b"once".to_vec());

    agent.stop().await.unwrap();
}

#[tokio::test]
async fn large_body_split_into_contiguous_chunks() {
    let body = "0123456789".repeat(10);
    let server = LocalServer::fixed(Reply::ok(&body)).await;
    let bus = Arc::new(MemoryBus::new());
    let mut cfg = config(server.port);
    cfg.max_chunk_bytes = 16;
    let agent = start_agent(&bus, cfg).await;

    get(&bus, "big", "/big").await;
    let sent = finished(&bus, "big", WAIT).await;

    let seqs: Vec<u64> = sent
        .iter()
        .filter_map(|m| match m {
            OutboundMessage::Chunk { seq, .. } => Some(*seq),
            _ => None,
        })
        .collect();
    assert_eq!(seqs, (0..seqs.len() as u64).collect::<Vec<_>>());
    assert!(sent
        .iter()
        .filter_map(OutboundMessage::chunk_bytes)
        .all(|c| c.len() <= 16));
    assert_eq!(body_of(&sent), body.into_bytes());
    assert_eq!(sent.last(), Some(&OutboundMessage::end(seqs.len() as u64)));

    agent.stop().await.unwrap();
}

#[tokio::test]
async fn meta_published_before_body_completes() {
    let server = LocalServer::fixed(Reply::Chunked(vec![
        (Duration::ZERO, b"first ".to_vec()),
        (Duration::from_millis(600), b"second".to_vec()),
    ]))
    .await;
    let bus = Arc::new(MemoryBus::new());
    let agent = start_agent(&bus, config(server.port)).await;

    let started = Instant::now();
    get(&bus, "s1", "/stream").await;
    let channel = response_channel("s1");
    eventually(WAIT, || {
        bus.responses(&channel)
            .iter()
            .any(|m| matches!(m, OutboundMessage::Meta { .. }))
    })
    .await;
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!bus.responses(&channel).iter().any(|m| m.is_terminal()));

    let sent = finished(&bus, "s1", WAIT).await;
    assert_eq!(body_of(&sent), b"first second".to_vec());

    agent.stop().await.unwrap();
}

#[tokio::test]
async fn unreachable_local_server_becomes_502() {
    let bus = Arc::new(MemoryBus::new());
    let agent = start_agent(&bus, config(closed_port().await)).await;

    get(&bus, "u1", "/").await;
    let sent = finished(&bus, "u1", WAIT).await;

    assert_eq!(sent.len(), 2);
    match &sent[0] {
        OutboundMessage::Meta { status, headers } => {
            assert_eq!(*status, 502);
            assert_eq!(headers.get("x-tunnel-error"), Some("local_connection_refused"));
        }
        other => panic!("expected meta, got {:?}", other),
    }
    assert_eq!(sent[1], OutboundMessage::end(0));

    agent.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_messages_are_dropped() {
    let server = LocalServer::fixed(Reply::ok("fine")).await;
    let bus = Arc::new(MemoryBus::new());
    let agent = start_agent(&bus, config(server.port)).await;

    let req = format!("tunnel:{}:req", SUBDOMAIN);
    bus.publish(&req, "not json".into()).await.unwrap();
    bus.publish(&req, r#"{"type":"launch","id":"z"}"#.into())
        .await
        .unwrap();
    bus.publish(
        &req,
        r#"{"type":"request","id":"bad","method":"GET","path":"no-slash"}"#.into(),
    )
    .await
    .unwrap();

    get(&bus, "good", "/").await;
    let sent = finished(&bus, "good", WAIT).await;
    assert_eq!(body_of(&sent), b"fine".to_vec());
    assert!(bus.history(&response_channel("bad")).is_empty());
    assert_eq!(server.stats.hits(), 1);

    agent.stop().await.unwrap();
}

#[tokio::test]
async fn publish_failure_ends_in_timeout() {
    let server = LocalServer::fixed(Reply::slow(Duration::from_millis(150), "late")).await;
    let bus = Arc::new(MemoryBus::new());
    let mut cfg = config(server.port);
    cfg.request_timeout = Duration::from_millis(600);
    let agent = start_agent(&bus, cfg).await;

    get(&bus, "p1", "/").await;
    eventually(WAIT, || server.stats.hits() == 1).await;
    bus.set_fail_publishes(true);

    eventually(WAIT, || agent.state() == SessionState::Degraded).await;
    bus.set_fail_publishes(false);

    let sent = finished(&bus, "p1", WAIT).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(error_code(&sent), Some("timeout"));

    agent.stop().await.unwrap();
    assert!(bus.violations().is_empty());
}

#[tokio::test]
async fn queue_wait_counts_against_deadline() {
    let server = LocalServer::fixed(Reply::Hang).await;
    let bus = Arc::new(MemoryBus::new());
    let mut cfg = config(server.port);
    cfg.max_concurrent_requests = 1;
    cfg.queue_depth = 1;
    cfg.request_timeout = Duration::from_millis(400);
    let agent = start_agent(&bus, cfg).await;

    get(&bus, "w1", "/hang").await;
    eventually(WAIT, || server.stats.hits() == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Waits ~200ms for the slot, so only ~200ms of its budget is left to run
    let started = Instant::now();
    get(&bus, "w2", "/hang").await;
    let queued = finished(&bus, "w2", WAIT).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(400));
    assert!(elapsed < Duration::from_millis(600), "took {:?}", elapsed);
    assert_eq!(queued.len(), 1);
    assert_eq!(error_code(&queued), Some("timeout"));

    let running = finished(&bus, "w1", WAIT).await;
    assert_eq!(error_code(&running), Some("timeout"));
    assert!(server.stats.hits() <= 2);

    agent.stop().await.unwrap();
}

#[tokio::test]
async fn failed_end_publish_ends_in_timeout() {
    let server = LocalServer::fixed(Reply::Chunked(vec![
        (Duration::ZERO, b"a".to_vec()),
        (Duration::from_millis(300), Vec::new()),
    ]))
    .await;
    let bus = Arc::new(MemoryBus::new());
    let mut cfg = config(server.port);
    cfg.request_timeout = Duration::from_millis(800);
    let agent = start_agent(&bus, cfg).await;

    get(&bus, "f1", "/").await;
    let channel = response_channel("f1");
    eventually(WAIT, || {
        bus.responses(&channel)
            .iter()
            .any(|m| matches!(m, OutboundMessage::Chunk { .. }))
    })
    .await;

    // `end` goes out while publishing is broken
    bus.set_fail_publishes(true);
    eventually(WAIT, || agent.state() == SessionState::Degraded).await;
    bus.set_fail_publishes(false);

    let sent = finished(&bus, "f1", WAIT).await;
    assert_eq!(sent.len(), 3);
    assert!(matches!(sent[0], OutboundMessage::Meta { status: 200, .. }));
    assert_eq!(sent[1], OutboundMessage::chunk(0, b"a"));
    assert_eq!(error_code(&sent), Some("timeout"));

    eventually(WAIT, || agent.in_flight() == 0).await;
    agent.stop().await.unwrap();
    assert!(bus.violations().is_empty());
}

#[tokio::test]
async fn failed_error_publish_is_retried() {
    let server = LocalServer::fixed(Reply::Hang).await;
    let bus = Arc::new(MemoryBus::new());
    let mut cfg = config(server.port);
    cfg.request_timeout = Duration::from_millis(300);
    let agent = start_agent(&bus, cfg).await;

    get(&bus, "f2", "/hang").await;
    eventually(WAIT, || server.stats.hits() == 1).await;

    // The timeout error itself cannot be published at first
    bus.set_fail_publishes(true);
    eventually(WAIT, || agent.state() == SessionState::Degraded).await;
    bus.set_fail_publishes(false);

    let sent = finished(&bus, "f2", WAIT).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(error_code(&sent), Some("timeout"));

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(bus.history(&response_channel("f2")).len(), 1);
    agent.stop().await.unwrap();
}
