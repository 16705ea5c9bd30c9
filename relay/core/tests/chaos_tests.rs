//! Chaos Tests for Proxy and Broadcast Resilience
//!
//! These tests verify system behavior under adverse conditions:
//! - Garbage and foreign-version frames thrown at the server
//! - Many concurrent callers sharing one server
//! - Publishers sending while subscribers come and go
//! - Shutdown racing in-flight calls
//!
//! # Running
//!
//! The soak test is ignored by default due to its long-running nature:
//! ```bash
//! cargo test chaos -- --ignored --nocapture
//! ```

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::task::JoinSet;

use common::{calculator_server, policy, SUBSCRIBE_SETTLE};
use relay_core::transport::frame;
use relay_core::{
    Address, BusSocket, InvocationRequest, ProxyClient, ProxyError, Publisher,
    RequestError, SocketPattern, Subscriber, WIRE_VERSION,
};

// =============================================================================
// Chaos Test Infrastructure
// =============================================================================

/// Configuration for chaos test scenarios
#[derive(Clone, Debug)]
pub struct ChaosConfig {
    /// Duration to run chaos scenario
    pub duration: Duration,
    /// Number of concurrent callers
    pub concurrency: usize,
    /// Calls each caller makes per round
    pub calls_per_caller: usize,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            concurrency: 16,
            calls_per_caller: 50,
        }
    }
}

impl ChaosConfig {
    /// Create a shorter config for faster tests
    pub fn quick() -> Self {
        Self {
            duration: Duration::from_secs(2),
            concurrency: 8,
            calls_per_caller: 10,
        }
    }
}

/// Send raw bytes on a fresh request socket and wait briefly for any answer
async fn send_raw(endpoint: &Address, bytes: Vec<u8>) -> Option<Vec<u8>> {
    let mut socket = BusSocket::connect(SocketPattern::Request, endpoint, Duration::from_secs(1))
        .await
        .ok()?;
    socket.send(bytes).await.ok()?;
    socket
        .poll(Some(Duration::from_millis(150)))
        .await
        .ok()
        .flatten()
}

// =============================================================================
// Server Under Garbage
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_server_survives_garbage_frames() {
    let mut server = calculator_server().await;
    let endpoint = server.endpoint().clone();

    let mut wrong_version = InvocationRequest::get("label");
    wrong_version.version = WIRE_VERSION + 7;

    let mut bad_checksum = frame::encode(&InvocationRequest::get("label")).unwrap();
    let last = bad_checksum.len() - 1;
    bad_checksum[last] ^= 0xFF;

    let garbage: Vec<Vec<u8>> = vec![
        Vec::new(),
        b"definitely not a frame".to_vec(),
        vec![0, 0, 0, 1],
        bad_checksum,
        frame::encode(&json!({"not": "a request"})).unwrap(),
        frame::encode(&wrong_version).unwrap(),
    ];

    for bytes in garbage {
        // Malformed requests are dropped without a reply
        assert!(send_raw(&endpoint, bytes).await.is_none());
    }

    let mut client = ProxyClient::connect(endpoint, policy(1000, 3)).await.unwrap();
    assert_eq!(client.get("label").await.unwrap(), json!("main"));
    assert!(server.stats().malformed() >= 5);

    server.close().await;
}

// =============================================================================
// Concurrent Callers
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_concurrent_callers_all_answered() {
    let config = ChaosConfig::quick();
    let mut server = calculator_server().await;
    let endpoint = server.endpoint().clone();
    let answered = Arc::new(AtomicUsize::new(0));

    let mut callers = JoinSet::new();
    for caller in 0..config.concurrency {
        let endpoint = endpoint.clone();
        let answered = Arc::clone(&answered);
        let calls = config.calls_per_caller;

        callers.spawn(async move {
            let mut client = ProxyClient::connect(endpoint, policy(2000, 3)).await.unwrap();
            for i in 0..calls {
                let value: f64 = client
                    .method("add")
                    .arg(caller as u64)
                    .arg(i as u64)
                    .send_as()
                    .await
                    .unwrap();
                assert_eq!(value, (caller + i) as f64);
                answered.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    let deadline = tokio::time::Instant::now() + config.duration * 5;
    while let Ok(Some(joined)) = tokio::time::timeout_at(deadline, callers.join_next()).await {
        joined.unwrap();
    }

    let expected = config.concurrency * config.calls_per_caller;
    assert_eq!(answered.load(Ordering::Relaxed), expected);
    assert_eq!(server.stats().requests(), expected as u64);

    server.close().await;
}

// =============================================================================
// Shutdown Races
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_close_while_calls_in_flight() {
    let mut server = calculator_server().await;
    let endpoint = server.endpoint().clone();

    let caller = tokio::spawn(async move {
        let mut client = ProxyClient::connect(endpoint, policy(100, 2)).await.unwrap();
        let mut ok = 0usize;
        let mut offline = 0usize;
        // Keep calling until the server disappears underneath us
        for i in 0..u64::MAX {
            match client.method("echo").arg(i).send().await {
                Ok(value) => {
                    assert_eq!(value, json!(i));
                    ok += 1;
                }
                Err(ProxyError::Request(RequestError::Offline { .. })) => {
                    offline += 1;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        (ok, offline)
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    tokio::time::timeout(Duration::from_secs(2), server.close())
        .await
        .expect("close should not hang with calls in flight");

    let (ok, offline) = tokio::time::timeout(Duration::from_secs(5), caller)
        .await
        .expect("caller should give up within its retry budget")
        .unwrap();
    assert!(ok > 0);
    assert_eq!(offline, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_subscribers_come_and_go() {
    let mut publisher = Publisher::bind(&Address::localhost(0)).await.unwrap();
    let address = publisher.address().clone();

    let sender = tokio::spawn(async move {
        for n in 0..100u64 {
            publisher.send("tick", &n).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        publisher
    });

    for _ in 0..5 {
        let mut subscriber = Subscriber::start(&address, Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Whatever arrived is strictly increasing
        let mut last: Option<u64> = None;
        while let Ok(Some(msg)) = subscriber.try_recv() {
            let n: u64 = msg.payload_as().unwrap();
            if let Some(prev) = last {
                assert!(n > prev, "out of order: {prev} then {n}");
            }
            last = Some(n);
        }

        tokio::time::timeout(Duration::from_secs(1), subscriber.stop())
            .await
            .expect("stop should not hang");
    }

    let mut publisher = sender.await.unwrap();
    publisher.close();
}

// =============================================================================
// Soak
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn chaos_soak_proxy_and_broadcast() {
    let config = ChaosConfig::default();
    let mut server = calculator_server().await;
    let endpoint = server.endpoint().clone();

    let mut publisher = Publisher::bind(&Address::localhost(0)).await.unwrap();
    let mut subscriber = Subscriber::start(publisher.address(), Duration::from_secs(2))
        .await
        .unwrap();
    tokio::time::sleep(SUBSCRIBE_SETTLE).await;

    let started = Instant::now();
    let mut client = ProxyClient::connect(endpoint, policy(1000, 3)).await.unwrap();
    let mut rounds = 0u64;

    while started.elapsed() < config.duration {
        let value = client.method("echo").arg(rounds).send().await.unwrap();
        publisher.send("result", &value).await.unwrap();
        rounds += 1;
    }

    let mut received = 0u64;
    while let Ok(Some(_)) = subscriber.recv_timeout(Duration::from_millis(200)).await {
        received += 1;
    }

    println!("soak: {rounds} calls, {received} broadcasts received");
    assert_eq!(received, rounds);

    subscriber.stop().await;
    publisher.close();
    server.close().await;
}
