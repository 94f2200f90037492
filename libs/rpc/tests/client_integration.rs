//! End-to-end tests of CommunicationClient against an in-process TCP server

mod common;

use common::{init_tracing, payload, TestServer};
use rpc::{
    ClientConfig, ClientContext, CommunicationClient, FnCallback, Request, RpcError, StrategyKind,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

fn config(strategy: StrategyKind) -> ClientConfig {
    ClientConfig {
        connection: strategy,
        max_connections: 2,
        min_idle_connections: 0,
        connect_timeout_ms: 1_000,
        read_timeout_ms: 1_000,
        ..ClientConfig::default()
    }
}

async fn open(server: &TestServer, config: &ClientConfig) -> (CommunicationClient, ClientContext) {
    let context = ClientContext::tcp(config);
    let client = CommunicationClient::new(server.instance.clone(), &context, config)
        .await
        .expect("client should open");
    (client, context)
}

#[tokio::test]
async fn test_round_trip_records_latency() {
    init_tracing();
    let server = TestServer::start().await;
    let (client, context) = open(&server, &config(StrategyKind::Pooled)).await;

    let response = client
        .execute(Request::new("echo", "ping", payload("hello")))
        .await
        .expect("ping should succeed");

    assert!(response.is_ok());
    assert_eq!(response.payload, payload("hello"));
    assert!(context.registry.is_empty());
    assert_eq!(client.health().acquired_num(), 1);
    assert_eq!(client.health().failed_num(), 0);
    assert_eq!(client.health().latency_samples().len(), 1);

    client.close().await;
}

#[tokio::test]
async fn test_pool_waiter_gets_connection_released_by_earlier_call() {
    init_tracing();
    let server = TestServer::with_delay(Duration::from_millis(100)).await;
    let (client, _context) = open(&server, &config(StrategyKind::Pooled)).await;
    let client = Arc::new(client);

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .execute(Request::new("echo", "slow", payload("queued")))
                    .await
            })
        })
        .collect();

    for call in calls {
        let response = call.await.unwrap().expect("every call should eventually succeed");
        assert_eq!(response.payload, payload("queued"));
    }

    assert_eq!(server.connections(), 2, "pool must not exceed max_connections");
    let stats = client.stats();
    assert_eq!(stats.max, 2);
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.active, 0);

    client.close().await;
}

#[tokio::test]
async fn test_pool_exhaustion_doubles_max() {
    init_tracing();
    let server = TestServer::with_delay(Duration::from_millis(500)).await;
    let config = ClientConfig {
        connect_timeout_ms: 50,
        ..config(StrategyKind::Pooled)
    };
    let (client, _context) = open(&server, &config).await;
    let client = Arc::new(client);

    let busy: Vec<_> = (0..2)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .execute(Request::new("echo", "slow", payload("busy")))
                    .await
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = client
        .execute(Request::new("echo", "ping", payload("third")))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "network");
    assert!(err.is_retryable());
    assert_eq!(client.stats().max, 4);

    let response = client
        .execute(Request::new("echo", "ping", payload("fourth")))
        .await
        .expect("grown pool should accept the next call");
    assert_eq!(response.payload, payload("fourth"));

    for call in busy {
        call.await.unwrap().expect("slow calls still complete");
    }
    client.close().await;
}

#[tokio::test]
async fn test_silent_server_times_out_and_clears_registry() {
    init_tracing();
    let server = TestServer::start().await;
    let config = ClientConfig {
        read_timeout_ms: 100,
        ..config(StrategyKind::Pooled)
    };
    let (client, context) = open(&server, &config).await;

    let started = Instant::now();
    let err = client
        .execute(Request::new("echo", "silent", payload("anyone?")))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    match &err {
        RpcError::Timeout {
            operation,
            timeout_ms,
            remote,
            ..
        } => {
            assert!(operation.contains("echo.silent"), "{operation}");
            assert_eq!(*timeout_ms, 100);
            assert_eq!(remote.as_ref(), Some(&server.instance));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(80), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "fired late: {elapsed:?}");
    assert!(context.registry.is_empty());
    assert_eq!(client.health().failed_num(), 1);
    assert_eq!(client.health().latency_samples(), vec![200]);

    client.close().await;
}

#[tokio::test]
async fn test_late_response_is_dropped() {
    init_tracing();
    let server = TestServer::with_delay(Duration::from_millis(150)).await;
    let config = ClientConfig {
        read_timeout_ms: 50,
        ..config(StrategyKind::Pooled)
    };
    let (client, context) = open(&server, &config).await;

    let err = client
        .execute(Request::new("echo", "slow", payload("late")))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "timeout");

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(context.registry.is_empty());

    let response = client
        .execute(Request::new("echo", "ping", payload("after")))
        .await
        .expect("client keeps working after a late response");
    assert_eq!(response.payload, payload("after"));

    client.close().await;
}

#[tokio::test]
async fn test_service_error_is_not_a_transport_failure() {
    init_tracing();
    let server = TestServer::start().await;
    let (client, _context) = open(&server, &config(StrategyKind::Pooled)).await;

    let err = client
        .execute(Request::new("echo", "fail", payload("x")))
        .await
        .unwrap_err();

    match &err {
        RpcError::Service { code, message } => {
            assert_eq!(*code, 500);
            assert_eq!(message, "boom");
        }
        other => panic!("expected service error, got {other:?}"),
    }
    assert!(!err.is_retryable());
    assert_eq!(client.health().failed_num(), 0);
    assert_eq!(client.stats().idle, 1, "connection goes back to the pool");

    client.close().await;
}

#[tokio::test]
async fn test_callback_receives_response() {
    init_tracing();
    let server = TestServer::start().await;
    let (client, _context) = open(&server, &config(StrategyKind::Pooled)).await;

    let (tx, rx) = oneshot::channel();
    let id = client
        .execute_with_callback(
            Request::new("echo", "ping", payload("async")),
            FnCallback::boxed(
                move |response: rpc::Response| {
                    let _ = tx.send(response);
                },
                |error: RpcError| panic!("unexpected failure: {error}"),
            ),
        )
        .await;

    assert!(id.is_some());
    let response = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("callback should fire")
        .unwrap();
    assert_eq!(response.correlation_id, id.unwrap());
    assert_eq!(response.payload, payload("async"));

    client.close().await;
}

#[tokio::test]
async fn test_callback_receives_timeout() {
    init_tracing();
    let server = TestServer::start().await;
    let config = ClientConfig {
        read_timeout_ms: 100,
        ..config(StrategyKind::Pooled)
    };
    let (client, context) = open(&server, &config).await;

    let (tx, rx) = oneshot::channel();
    client
        .execute_with_callback(
            Request::new("echo", "silent", payload("async")),
            FnCallback::boxed(
                |_| panic!("silent method must not answer"),
                move |error: RpcError| {
                    let _ = tx.send(error.category());
                },
            ),
        )
        .await;

    let category = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("timeout should reach the callback")
        .unwrap();
    assert_eq!(category, "timeout");
    assert!(context.registry.is_empty());

    client.close().await;
}

#[tokio::test]
async fn test_single_strategy_shares_one_connection() {
    init_tracing();
    let server = TestServer::with_delay(Duration::from_millis(50)).await;
    let (client, _context) = open(&server, &config(StrategyKind::Single)).await;
    let client = Arc::new(client);

    let calls: Vec<_> = (0..4)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let body = format!("call-{i}");
                let response = client
                    .execute(Request::new("echo", "slow", body.clone().into_bytes()))
                    .await?;
                assert_eq!(response.payload, body.into_bytes());
                Ok::<_, RpcError>(())
            })
        })
        .collect();
    for call in calls {
        call.await.unwrap().expect("multiplexed call should succeed");
    }

    assert_eq!(server.connections(), 1);
    assert_eq!(client.stats().live, 1);
    client.close().await;
}

#[tokio::test]
async fn test_short_strategy_connects_per_call() {
    init_tracing();
    let server = TestServer::start().await;
    let (client, _context) = open(&server, &config(StrategyKind::Short)).await;

    for _ in 0..3 {
        client
            .execute(Request::new("echo", "ping", payload("once")))
            .await
            .expect("short-lived call should succeed");
    }

    assert_eq!(server.connections(), 3);
    assert_eq!(client.stats().live, 0);
    client.close().await;
}

#[tokio::test]
async fn test_connect_refused_is_network_error() {
    init_tracing();
    let instance = common::dead_instance().await;
    let config = config(StrategyKind::Pooled);
    let client = CommunicationClient::connect(instance.clone(), &config)
        .await
        .expect("pooled client opens lazily");

    let err = client
        .execute(Request::new("echo", "ping", payload("x")))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "network");
    assert_eq!(err.remote(), Some(&instance));
    assert_eq!(client.health().failed_num(), 1);

    client.close().await;
}
