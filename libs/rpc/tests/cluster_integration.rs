//! ServiceClient against live and dead instances

mod common;

use common::{dead_instance, init_tracing, payload, TestServer};
use rpc::{
    ClientConfig, LoadBalanceKind, Request, RpcError, ServiceClient, StaticDiscovery, StrategyKind,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn config(balance: LoadBalanceKind) -> ClientConfig {
    ClientConfig {
        connection: StrategyKind::Pooled,
        load_balance: balance,
        min_idle_connections: 0,
        connect_timeout_ms: 500,
        read_timeout_ms: 500,
        retries: 2,
        ..ClientConfig::default()
    }
}

async fn wait_for_instances(client: &ServiceClient, expected: &[rpc::Instance]) {
    let expected: BTreeSet<_> = expected.iter().cloned().collect();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let current: BTreeSet<_> = client.instances().into_iter().collect();
            if current == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("membership change should be applied");
}

#[tokio::test]
async fn test_retry_moves_to_live_instance() {
    init_tracing();
    let server = TestServer::start().await;
    let dead = dead_instance().await;
    let discovery = Arc::new(StaticDiscovery::new([dead.clone(), server.instance.clone()]));
    let client = ServiceClient::new("echo", discovery, config(LoadBalanceKind::RoundRobin))
        .await
        .unwrap();

    for i in 0..6 {
        let body = format!("call-{i}");
        let response = client
            .invoke(Request::new("echo", "ping", body.clone().into_bytes()))
            .await
            .expect("retry should reach the live instance");
        assert_eq!(response.payload, body.into_bytes());
    }

    let dead_client = client.client(&dead).unwrap();
    assert!(dead_client.health().failed_num() > 0);
    assert_eq!(server.requests(), 6);

    client.close().await;
}

#[tokio::test]
async fn test_all_instances_down_reports_last_failure() {
    init_tracing();
    let first = dead_instance().await;
    let second = dead_instance().await;
    let discovery = Arc::new(StaticDiscovery::new([first, second]));
    let client = ServiceClient::new("echo", discovery, config(LoadBalanceKind::Random))
        .await
        .unwrap();

    let err = client
        .invoke(Request::new("echo", "ping", payload("x")))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "network");
    assert!(err.remote().is_some());

    client.close().await;
}

#[tokio::test]
async fn test_service_error_is_not_retried() {
    init_tracing();
    let a = TestServer::start().await;
    let b = TestServer::start().await;
    let discovery = Arc::new(StaticDiscovery::new([a.instance.clone(), b.instance.clone()]));
    let client = ServiceClient::new("echo", discovery, config(LoadBalanceKind::RoundRobin))
        .await
        .unwrap();

    let err = client
        .invoke(Request::new("echo", "fail", payload("x")))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Service { code: 500, .. }));
    assert_eq!(a.requests() + b.requests(), 1);

    client.close().await;
}

#[tokio::test]
async fn test_timeouts_are_retried_on_another_instance() {
    init_tracing();
    let a = TestServer::start().await;
    let b = TestServer::start().await;
    let discovery = Arc::new(StaticDiscovery::new([a.instance.clone(), b.instance.clone()]));
    let config = ClientConfig {
        read_timeout_ms: 50,
        retries: 1,
        ..config(LoadBalanceKind::RoundRobin)
    };
    let client = ServiceClient::new("echo", discovery, config).await.unwrap();

    let err = client
        .invoke(Request::new("echo", "silent", payload("x")))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "timeout");
    assert_eq!(a.requests(), 1);
    assert_eq!(b.requests(), 1);
    assert!(client.context().registry.is_empty());

    client.close().await;
}

#[tokio::test]
async fn test_discovery_updates_membership() {
    init_tracing();
    let a = TestServer::start().await;
    let b = TestServer::start().await;
    let discovery = Arc::new(StaticDiscovery::new([a.instance.clone()]));
    let client = ServiceClient::new("echo", discovery.clone(), config(LoadBalanceKind::RoundRobin))
        .await
        .unwrap();
    assert_eq!(client.instances(), vec![a.instance.clone()]);

    discovery.update([a.instance.clone(), b.instance.clone()]);
    wait_for_instances(&client, &[a.instance.clone(), b.instance.clone()]).await;

    for _ in 0..4 {
        client
            .invoke(Request::new("echo", "ping", payload("spread")))
            .await
            .unwrap();
    }
    assert_eq!(a.requests(), 2);
    assert_eq!(b.requests(), 2);

    discovery.update([b.instance.clone()]);
    wait_for_instances(&client, &[b.instance.clone()]).await;

    client
        .invoke(Request::new("echo", "ping", payload("only b")))
        .await
        .unwrap();
    assert_eq!(a.requests(), 2);
    assert_eq!(b.requests(), 3);

    client.close().await;
}

#[tokio::test]
async fn test_latency_fair_routes_after_refresh() {
    init_tracing();
    let a = TestServer::start().await;
    let b = TestServer::start().await;
    let discovery = Arc::new(StaticDiscovery::new([a.instance.clone(), b.instance.clone()]));
    let config = ClientConfig {
        latency_window_size: 2,
        ..config(LoadBalanceKind::LatencyFair)
    };
    let client = ServiceClient::new("echo", discovery, config).await.unwrap();

    for _ in 0..8 {
        client
            .invoke(Request::new("echo", "ping", payload("warm")))
            .await
            .unwrap();
    }
    client.refresh();

    for _ in 0..20 {
        client
            .invoke(Request::new("echo", "ping", payload("fair")))
            .await
            .expect("fair selection should reach a live instance");
    }
    assert_eq!(a.requests() + b.requests(), 28);

    client.close().await;
}
