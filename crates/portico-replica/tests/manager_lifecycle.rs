//! Coordinator lifecycle against in-process member stand-ins: bring-up,
//! proxying end to end, reconciliation, teardown.

mod common;

use common::FakeMember;
use std::sync::Arc;
use std::time::Duration;

use portico_common::MongoClient;
use portico_metrics::Stats;
use portico_replica::{ReplicaError, ReplicaSetConfig, StateManager};

fn config_for(seed: &str) -> ReplicaSetConfig {
    ReplicaSetConfig {
        addrs: seed.to_string(),
        // all interfaces, so the advertised proxy address is dialable
        // whether it carries the hostname or the loopback fallback
        listen_addr: "0.0.0.0".to_string(),
        // ephemeral ports keep parallel tests from colliding
        port_start: 0,
        port_end: 0,
        connect_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_start_proxies_and_forwards_commands() {
    let member = FakeMember::replica("rs0").await;
    let manager = StateManager::new(config_for(member.addr()), Arc::new(Stats::new()));

    manager.start().await.unwrap();

    let proxy_addr = manager.proxy(member.addr()).await.unwrap();
    let members = manager.proxy_members().await;
    assert_eq!(members, vec![proxy_addr.clone()]);

    // Dial the proxy as a client would and run a command through it.
    let mut client = MongoClient::connect(&proxy_addr, Duration::from_secs(1))
        .await
        .unwrap();
    let reply = client.is_master().await.unwrap();
    assert_eq!(reply.get_str("setName").unwrap(), "rs0");
    assert!(member.count_accepts() >= 1);

    manager.stop(false).await.unwrap();
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let member = FakeMember::replica("rs0").await;
    let manager = StateManager::new(config_for(member.addr()), Arc::new(Stats::new()));

    manager.start().await.unwrap();
    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, ReplicaError::AlreadyStarted));

    // and becomes startable again after a matching stop
    manager.stop(true).await.unwrap();
}

#[tokio::test]
async fn test_start_bumps_failed_state_creation() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap().to_string();
    drop(listener);

    let stats = Arc::new(Stats::new());
    let manager = StateManager::new(config_for(&dead), stats.clone());
    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, ReplicaError::NoReachableServers));
    assert_eq!(stats.counter("replica.start.failed_state_creation"), 1);
}

#[tokio::test]
async fn test_reconcile_adds_and_removes_members() {
    let a = FakeMember::replica("rs0").await;
    let b = FakeMember::replica("rs0").await;
    let addr_a = a.addr().to_string();
    let addr_b = b.addr().to_string();

    // initially only a is in the set
    a.set_view("rs0", &[&addr_a], &[(&addr_a, "PRIMARY")]);
    b.set_view("rs0", &[&addr_a], &[(&addr_a, "PRIMARY")]);

    let stats = Arc::new(Stats::new());
    let manager = StateManager::new(config_for(&addr_a), stats.clone());
    manager.start().await.unwrap();
    assert!(manager.proxy(&addr_b).await.is_err());

    // b joins; every member reports the two-member view
    let two = [
        (addr_a.as_str(), "PRIMARY"),
        (addr_b.as_str(), "SECONDARY"),
    ];
    a.set_view("rs0", &[&addr_a, &addr_b], &two);
    b.set_view("rs0", &[&addr_a, &addr_b], &two);
    manager.synchronize().await;

    let proxy_b = manager.proxy(&addr_b).await.unwrap();
    assert_eq!(manager.proxy_members().await.len(), 2);

    // client traffic flows through the fresh proxy
    let mut client = MongoClient::connect(&proxy_b, Duration::from_secs(1))
        .await
        .unwrap();
    client.is_master().await.unwrap();

    // b leaves again; both fakes report the single-member view
    a.set_view("rs0", &[&addr_a], &[(&addr_a, "PRIMARY")]);
    b.set_view("rs0", &[&addr_a], &[(&addr_a, "PRIMARY")]);
    manager.synchronize().await;

    let err = manager.proxy(&addr_b).await.unwrap_err();
    assert!(matches!(err, ReplicaError::NotInSet(_)));
    assert_eq!(manager.proxy_members().await.len(), 1);
    assert_eq!(stats.counter("replica.checker.failed_comparison"), 0);
    assert_eq!(stats.counter("replica.checker.failed_proxy_update"), 0);

    manager.stop(true).await.unwrap();
}

#[tokio::test]
async fn test_unstable_member_is_ignored_not_proxied() {
    let member = FakeMember::replica("rs0").await;
    let addr = member.addr().to_string();
    member.set_view(
        "rs0",
        &[&addr],
        &[(&addr, "PRIMARY"), ("joining:27017", "STARTUP2")],
    );

    let manager = StateManager::new(config_for(&addr), Arc::new(Stats::new()));
    manager.start().await.unwrap();

    manager.proxy(&addr).await.unwrap();
    let err = manager.proxy("joining:27017").await.unwrap_err();
    assert!(matches!(err, ReplicaError::IgnoredInState { .. }));

    manager.stop(true).await.unwrap();
}

#[tokio::test]
async fn test_failed_refresh_leaves_fleet_untouched() {
    let member = FakeMember::replica("rs0").await;
    let addr = member.addr().to_string();
    let stats = Arc::new(Stats::new());
    let manager = StateManager::new(config_for(&addr), stats.clone());
    manager.start().await.unwrap();

    // poison the view so the next snapshot has no usable members
    member.set_view("rs0", &[], &[]);
    manager.synchronize().await;

    // empty view is ambiguous: refuse to act, keep the proxy
    assert!(manager.proxy(&addr).await.is_ok());
    assert!(
        stats.counter("replica.checker.failed_state_check")
            + stats.counter("replica.checker.failed_comparison")
            >= 1
    );

    manager.stop(true).await.unwrap();
}
