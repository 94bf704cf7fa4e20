mod common;

use common::*;
use futures::future::BoxFuture;
use iproto_mux::{
    ClientConfig, ClientError, ClusterClient, ClusterConfig, Code, Payload, Request,
    ServiceDiscoverer, StaticSchema, Value,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn cluster_config() -> ClusterConfig {
    ClusterConfig {
        client: ClientConfig {
            operation_timeout: Duration::from_secs(10),
            init_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        discovery_delay: Duration::from_millis(100),
    }
}

fn select_by_id() -> Request {
    Request::select(512u64, 0u64, Value::Array(vec![]), 100, 0, 0)
}

#[tokio::test]
async fn test_failover_retries_inflight_request_on_next_member() {
    setup_log();
    // member A resets the connection as soon as a data request arrives
    let flaky: Handler = Arc::new(|packet, _ctx| {
        if packet.code == Code::Select as u64 {
            return Action::Hangup;
        }
        Action::Reply(vec![ok_empty(packet.sync, 1)])
    });
    // member B answers everything
    let healthy: Handler = Arc::new(|packet, _ctx| {
        if packet.code == Code::Select as u64 {
            let row = Value::Array(vec![Value::from("from-b")]);
            return Action::Reply(vec![ok_data(packet.sync, 1, Value::Array(vec![row]))]);
        }
        Action::Reply(vec![ok_empty(packet.sync, 1)])
    });
    let member_a = MockServer::spawn(flaky).await;
    let member_b = MockServer::spawn(healthy).await;

    let schema = Arc::new(StaticSchema::initialized_at(1));
    let client = ClusterClient::new(
        cluster_config(),
        &[member_a.addr(), member_b.addr()],
        schema,
        None,
    )
    .await
    .expect("connect to member A");

    let response = client
        .exec(select_by_id())
        .await
        .resolve()
        .await
        .expect("request survives the fail-over");
    let expected = Value::Array(vec![Value::Array(vec![Value::from("from-b")])]);
    assert_eq!(response.payload, Payload::Data(expected));
    assert!(client.is_alive());
    client.close().await;
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_close_fails_parked_retries() {
    setup_log();
    // the single member dies on data traffic and the pool has nowhere else
    // to go, so a parked request only resolves when the client is closed
    let flaky: Handler = Arc::new(|packet, _ctx| {
        if packet.code == Code::Select as u64 {
            return Action::Hangup;
        }
        Action::Reply(vec![ok_empty(packet.sync, 1)])
    });
    let member = MockServer::spawn(flaky).await;
    let schema = Arc::new(StaticSchema::initialized_at(1));
    let client = ClusterClient::new(cluster_config(), &[member.addr()], schema, None)
        .await
        .expect("connect");

    let fut = client.exec(select_by_id()).await;
    // wait for the hangup to be noticed and the request to be parked
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!fut.is_done(), "a transient failure does not fail the caller");
    client.close().await;
    let err = fut.resolve().await.unwrap_err();
    match err {
        ClientError::Communication(msg) => assert!(msg.contains("connection is closed")),
        other => panic!("expected the close error, got {}", other),
    }
}

struct FixedDiscoverer {
    members: std::sync::Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ServiceDiscoverer for FixedDiscoverer {
    fn instances(&self) -> BoxFuture<'_, Result<Vec<String>, ClientError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::AcqRel);
            Ok(self.members.lock().unwrap().clone())
        })
    }
}

#[tokio::test]
async fn test_discovery_moves_off_removed_member() {
    setup_log();
    let ok_handler = |name: &'static str| -> Handler {
        Arc::new(move |packet, _ctx| {
            if packet.code == Code::Select as u64 {
                let row = Value::Array(vec![Value::from(name)]);
                return Action::Reply(vec![ok_data(packet.sync, 1, Value::Array(vec![row]))]);
            }
            Action::Reply(vec![ok_empty(packet.sync, 1)])
        })
    };
    let member_a = MockServer::spawn(ok_handler("a")).await;
    let member_b = MockServer::spawn(ok_handler("b")).await;

    let discoverer = Arc::new(FixedDiscoverer {
        members: std::sync::Mutex::new(vec![member_a.addr(), member_b.addr()]),
        calls: AtomicUsize::new(0),
    });
    let schema = Arc::new(StaticSchema::initialized_at(1));
    // short per-request deadline so requests dispatched mid-switch recycle fast
    let mut config = cluster_config();
    config.client.operation_timeout = Duration::from_millis(500);
    let client = ClusterClient::new(
        config,
        &[member_a.addr(), member_b.addr()],
        schema,
        Some(Box::new(DiscovererRef(discoverer.clone()))),
    )
    .await
    .expect("connect");
    assert!(wait_until(|| discoverer.calls.load(Ordering::Acquire) >= 1, Duration::from_secs(2))
        .await);

    // drop the active member from the set; the next tick forces a switch
    *discoverer.members.lock().unwrap() = vec![member_b.addr()];
    assert!(
        wait_until(|| client.is_alive(), Duration::from_secs(5)).await,
        "client reconnects to the surviving member"
    );
    // give the switch time to land on B, then prove traffic flows
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let response = client.exec(select_by_id()).await.resolve().await;
        match response {
            Ok(r) => {
                let expected = Value::Array(vec![Value::Array(vec![Value::from("b")])]);
                if r.payload == Payload::Data(expected) {
                    break;
                }
            }
            Err(_) => {}
        }
        if tokio::time::Instant::now() > deadline {
            panic!("traffic never moved to the surviving member");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    client.close().await;
}

struct DiscovererRef(Arc<FixedDiscoverer>);

impl ServiceDiscoverer for DiscovererRef {
    fn instances(&self) -> BoxFuture<'_, Result<Vec<String>, ClientError>> {
        self.0.instances()
    }
}
