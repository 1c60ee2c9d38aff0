mod support;

use axum::http::StatusCode;
use common::domain::{
    DomainError, KeyValueStore, MeshMessage, Namespace, NodeMapping, PositionReporter,
    StaticNodeTable,
};
use common::sqlite::SqliteKeyValueStore;
use mesh_gateway::{
    handle_mqtt_message, CalTopoReporter, GatewayStats, IdentityPolicy, IdentityResolver,
    LabelResolution, MeshGateway, MeshGatewayConfig, MessageDisposition, MessageRouter,
    MqttSubscriberConfig, DEFAULT_MAX_IN_FLIGHT_REPORTS,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use support::{local_config, FakeCalTopo};
use tokio_util::sync::CancellationToken;

struct Pipeline {
    router: Arc<MessageRouter>,
    store: Arc<SqliteKeyValueStore>,
}

fn pipeline(
    store: Arc<SqliteKeyValueStore>,
    base_url: &str,
    nodes: StaticNodeTable,
    allow_unknown_devices: bool,
) -> Pipeline {
    let resolver = IdentityResolver::new(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        nodes,
        IdentityPolicy {
            allow_unknown_devices,
        },
    )
    .unwrap();
    let reporter = CalTopoReporter::new(
        local_config(base_url, None, Some("GROUP_A")),
        CancellationToken::new(),
    )
    .unwrap();
    let router = MessageRouter::new(
        Arc::new(resolver),
        Arc::new(reporter) as Arc<dyn PositionReporter>,
        Arc::new(GatewayStats::new()),
    );
    Pipeline {
        router: Arc::new(router),
        store,
    }
}

fn publish(router: &MessageRouter, payload: serde_json::Value, retained: bool) {
    handle_mqtt_message(
        "msh/US/2/json/LongFast/!823a4edc",
        payload.to_string().as_bytes(),
        retained,
        router,
    );
}

fn nodeinfo() -> serde_json::Value {
    json!({
        "from": 2184859356u64,
        "sender": "!823a4edc",
        "type": "nodeinfo",
        "payload": {"id": "!823a4edc", "longname": "Alice", "shortname": "AL", "hardware": 43, "role": 0}
    })
}

fn position(from: u64) -> serde_json::Value {
    json!({
        "from": from,
        "type": "position",
        "payload": {"latitude_i": 612188460, "longitude_i": -1499001320, "altitude": 40}
    })
}

#[tokio::test]
async fn test_nodeinfo_then_position_reaches_caltopo_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("meshtopo_state.sqlite");
    let server = FakeCalTopo::new(StatusCode::OK);
    let base_url = server.serve().await;

    {
        let store = Arc::new(SqliteKeyValueStore::open(&db_path).unwrap());
        let pipeline = pipeline(store, &base_url, StaticNodeTable::default(), false);

        publish(&pipeline.router, nodeinfo(), false);
        publish(&pipeline.router, position(2184859356), false);
        pipeline.router.wait_for_in_flight_reports().await;

        let stats = pipeline.router.stats().snapshot();
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.messages_processed, 2);
        assert_eq!(stats.position_updates_sent, 1);
        assert_eq!(stats.errors, 0);

        assert_eq!(
            pipeline
                .store
                .get(Namespace::NodeIdMapping, "2184859356")
                .unwrap(),
            Some(json!("!823a4edc"))
        );
    }

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].identifier, "GROUP_A");
    assert_eq!(requests[0].params.get("id").map(String::as_str), Some("Alice"));

    // learned identity is reloaded from disk
    let store = Arc::new(SqliteKeyValueStore::open(&db_path).unwrap());
    let resolver = IdentityResolver::new(
        store,
        StaticNodeTable::default(),
        IdentityPolicy {
            allow_unknown_devices: false,
        },
    )
    .unwrap();
    let resolution = resolver.resolve_stable_id(2184859356);
    assert!(!resolution.provisional);
    assert_eq!(
        resolver.resolve_label(&resolution.stable_id),
        LabelResolution::Resolved("Alice".to_string())
    );
}

#[tokio::test]
async fn test_static_label_overrides_learned_name() {
    let server = FakeCalTopo::new(StatusCode::OK);
    let base_url = server.serve().await;
    let mut nodes = HashMap::new();
    nodes.insert(
        "!823a4edc".to_string(),
        NodeMapping {
            device_id: "TEAM-LEAD".to_string(),
            group: None,
        },
    );
    let store = Arc::new(SqliteKeyValueStore::in_memory().unwrap());
    let pipeline = pipeline(store, &base_url, StaticNodeTable::new(nodes), false);

    publish(&pipeline.router, nodeinfo(), false);
    publish(&pipeline.router, position(2184859356), false);
    pipeline.router.wait_for_in_flight_reports().await;

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].params.get("id").map(String::as_str), Some("TEAM-LEAD"));
}

#[tokio::test]
async fn test_blocked_unknown_device_never_touches_store_or_network() {
    let server = FakeCalTopo::new(StatusCode::OK);
    let base_url = server.serve().await;
    let store = Arc::new(SqliteKeyValueStore::in_memory().unwrap());
    let pipeline = pipeline(store, &base_url, StaticNodeTable::default(), false);

    publish(&pipeline.router, position(24896776), false);
    pipeline.router.wait_for_in_flight_reports().await;

    let stats = pipeline.router.stats().snapshot();
    assert_eq!(stats.messages_received, 1);
    assert_eq!(stats.messages_processed, 0);
    assert_eq!(stats.errors, 0);
    assert!(server.requests().is_empty());
    assert_eq!(pipeline.store.count(Namespace::NodeIdMapping).unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_device_reported_under_stable_id_when_allowed() {
    let server = FakeCalTopo::new(StatusCode::OK);
    let base_url = server.serve().await;
    let store = Arc::new(SqliteKeyValueStore::in_memory().unwrap());
    let pipeline = pipeline(store, &base_url, StaticNodeTable::default(), true);

    publish(&pipeline.router, position(24896776), false);
    // retained replays are ignored
    publish(&pipeline.router, position(24896776), true);
    pipeline.router.wait_for_in_flight_reports().await;

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].params.get("id").map(String::as_str), Some("!017be508"));
    assert_eq!(
        pipeline.store.get(Namespace::NodeIdMapping, "24896776").unwrap(),
        Some(json!("!017be508"))
    );
    // the synthetic label is never stored
    assert_eq!(pipeline.store.count(Namespace::CallsignMapping).unwrap(), 0);
}

#[tokio::test]
async fn test_failed_delivery_counts_error() {
    let server = FakeCalTopo::new(StatusCode::FORBIDDEN);
    let base_url = server.serve().await;
    let store = Arc::new(SqliteKeyValueStore::in_memory().unwrap());
    let pipeline = pipeline(store, &base_url, StaticNodeTable::default(), true);

    let unsupported = json!({"from": 7, "type": "mapreport"});
    assert_eq!(
        pipeline.router.process(MeshMessage::from_json(position(7)).unwrap()),
        MessageDisposition::Processed
    );
    assert_eq!(
        pipeline.router.process(MeshMessage::from_json(unsupported).unwrap()),
        MessageDisposition::Dropped
    );
    pipeline.router.wait_for_in_flight_reports().await;

    let stats = pipeline.router.stats().snapshot();
    assert_eq!(stats.messages_received, 2);
    assert_eq!(stats.messages_processed, 1);
    assert_eq!(stats.position_updates_sent, 0);
    assert_eq!(stats.errors, 1);
}

#[tokio::test]
async fn test_gateway_refuses_untrusted_base_url() {
    let config = MeshGatewayConfig {
        mqtt: MqttSubscriberConfig::default(),
        caltopo: mesh_gateway::CalTopoReporterConfig {
            group: Some("GROUP_A".to_string()),
            base_url: "https://evil.example.com/api/v1/position/report".to_string(),
            ..Default::default()
        },
        nodes: StaticNodeTable::default(),
        identity: IdentityPolicy::default(),
        stats_interval: Duration::from_secs(60),
        max_in_flight_reports: DEFAULT_MAX_IN_FLIGHT_REPORTS,
    };
    let store = Arc::new(SqliteKeyValueStore::in_memory().unwrap());

    let result = MeshGateway::new(config, store);
    assert!(matches!(result, Err(DomainError::InsecureBaseUrl(_))));
}

#[tokio::test]
async fn test_gateway_processes_stop_on_cancel() {
    let server = FakeCalTopo::new(StatusCode::OK);
    let base_url = server.serve().await;
    let config = MeshGatewayConfig {
        mqtt: MqttSubscriberConfig {
            broker: "127.0.0.1".to_string(),
            port: 1,
            reconnect_base_delay: Duration::from_millis(10),
            ..Default::default()
        },
        caltopo: local_config(&base_url, Some("KEY123"), None),
        nodes: StaticNodeTable::default(),
        identity: IdentityPolicy::default(),
        stats_interval: Duration::from_millis(20),
        max_in_flight_reports: DEFAULT_MAX_IN_FLIGHT_REPORTS,
    };
    let store = Arc::new(SqliteKeyValueStore::in_memory().unwrap());
    let gateway = MeshGateway::new(config, store).unwrap();
    assert!(gateway.check_connectivity().await);
    let stats = Arc::clone(gateway.stats());

    let token = CancellationToken::new();
    let (processes, closer) = gateway.into_runner_processes();
    let handles: Vec<_> = processes
        .into_iter()
        .map(|(_, process)| tokio::spawn(process(token.clone())))
        .collect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("process did not stop")
            .unwrap()
            .unwrap();
    }
    closer().await.unwrap();
    assert_eq!(stats.snapshot().messages_received, 0);
}
