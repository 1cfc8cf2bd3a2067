//! End-to-end tests: a broker on a local port with real device and client
//! sessions.

use shv_chainpack::{ErrorCode, ProtocolType, RpcValue};
use shv_iot::node::{flags, MethodSignature};
use shv_iot::{
    app_node, AccessLevel, Broker, BrokerConfig, BrokerHandle, CallContext, ClientConfig,
    ClientConnection, LocalFsNode, MetaMethod, MethodNode, ShvError, ShvNode, ShvTree,
};
use std::time::Duration;
use tempfile::TempDir;

const MOUNT: &str = "test/dev";

/// Answers `wait` after a second.
struct SlowNode;

#[async_trait::async_trait]
impl ShvNode for SlowNode {
    async fn methods(&self, _sub_path: &str) -> shv_iot::Result<Vec<MetaMethod>> {
        Ok(vec![MetaMethod::call("wait", AccessLevel::Read)])
    }

    async fn invoke(
        &self,
        _sub_path: &str,
        _method: &str,
        _params: Option<RpcValue>,
        _ctx: &CallContext,
    ) -> shv_iot::Result<RpcValue> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(RpcValue::from(true))
    }
}

async fn start_broker() -> BrokerHandle {
    let config = BrokerConfig::new("127.0.0.1", 0)
        .with_user("admin", "admin!", AccessLevel::Admin)
        .with_user("operator", "op", AccessLevel::Write)
        .with_user("viewer", "view", AccessLevel::Read);
    Broker::start(config).await.unwrap()
}

fn config(broker: &BrokerHandle, user: &str, password: &str) -> ClientConfig {
    ClientConfig::new("127.0.0.1", broker.port)
        .with_user(user, password)
        .with_heartbeat(None)
}

async fn connect(broker: &BrokerHandle, user: &str, password: &str) -> ClientConnection {
    ClientConnection::connect(config(broker, user, password))
        .await
        .unwrap()
}

fn device_tree(files: &TempDir) -> ShvTree {
    ShvTree::new()
        .with_node("", app_node("test-device", Some("dev-1".to_string())))
        .unwrap()
        .with_node(
            "sensor",
            MethodNode::new()
                .with_method(MetaMethod::getter("value", AccessLevel::Read), |_, _| {
                    Ok(RpcValue::from(42))
                })
                .with_method(
                    MetaMethod::new(
                        "set",
                        MethodSignature::VoidParam,
                        flags::SETTER,
                        AccessLevel::Write,
                    ),
                    |params, _| Ok(params.unwrap_or_default()),
                ),
        )
        .unwrap()
        .with_node("slow", SlowNode)
        .unwrap()
        .with_node("files", LocalFsNode::new(files.path()))
        .unwrap()
}

async fn connect_device(broker: &BrokerHandle, files: &TempDir) -> ClientConnection {
    let config = config(broker, "operator", "op").with_device("dev-1", Some(MOUNT));
    ClientConnection::connect_device(config, device_tree(files))
        .await
        .unwrap()
}

fn fixture_files() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"hello world").unwrap();
    std::fs::create_dir(dir.path().join("logs")).unwrap();
    dir
}

fn remote_code(result: shv_iot::Result<RpcValue>) -> ErrorCode {
    match result {
        Err(ShvError::Remote(error)) => error.code,
        other => panic!("expected an error response, got {:?}", other),
    }
}

fn names(value: &RpcValue) -> Vec<String> {
    value
        .as_list()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..20 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_device_tree_reachable_through_mount() {
    let mut broker = start_broker().await;
    let files = fixture_files();
    let _device = connect_device(&broker, &files).await;
    let client = connect(&broker, "admin", "admin!").await;

    let root = client.call("", "ls", None).await.unwrap();
    assert_eq!(names(&root), vec![".broker", "test"]);
    let test = client.call("test", "ls", None).await.unwrap();
    assert_eq!(names(&test), vec!["dev"]);

    let device = client.call(MOUNT, "ls", None).await.unwrap();
    assert_eq!(names(&device), vec!["files", "sensor", "slow"]);

    let app_name = client.call(MOUNT, "appName", None).await.unwrap();
    assert_eq!(app_name.as_str(), Some("test-device"));

    let value = client.call("test/dev/sensor", "value", None).await.unwrap();
    assert_eq!(value, RpcValue::from(42));

    let has_value = client
        .call("test/dev/sensor", "dir", Some(RpcValue::from("value")))
        .await
        .unwrap();
    assert_eq!(has_value.get("name").and_then(RpcValue::as_str), Some("value"));

    let missing = client.call("test/dev/sensor", "nope", None).await;
    assert_eq!(remote_code(missing), ErrorCode::MethodNotFound);

    broker.shutdown();
}

#[tokio::test]
async fn test_local_files_through_mount() {
    let mut broker = start_broker().await;
    let files = fixture_files();
    let _device = connect_device(&broker, &files).await;
    let client = connect(&broker, "viewer", "view").await;

    let listing = client.call("test/dev/files", "ls", None).await.unwrap();
    assert_eq!(names(&listing), vec!["hello.txt", "logs"]);

    let size = client
        .call("test/dev/files/hello.txt", "size", None)
        .await
        .unwrap();
    assert_eq!(size.as_int(), Some(11));

    let content = client
        .call("test/dev/files/hello.txt", "read", None)
        .await
        .unwrap();
    assert_eq!(content.as_blob(), Some(&b"hello world"[..]));

    let escape = client.call("test/dev/files/../secret", "ls", None).await;
    assert_eq!(remote_code(escape), ErrorCode::PermissionDenied);

    broker.shutdown();
}

#[tokio::test]
async fn test_access_grant_enforced_on_device() {
    let mut broker = start_broker().await;
    let files = fixture_files();
    let _device = connect_device(&broker, &files).await;

    let viewer = connect(&broker, "viewer", "view").await;
    let denied = viewer
        .call("test/dev/sensor", "set", Some(RpcValue::from(5)))
        .await;
    assert_eq!(remote_code(denied), ErrorCode::PermissionDenied);

    let admin = connect(&broker, "admin", "admin!").await;
    let echoed = admin
        .call("test/dev/sensor", "set", Some(RpcValue::from(5)))
        .await
        .unwrap();
    assert_eq!(echoed, RpcValue::from(5));

    let broker_app = viewer.call(".broker/app", "clientIds", None).await;
    assert_eq!(remote_code(broker_app), ErrorCode::PermissionDenied);

    broker.shutdown();
}

#[tokio::test]
async fn test_tunnel_open_call_close() {
    let mut broker = start_broker().await;
    let files = fixture_files();
    let _device = connect_device(&broker, &files).await;
    let client = connect(&broker, "operator", "op").await;

    let tunnel = client.open_tunnel(MOUNT).await.unwrap();
    assert_eq!(tunnel.caller_client_ids, vec![client.client_id()]);

    let value = client
        .call_tunneled(&tunnel, "sensor", "value", None)
        .await
        .unwrap();
    assert_eq!(value, RpcValue::from(42));

    client.close_tunnel(&tunnel).await.unwrap();
    let closed = client.call_tunneled(&tunnel, "sensor", "value", None).await;
    assert_eq!(remote_code(closed), ErrorCode::ConnectionClosed);

    broker.shutdown();
}

#[tokio::test]
async fn test_tunnel_belongs_to_anchor() {
    let mut broker = start_broker().await;
    let files = fixture_files();
    let _device = connect_device(&broker, &files).await;
    let anchor = connect(&broker, "operator", "op").await;
    let other = connect(&broker, "operator", "op").await;

    let tunnel = anchor.open_tunnel(MOUNT).await.unwrap();
    let stolen = other.call_tunneled(&tunnel, "sensor", "value", None).await;
    assert_eq!(remote_code(stolen), ErrorCode::PermissionDenied);

    anchor.close().await;
    let state = broker.state().clone();
    wait_until(|| state.tunnels().unwrap().is_empty()).await;

    let gone = other.call_tunneled(&tunnel, "sensor", "value", None).await;
    assert_eq!(remote_code(gone), ErrorCode::ConnectionClosed);

    broker.shutdown();
}

#[tokio::test]
async fn test_call_times_out() {
    let mut broker = start_broker().await;
    let files = fixture_files();
    let _device = connect_device(&broker, &files).await;
    let client = connect(&broker, "viewer", "view").await;

    let result = client
        .call_with_timeout("test/dev/slow", "wait", None, Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(ShvError::Timeout(_))));

    broker.shutdown();
}

#[tokio::test]
async fn test_signals_reach_subscribers() {
    let mut broker = start_broker().await;
    let files = fixture_files();
    let device = connect_device(&broker, &files).await;
    let client = connect(&broker, "viewer", "view").await;
    let mut signals = client.signals();

    client.subscribe("test", Some("chng")).await.unwrap();
    device
        .send_signal("sensor", "chng", Some(RpcValue::from(21)))
        .unwrap();

    let signal = tokio::time::timeout(Duration::from_secs(2), signals.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(signal.shv_path, "test/dev/sensor");
    assert_eq!(signal.method, "chng");
    assert_eq!(signal.params, Some(RpcValue::from(21)));

    assert!(client.unsubscribe("test", Some("chng")).await.unwrap());
    device
        .send_signal("sensor", "chng", Some(RpcValue::from(22)))
        .unwrap();
    let silent = tokio::time::timeout(Duration::from_millis(200), signals.recv()).await;
    assert!(silent.is_err());

    broker.shutdown();
}

#[tokio::test]
async fn test_duplicate_mount_rejected() {
    let mut broker = start_broker().await;
    let files = fixture_files();
    let _device = connect_device(&broker, &files).await;

    let config = config(&broker, "operator", "op").with_device("dev-2", Some(MOUNT));
    let second = ClientConnection::connect_device(config, device_tree(&files)).await;
    assert!(matches!(second, Err(ShvError::LoginFailed { .. })));

    broker.shutdown();
}

#[tokio::test]
async fn test_broker_path_cannot_be_mounted() {
    let mut broker = start_broker().await;
    let files = fixture_files();
    let admin = connect(&broker, "admin", "admin!").await;

    for mount in [".broker", ".broker/app", "/.broker/app/x"] {
        let config = config(&broker, "viewer", "view").with_device("rogue", Some(mount));
        let result = ClientConnection::connect_device(config, device_tree(&files)).await;
        assert!(
            matches!(result, Err(ShvError::LoginFailed { .. })),
            "mount {}",
            mount
        );
    }

    assert!(broker.state().mount_points().unwrap().is_empty());
    let ids = admin.call(".broker/app", "clientIds", None).await.unwrap();
    assert_eq!(ids.as_list().map(|l| l.len()), Some(1));

    broker.shutdown();
}

#[tokio::test]
async fn test_mount_released_when_device_leaves() {
    let mut broker = start_broker().await;
    let files = fixture_files();
    let device = connect_device(&broker, &files).await;
    let client = connect(&broker, "viewer", "view").await;

    device.close().await;
    let state = broker.state().clone();
    wait_until(|| state.mount_points().unwrap().is_empty()).await;

    let gone = client.call("test/dev/sensor", "value", None).await;
    assert_eq!(remote_code(gone), ErrorCode::PathNotFound);

    let _again = connect_device(&broker, &files).await;
    let value = client.call("test/dev/sensor", "value", None).await.unwrap();
    assert_eq!(value, RpcValue::from(42));

    broker.shutdown();
}

#[tokio::test]
async fn test_text_protocol_clients() {
    let mut broker = start_broker().await;
    let files = fixture_files();
    let _device = connect_device(&broker, &files).await;

    for protocol in [ProtocolType::Cpon, ProtocolType::JsonRpc] {
        let client = ClientConnection::connect(
            config(&broker, "viewer", "view").with_protocol(protocol),
        )
        .await
        .unwrap();
        let value = client.call("test/dev/sensor", "value", None).await.unwrap();
        assert_eq!(value.as_int(), Some(42), "protocol {:?}", protocol);
        client.close().await;
    }

    broker.shutdown();
}

#[tokio::test]
async fn test_broker_app_lists_clients_and_mounts() {
    let mut broker = start_broker().await;
    let files = fixture_files();
    let device = connect_device(&broker, &files).await;
    let admin = connect(&broker, "admin", "admin!").await;

    let ids = admin.call(".broker/app", "clientIds", None).await.unwrap();
    let ids: Vec<i64> = ids
        .as_list()
        .unwrap()
        .iter()
        .filter_map(RpcValue::as_int)
        .collect();
    assert_eq!(ids, vec![device.client_id(), admin.client_id()]);

    let mounts = admin.call(".broker/app", "mountPoints", None).await.unwrap();
    assert_eq!(
        mounts.get(MOUNT).and_then(RpcValue::as_int),
        Some(device.client_id())
    );

    broker.shutdown();
}
