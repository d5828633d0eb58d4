//! End-to-end tests of the bridge over a real TCP data source.

mod common;

use std::time::Duration;

use bg_protocol::{SourceHeartbeat, SourceMessage};
use bg_test_utils::{MockSourceServer, minutes_ago, now_ms, reading_record};
use bridge::config::BridgeConfig;
use bridge::stats::keys;
use bridge::tcp_source::TcpSource;
use bridge::{BridgeHandle, ConnectionState, spawn_bridge};
use common::{RecordingStore, counter, eventually};

const WAIT: Duration = Duration::from_secs(3);
const CLIENT_ID: &str = "bridge-under-test";

fn fast_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.connection.reconnect_delay = Duration::from_millis(100);
    config.connection.fatal_reconnect_delay = Duration::from_millis(200);
    config
}

async fn bridge_on(server: &MockSourceServer) -> (BridgeHandle, RecordingStore) {
    let store = RecordingStore::new();
    let source = TcpSource::new(server.local_addr().to_string(), CLIENT_ID);
    let (handle, _task) = spawn_bridge(fast_config(), source, store.clone());
    assert!(server.wait_for_registrations(1, WAIT).await, "never registered");
    (handle, store)
}

#[tokio::test]
async fn registers_and_forwards_pushed_readings() {
    let server = MockSourceServer::start().await.unwrap();
    let (handle, store) = bridge_on(&server).await;

    assert_eq!(server.registrations(), vec![CLIENT_ID.to_owned()]);
    assert!(eventually(WAIT, || handle.is_connected()).await);

    let t = minutes_ago(1);
    assert_eq!(server.push(SourceMessage::BgData(reading_record(131.0, t))), 1);

    assert!(eventually(WAIT, || store.values().len() == 1).await);
    assert_eq!(store.values()[0].timestamp, t);
    assert_eq!(store.values()[0].value, 131.0);
}

#[tokio::test]
async fn latest_record_is_requested_after_connect() {
    let server = MockSourceServer::start().await.unwrap();
    let t = minutes_ago(2);
    server.set_latest(reading_record(99.0, t));

    let (handle, store) = bridge_on(&server).await;

    assert!(eventually(WAIT, || server.latest_requests() == 1).await);
    assert!(eventually(WAIT, || store.timestamps() == vec![t]).await);
    assert_eq!(counter(&handle, keys::ACCEPTED), 1);
}

#[tokio::test]
async fn fractional_raw_value_reading_is_forwarded() {
    let server = MockSourceServer::start().await.unwrap();
    let (handle, store) = bridge_on(&server).await;
    assert!(eventually(WAIT, || handle.is_connected()).await);

    let t = minutes_ago(1);
    let mut record = reading_record(127.0, t);
    record.raw_data = Some(serde_json::from_str("145231.5").unwrap());
    server.push(SourceMessage::BgData(record));

    assert!(eventually(WAIT, || store.timestamps() == vec![t]).await);
    assert_eq!(counter(&handle, keys::MALFORMED_RECORDS), 0);
    assert_eq!(counter(&handle, keys::HEARTBEATS_SEEN), 0);
}

#[tokio::test]
async fn explicit_heartbeat_refreshes_liveness() {
    let server = MockSourceServer::start().await.unwrap();
    let (handle, store) = bridge_on(&server).await;
    assert!(eventually(WAIT, || handle.is_connected()).await);

    server.push(SourceMessage::Heartbeat(SourceHeartbeat {
        timestamp: now_ms(),
    }));
    assert!(eventually(WAIT, || counter(&handle, keys::HEARTBEAT_EXPLICIT) == 1).await);
    assert!(handle.link_status().last_heartbeat.is_some());
    assert!(store.values().is_empty());
}

#[tokio::test]
async fn source_hangup_triggers_reconnect() {
    let server = MockSourceServer::start().await.unwrap();
    let (handle, store) = bridge_on(&server).await;
    assert!(eventually(WAIT, || handle.is_connected()).await);

    server.disconnect_all();

    assert!(eventually(WAIT, || counter(&handle, keys::SERVICE_DISCONNECTED) == 1).await);
    assert!(server.wait_for_registrations(2, WAIT).await, "never re-registered");
    assert!(eventually(WAIT, || handle.is_connected()).await);
    assert_eq!(server.connections(), 2);

    let t = minutes_ago(1);
    server.push(SourceMessage::BgData(reading_record(140.0, t)));
    assert!(eventually(WAIT, || store.timestamps() == vec![t]).await);
}

#[tokio::test]
async fn manual_disconnect_unregisters() {
    let server = MockSourceServer::start().await.unwrap();
    let (handle, _store) = bridge_on(&server).await;
    assert!(eventually(WAIT, || handle.is_connected()).await);

    handle.disconnect().await.unwrap();

    assert!(eventually(WAIT, || server.unregistrations() == vec![CLIENT_ID.to_owned()]).await);
    assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
    assert!(!handle.link_status().retry_pending);
}

#[tokio::test]
async fn unreachable_source_exhausts_retries() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let store = RecordingStore::new();
    let source = TcpSource::new(addr.to_string(), CLIENT_ID);
    let (handle, _task) = spawn_bridge(fast_config(), source, store);

    assert!(eventually(WAIT, || handle.link_status().retries_exhausted).await);
    assert!(matches!(handle.connection_state(), ConnectionState::Error(_)));
    assert_eq!(counter(&handle, keys::BIND_FAILURES), 4);
    assert_eq!(counter(&handle, keys::RETRIES_EXHAUSTED), 1);
}
