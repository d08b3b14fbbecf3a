//! End-to-end tests for the upstream pipeline
//!
//! Frames go in through the service's frame channel and come out as
//! messages recorded by the simulated broker.

use std::time::Duration;

use beacon_protocol::DecodedFrame;
use beacon_sim::{FrameBuilder, PacketId, SimBroker, SimResolver};
use beacon_upstream::{
    now_millis, ConnectionState, UpstreamConfig, UpstreamEvent, UpstreamService, UpstreamStatus,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

const ID_A: PacketId = [0x0A, 0x0A, 0x0A, 0x01];
const ID_B: PacketId = [0x0B, 0x0B, 0x0B, 0x02];
const BRIDGE: [u8; 6] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];

// ============================================================================
// Helpers
// ============================================================================

struct Rig {
    service: UpstreamService<SimResolver>,
    broker: SimBroker,
    resolver: SimResolver,
    events: mpsc::Receiver<UpstreamEvent>,
    frames: mpsc::Sender<DecodedFrame>,
}

/// Config with short periods so tests run in real time
fn fast_config() -> UpstreamConfig {
    let mut config = UpstreamConfig::new("acct", "gw-1");
    config.publish_interval_ms = 20;
    config.publish_jitter_ms = 0;
    config.delivery_interval_ms = 5;
    config.restart_grace_ms = 10;
    config.pacing_interval_secs = 1;
    config
}

/// Service with a prepared token that has not been started yet
fn unstarted(
    config: UpstreamConfig,
    resolver: SimResolver,
) -> (Rig, mpsc::Receiver<DecodedFrame>) {
    let broker = SimBroker::new();
    let (events_tx, events) = mpsc::channel(1024);
    let (frames, frames_rx) = mpsc::channel(256);
    let service =
        UpstreamService::new(config, broker.transport(), resolver.clone(), events_tx).unwrap();
    let rig = Rig {
        service,
        broker,
        resolver,
        events,
        frames,
    };
    (rig, frames_rx)
}

async fn rig_with(config: UpstreamConfig, resolver: SimResolver) -> Rig {
    let (mut rig, frames_rx) = unstarted(config, resolver);
    rig.service.prepare("token").await.unwrap();
    rig.service.start(frames_rx).await.unwrap();
    rig
}

async fn rig() -> Rig {
    rig_with(fast_config(), SimResolver::new()).await
}

/// Wait for the first event matching `pred`, skipping others
async fn wait_for(
    events: &mut mpsc::Receiver<UpstreamEvent>,
    mut pred: impl FnMut(&UpstreamEvent) -> bool,
) -> UpstreamEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_data_publish(events: &mut mpsc::Receiver<UpstreamEvent>) {
    wait_for(events, |e| {
        matches!(e, UpstreamEvent::MessagePublished { topic } if topic.starts_with("data/"))
    })
    .await;
}

fn data_messages(broker: &SimBroker) -> Vec<Value> {
    broker
        .published_on("data/")
        .iter()
        .map(|m| serde_json::from_str(&m.message).unwrap())
        .collect()
}

fn all_packets(broker: &SimBroker) -> Vec<Value> {
    data_messages(broker)
        .into_iter()
        .flat_map(|m| m["packets"].as_array().cloned().unwrap_or_default())
        .collect()
}

// ============================================================================
// Connection
// ============================================================================

#[tokio::test]
async fn test_capabilities_published_first() {
    let mut rig = rig().await;
    wait_for(&mut rig.events, |e| {
        matches!(e, UpstreamEvent::MessagePublished { .. })
    })
    .await;

    let published = rig.broker.published();
    assert_eq!(published[0].topic, "status/acct/gw-1");
    let capabilities: Value = serde_json::from_str(&published[0].message).unwrap();
    assert_eq!(capabilities["gatewayType"], "mobile");
    assert_eq!(capabilities["tagMetadataCouplingSupported"], true);
    assert_eq!(capabilities["gatewayConf"]["additional"]["pacingPeriod"], 1);

    let connect = &rig.broker.connects()[0];
    assert_eq!(connect.client_id, "gw-1");
    assert_eq!(connect.username, "acct");
    assert_eq!(connect.token, "token");
}

#[tokio::test]
async fn test_token_change_restarts_connection() {
    let mut rig = rig().await;
    wait_for(&mut rig.events, |e| {
        matches!(e, UpstreamEvent::ConnectionStateChanged(ConnectionState::Connected))
    })
    .await;

    rig.service.set_connection_token("token-2").await.unwrap();
    wait_for(&mut rig.events, |e| {
        matches!(e, UpstreamEvent::ConnectionStateChanged(ConnectionState::Disconnecting))
    })
    .await;
    wait_for(&mut rig.events, |e| {
        matches!(e, UpstreamEvent::ConnectionStateChanged(ConnectionState::Connected))
    })
    .await;

    let tokens: Vec<String> = rig.broker.connects().into_iter().map(|c| c.token).collect();
    assert_eq!(tokens, vec!["token".to_string(), "token-2".to_string()]);
    assert!(rig.broker.is_connected());
}

#[tokio::test]
async fn test_stop_reports_inactive() {
    let mut rig = rig().await;
    wait_for(&mut rig.events, |e| {
        matches!(e, UpstreamEvent::ConnectionStateChanged(ConnectionState::Connected))
    })
    .await;

    rig.service.stop().await;
    wait_for(&mut rig.events, |e| {
        matches!(e, UpstreamEvent::ListeningChanged(false))
    })
    .await;
    wait_for(&mut rig.events, |e| {
        matches!(e, UpstreamEvent::StatusChanged(UpstreamStatus::Inactive))
    })
    .await;
    assert!(!rig.service.is_listening());
    assert!(!rig.broker.is_connected());
}

#[tokio::test]
async fn test_start_after_token_change_begins_intake() {
    let (mut rig, frames_rx) = unstarted(fast_config(), SimResolver::new());
    rig.service.prepare("token").await.unwrap();
    rig.service.set_connection_token("token-2").await.unwrap();
    assert_eq!(
        rig.service.connection_state().await.unwrap(),
        ConnectionState::Connected
    );

    rig.service.start(frames_rx).await.unwrap();
    assert!(rig.service.is_listening());

    let tag = FrameBuilder::random();
    rig.frames.send(tag.side_info(ID_A, BRIDGE, 1, 180)).await.unwrap();
    rig.frames.send(tag.pixel(ID_A)).await.unwrap();
    wait_for_data_publish(&mut rig.events).await;

    assert_eq!(all_packets(&rig.broker).len(), 1);
    let tokens: Vec<String> = rig.broker.connects().into_iter().map(|c| c.token).collect();
    assert_eq!(tokens, vec!["token-2".to_string()]);
}

#[tokio::test]
async fn test_stop_quiesces_pipeline_before_disconnect() {
    let mut rig = rig().await;
    let tag = FrameBuilder::random();
    for i in 0..50u8 {
        let id = [0x0D, 0x0D, 0x0D, i];
        rig.frames.send(tag.side_info(id, BRIDGE, 1, 180)).await.unwrap();
        rig.frames.send(tag.pixel(id)).await.unwrap();
    }
    wait_for(&mut rig.events, |e| matches!(e, UpstreamEvent::BatchQueued { .. })).await;

    rig.service.stop().await;
    // Ordered after the gateway has handled the stop
    rig.service.connection_state().await.unwrap();
    while rig.events.try_recv().is_ok() {}

    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = rig.events.try_recv() {
        assert!(
            !matches!(event, UpstreamEvent::BatchQueued { .. }),
            "batch queued after stop: {event:?}"
        );
    }
}

// ============================================================================
// Data path
// ============================================================================

#[tokio::test]
async fn test_side_info_glues_onto_tag_frame() {
    let mut rig = rig().await;
    let tag = FrameBuilder::random().rssi(-70);
    let pixel = tag.pixel(ID_A);
    rig.frames.send(tag.side_info(ID_A, BRIDGE, 3, 200)).await.unwrap();
    rig.frames.send(pixel.clone()).await.unwrap();

    wait_for_data_publish(&mut rig.events).await;
    let packets = all_packets(&rig.broker);
    assert_eq!(packets.len(), 1);
    let record = &packets[0];
    assert_eq!(record["payload"], pixel.payload_hex());
    assert_eq!(record["bridgeId"], "010203040506");
    assert_eq!(record["nfpkt"], 3);
    assert_eq!(record["rssi"], 200);
    assert_eq!(record["sequenceId"], 1);

    let envelope = &data_messages(&rig.broker)[0];
    assert_eq!(envelope["gatewayId"], "gw-1");
    assert_eq!(envelope["gatewayType"], "mobile");
}

#[tokio::test]
async fn test_sequence_ids_increase_across_batches() {
    let mut rig = rig().await;
    let bridge = FrameBuilder::random().rssi(-40);

    for _ in 0..2 {
        rig.frames.send(bridge.heartbeat(BRIDGE)).await.unwrap();
    }
    wait_for(&mut rig.events, |e| {
        matches!(e, UpstreamEvent::BridgeDiscovered { bridge_id, .. } if bridge_id == "010203040506")
    })
    .await;
    while all_packets(&rig.broker).len() < 2 {
        wait_for_data_publish(&mut rig.events).await;
    }

    rig.frames.send(bridge.combined(ID_B)).await.unwrap();
    while all_packets(&rig.broker).len() < 3 {
        wait_for_data_publish(&mut rig.events).await;
    }

    let ids: Vec<i64> = all_packets(&rig.broker)
        .iter()
        .map(|p| p["sequenceId"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    let last = all_packets(&rig.broker).pop().unwrap();
    assert_eq!(last["aliasBridgeId"], bridge.source_id().hyphenated().to_string().to_uppercase());
    assert!(last.get("bridgeId").is_none());
}

#[tokio::test]
async fn test_uncoupled_tag_frames_are_paced() {
    let mut config = fast_config();
    config.coupling_lifetime_ms = 1;
    let mut rig = rig_with(config, SimResolver::new()).await;

    // Stamped ahead so the record sits inside the first pacing window
    let tag = FrameBuilder::random().at(now_millis() + 300.0);
    let pixel = tag.pixel(ID_A);
    rig.frames.send(pixel.clone()).await.unwrap();

    wait_for_data_publish(&mut rig.events).await;
    let packets = all_packets(&rig.broker);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0]["payload"], pixel.payload_hex());
    assert_eq!(packets[0]["nfpkt"], 1);
    assert!(packets[0].get("bridgeId").is_none());
}

#[tokio::test]
async fn test_payload_logging_does_not_displace_data() {
    let mut config = fast_config();
    config.publish_interval_ms = 40;
    config.delivery_interval_ms = 20;
    config.max_queued_messages = 8;
    config.payload_logging_enabled = true;
    config.payload_log_interval_ms = 20;
    let mut rig = rig_with(config, SimResolver::new()).await;

    let tag = FrameBuilder::random();
    for i in 0..150u16 {
        let id = [0x0C, 0x0C, (i >> 8) as u8, i as u8];
        rig.frames.send(tag.side_info(id, BRIDGE, 1, 180)).await.unwrap();
        rig.frames.send(tag.pixel(id)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        while rig.events.try_recv().is_ok() {}
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let ids: Vec<i64> = all_packets(&rig.broker)
        .iter()
        .map(|p| p["sequenceId"].as_i64().unwrap())
        .collect();
    assert!(!ids.is_empty());
    let expected: Vec<i64> = (1..=ids.len() as i64).collect();
    assert_eq!(ids, expected);

    let logs = rig
        .broker
        .published_on("status/")
        .iter()
        .filter(|m| m.message.contains("gatewayLogs"))
        .count();
    assert!(logs > 0);
}

// ============================================================================
// Resolution
// ============================================================================

#[tokio::test]
async fn test_one_resolve_in_flight_per_source() {
    let resolver = SimResolver::new().with_delay(Duration::from_millis(200));
    let mut rig = rig_with(fast_config(), resolver).await;
    let tag = FrameBuilder::random();

    rig.frames.send(tag.clone().rssi(-50).at(1_000.0).pixel(ID_A)).await.unwrap();
    rig.frames.send(tag.clone().rssi(-40).at(2_000.0).pixel(ID_B)).await.unwrap();

    let resolved = wait_for(&mut rig.events, |e| {
        matches!(e, UpstreamEvent::IdentityResolved { .. })
    })
    .await;
    match resolved {
        UpstreamEvent::IdentityResolved { source_id, identity } => {
            assert_eq!(source_id, tag.source_id());
            assert_eq!(identity.external_id, "tag-0A0A0A01");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let mut rssi = Vec::new();
    while rssi.len() < 2 {
        if let UpstreamEvent::PixelRssi { external_id, rssi: value } =
            wait_for(&mut rig.events, |e| matches!(e, UpstreamEvent::PixelRssi { .. })).await
        {
            assert_eq!(external_id, "tag-0A0A0A01");
            rssi.push(value);
        }
    }
    assert_eq!(rssi, vec![-50, -40]);
    assert_eq!(rig.resolver.call_count(), 1);

    let request = &rig.resolver.requests()[0];
    assert_eq!(request.gateway_id, "gw-1");
    assert_eq!(request.packets.len(), 1);
}

#[tokio::test]
async fn test_denied_source_is_not_resolved_again() {
    let mut rig = rig().await;
    rig.resolver.deny("0A0A0A01");
    let tag = FrameBuilder::random();

    rig.frames.send(tag.pixel(ID_A)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    rig.frames.send(tag.pixel(ID_B)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(rig.resolver.call_count(), 1);
    while let Ok(event) = rig.events.try_recv() {
        assert!(!event.is_resolution(), "unexpected event: {event:?}");
    }
}

#[tokio::test]
async fn test_unavailable_resolver_is_retried() {
    let mut rig = rig().await;
    rig.resolver.unavailable("0A0A0A01", "offline");
    let tag = FrameBuilder::random();

    rig.frames.send(tag.pixel(ID_A)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    rig.frames.send(tag.pixel(ID_B)).await.unwrap();

    let resolved = wait_for(&mut rig.events, |e| {
        matches!(e, UpstreamEvent::IdentityResolved { .. })
    })
    .await;
    match resolved {
        UpstreamEvent::IdentityResolved { identity, .. } => {
            assert_eq!(identity.external_id, "tag-0B0B0B02");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(rig.resolver.call_count(), 2);
}
