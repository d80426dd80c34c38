//! Integration tests for a single StuartMQ node
//!
//! Each test starts a broker on an ephemeral port and drives it over TCP
//! with the crate's own codec.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;

use common::TestClient;
use stuartmq::cluster::LocalCoordinator;
use stuartmq::config::Config;
use stuartmq::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAckReturnCode, Will,
};

async fn start_broker(
    configure: impl FnOnce(&mut Config),
) -> (Arc<stuartmq::Broker>, std::net::SocketAddr) {
    common::start_broker(LocalCoordinator::standalone("test-node"), configure).await
}

#[tokio::test]
async fn test_connect_and_ping() {
    let (broker, addr) = start_broker(|_| {}).await;
    let mut client = TestClient::connect(addr).await;

    let ack = client.mqtt_connect("pinger", true).await;
    assert_eq!(ack, ConnAck::accepted(false));

    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));
    assert_eq!(broker.connection_count(), 1);

    client.send(&Packet::Disconnect).await;
    assert_eq!(client.recv().await, None);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_unsupported_protocol_level_refused() {
    let (broker, addr) = start_broker(|_| {}).await;
    let mut client = TestClient::connect(addr).await;

    // CONNECT, protocol "MQTT" level 5, clean session, keep alive 60, id "a"
    client
        .send_raw(&[
            0x10, 0x0d, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x3c, 0x00, 0x01,
            b'a',
        ])
        .await;
    assert_eq!(
        client.recv().await,
        Some(Packet::ConnAck(ConnAck::rejected(
            ConnectReturnCode::UnacceptableProtocolVersion
        )))
    );
    assert_eq!(client.recv().await, None);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_empty_client_id_needs_clean_session() {
    let (broker, addr) = start_broker(|_| {}).await;

    let mut persistent = TestClient::connect(addr).await;
    let ack = persistent.mqtt_connect("", false).await;
    assert_eq!(ack.return_code, ConnectReturnCode::IdentifierRejected);

    let mut clean = TestClient::connect(addr).await;
    assert_eq!(clean.mqtt_connect("", true).await, ConnAck::accepted(false));
    broker.shutdown().await;
}

#[tokio::test]
async fn test_takeover_closes_first_connection_and_publishes_will() {
    let (broker, addr) = start_broker(|_| {}).await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("watcher", true).await;
    watcher.subscribe(1, "will/#", QoS::AtMostOnce).await;

    let mut first = TestClient::connect(addr).await;
    let ack = first
        .mqtt_connect_with(Connect {
            client_id: "x".to_string(),
            will: Some(Will {
                topic: "will/x".to_string(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
            ..Default::default()
        })
        .await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);

    let mut second = TestClient::connect(addr).await;
    assert_eq!(second.mqtt_connect("x", true).await.return_code, ConnectReturnCode::Accepted);

    assert_eq!(first.recv().await, None);
    let will = watcher.expect_publish().await;
    assert_eq!(&*will.topic, "will/x");
    assert_eq!(will.payload, Bytes::from_static(b"gone"));
    assert_eq!(broker.connection_count(), 2);
    broker.shutdown().await;
}

async fn connect_clean(client: &mut TestClient, client_id: &str) {
    client
        .send(&Packet::Connect(Box::new(Connect {
            client_id: client_id.to_string(),
            clean_session: true,
            ..Default::default()
        })))
        .await;
    // Either accepted or refused; a kicked loser may also see its accepted
    // CONNACK followed by a close
    assert!(matches!(client.recv().await, Some(Packet::ConnAck(_)) | None));
}

async fn is_served(client: &mut TestClient) -> bool {
    client.send(&Packet::PingReq).await;
    client.recv_within(Duration::from_secs(1)).await == Some(Packet::PingResp)
}

#[tokio::test]
async fn test_concurrent_connects_leave_one_connection() {
    let (broker, addr) = start_broker(|_| {}).await;

    for round in 0..20 {
        let client_id = format!("racer-{}", round);
        let mut a = TestClient::connect(addr).await;
        let mut b = TestClient::connect(addr).await;

        tokio::join!(connect_clean(&mut a, &client_id), connect_clean(&mut b, &client_id));

        let (a_live, b_live) = (is_served(&mut a).await, is_served(&mut b).await);
        assert!(a_live ^ b_live, "round {}: a={} b={}", round, a_live, b_live);
        assert_eq!(broker.connection_count(), round + 1);
    }
    broker.shutdown().await;
}

#[tokio::test]
async fn test_graceful_disconnect_suppresses_will() {
    let (broker, addr) = start_broker(|_| {}).await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("watcher", true).await;
    watcher.subscribe(1, "will/#", QoS::AtMostOnce).await;

    let mut client = TestClient::connect(addr).await;
    client
        .mqtt_connect_with(Connect {
            client_id: "polite".to_string(),
            will: Some(Will {
                topic: "will/polite".to_string(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
            ..Default::default()
        })
        .await;
    client.send(&Packet::Disconnect).await;

    watcher.expect_silence().await;
    broker.shutdown().await;
}

#[tokio::test]
async fn test_qos1_duplicate_routed_once() {
    let (broker, addr) = start_broker(|_| {}).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("sub", true).await;
    assert_eq!(
        subscriber.subscribe(1, "q1/t", QoS::AtLeastOnce).await,
        vec![SubAckReturnCode::Granted(QoS::AtLeastOnce)]
    );

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;
    publisher.publish("q1/t", b"once", QoS::AtLeastOnce, Some(7), false).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(7)));

    publisher
        .send(&Packet::Publish(Publish {
            dup: true,
            qos: QoS::AtLeastOnce,
            topic: Arc::from("q1/t"),
            packet_id: Some(7),
            payload: Bytes::from_static(b"once"),
            ..Default::default()
        }))
        .await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(7)));

    let delivered = subscriber.expect_publish().await;
    assert_eq!(delivered.qos, QoS::AtLeastOnce);
    let packet_id = delivered.packet_id.unwrap();
    subscriber.send(&Packet::PubAck(packet_id)).await;
    subscriber.expect_silence().await;
    broker.shutdown().await;
}

#[tokio::test]
async fn test_qos1_reused_packet_id_with_dup_is_routed() {
    let (broker, addr) = start_broker(|_| {}).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("reuse-sub", true).await;
    subscriber.subscribe(1, "reuse/t", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("reuse-pub", false).await;
    publisher.publish("reuse/t", b"A", QoS::AtLeastOnce, Some(7), false).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(7)));
    assert_eq!(subscriber.expect_publish().await.payload, Bytes::from_static(b"A"));
    drop(publisher);

    // Id 7 is free again; the first copy of "B" never arrived
    let mut publisher = TestClient::connect(addr).await;
    assert_eq!(publisher.mqtt_connect("reuse-pub", false).await, ConnAck::accepted(true));
    publisher
        .send(&Packet::Publish(Publish {
            dup: true,
            qos: QoS::AtLeastOnce,
            topic: Arc::from("reuse/t"),
            packet_id: Some(7),
            payload: Bytes::from_static(b"B"),
            ..Default::default()
        }))
        .await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(7)));
    assert_eq!(subscriber.expect_publish().await.payload, Bytes::from_static(b"B"));
    broker.shutdown().await;
}

#[tokio::test]
async fn test_qos2_delivered_exactly_once_after_pubrel() {
    let (broker, addr) = start_broker(|_| {}).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("sub2", true).await;
    subscriber.subscribe(1, "q2/#", QoS::ExactlyOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub2", true).await;
    publisher.publish("q2/t", b"exactly", QoS::ExactlyOnce, Some(5), false).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubRec(5)));
    publisher.publish("q2/t", b"exactly", QoS::ExactlyOnce, Some(5), false).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubRec(5)));

    // Nothing is routed before the release
    subscriber.expect_silence().await;

    publisher.send(&Packet::PubRel(5)).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubComp(5)));

    let delivered = subscriber.expect_publish().await;
    assert_eq!(delivered.qos, QoS::ExactlyOnce);
    let packet_id = delivered.packet_id.unwrap();
    subscriber.send(&Packet::PubRec(packet_id)).await;
    assert_eq!(subscriber.recv().await, Some(Packet::PubRel(packet_id)));
    subscriber.send(&Packet::PubComp(packet_id)).await;
    subscriber.expect_silence().await;
    broker.shutdown().await;
}

#[tokio::test]
async fn test_orphan_pubrel_answered() {
    let (broker, addr) = start_broker(|_| {}).await;
    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("orphan", true).await;

    client.send(&Packet::PubRel(42)).await;
    assert_eq!(client.recv().await, Some(Packet::PubComp(42)));

    // The connection stays usable
    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));
    broker.shutdown().await;
}

#[tokio::test]
async fn test_retained_set_and_clear() {
    let (broker, addr) = start_broker(|_| {}).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("retainer", true).await;
    publisher.publish("status/a", b"up", QoS::AtLeastOnce, Some(1), true).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(1)));

    let mut late = TestClient::connect(addr).await;
    late.mqtt_connect("late", true).await;
    late.subscribe(1, "status/+", QoS::AtMostOnce).await;
    let retained = late.expect_publish().await;
    assert!(retained.retain);
    assert_eq!(retained.qos, QoS::AtMostOnce);
    assert_eq!(retained.payload, Bytes::from_static(b"up"));

    publisher.publish("status/a", b"", QoS::AtMostOnce, None, true).await;
    // The clearing publish itself reaches existing subscribers
    let cleared = late.expect_publish().await;
    assert!(cleared.payload.is_empty());

    let mut later = TestClient::connect(addr).await;
    later.mqtt_connect("later", true).await;
    later.subscribe(1, "status/+", QoS::AtMostOnce).await;
    later.expect_silence().await;
    assert_eq!(broker.retained_count(), 0);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_persistent_session_replays_with_dup() {
    let (broker, addr) = start_broker(|_| {}).await;

    let mut subscriber = TestClient::connect(addr).await;
    assert_eq!(subscriber.mqtt_connect("durable", false).await, ConnAck::accepted(false));
    subscriber.subscribe(1, "d/t", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("dpub", true).await;
    publisher.publish("d/t", b"first", QoS::AtLeastOnce, Some(1), false).await;
    publisher.recv().await;

    // Received but never acknowledged
    let first = subscriber.expect_publish().await;
    assert!(!first.dup);
    drop(subscriber);
    tokio::time::sleep(Duration::from_millis(100)).await;

    publisher.publish("d/t", b"second", QoS::AtLeastOnce, Some(2), false).await;
    publisher.recv().await;

    let mut resumed = TestClient::connect(addr).await;
    assert_eq!(resumed.mqtt_connect("durable", false).await, ConnAck::accepted(true));

    let replayed = resumed.expect_publish().await;
    assert!(replayed.dup);
    assert_eq!(replayed.packet_id, first.packet_id);
    assert_eq!(replayed.payload, Bytes::from_static(b"first"));

    let queued = resumed.expect_publish().await;
    assert!(!queued.dup);
    assert_eq!(queued.payload, Bytes::from_static(b"second"));
    broker.shutdown().await;
}

#[tokio::test]
async fn test_clean_session_discards_state() {
    let (broker, addr) = start_broker(|_| {}).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("fresh", false).await;
    client.subscribe(1, "f/t", QoS::AtLeastOnce).await;
    client.send(&Packet::Disconnect).await;
    assert_eq!(client.recv().await, None);

    let mut again = TestClient::connect(addr).await;
    assert_eq!(again.mqtt_connect("fresh", true).await, ConnAck::accepted(false));

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("fpub", true).await;
    publisher.publish("f/t", b"nobody", QoS::AtLeastOnce, Some(1), false).await;
    publisher.recv().await;
    again.expect_silence().await;
    broker.shutdown().await;
}

#[tokio::test]
async fn test_listener_admission_cap() {
    let (broker, addr) = start_broker(|config| config.listeners[0].max_connections = 1).await;

    let mut first = TestClient::connect(addr).await;
    first.mqtt_connect("only", true).await;

    let mut second = TestClient::connect(addr).await;
    second
        .send(&Packet::Connect(Box::new(Connect {
            client_id: "extra".to_string(),
            ..Default::default()
        })))
        .await;
    assert_eq!(second.recv().await, None);

    first.send(&Packet::PingReq).await;
    assert_eq!(first.recv().await, Some(Packet::PingResp));
    broker.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_publishes_wills() {
    let (broker, addr) = start_broker(|_| {}).await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("watcher", true).await;
    watcher.subscribe(1, "will/#", QoS::AtMostOnce).await;

    let mut client = TestClient::connect(addr).await;
    client
        .mqtt_connect_with(Connect {
            client_id: "doomed".to_string(),
            will: Some(Will {
                topic: "will/doomed".to_string(),
                payload: Bytes::from_static(b"bye"),
                qos: QoS::AtMostOnce,
                retain: true,
            }),
            ..Default::default()
        })
        .await;

    broker.shutdown().await;
    assert_eq!(client.recv().await, None);
    assert_eq!(broker.connection_count(), 0);
    assert_eq!(broker.retained_count(), 1);
}

#[tokio::test]
async fn test_unacked_publish_retransmitted_then_abandoned() {
    let (broker, addr) = start_broker(|config| {
        config.limits.retry_interval = Duration::from_millis(200);
        config.limits.max_retries = 2;
    })
    .await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("slow-acker", true).await;
    subscriber.subscribe(1, "retry/t", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("retry-pub", true).await;
    publisher.publish("retry/t", b"again", QoS::AtLeastOnce, Some(1), false).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(1)));

    let original = subscriber.expect_publish().await;
    assert!(!original.dup);
    for _ in 0..2 {
        let resent = subscriber.expect_publish().await;
        assert!(resent.dup);
        assert_eq!(resent.packet_id, original.packet_id);
        assert_eq!(resent.payload, Bytes::from_static(b"again"));
    }

    // Given up after max_retries; the connection itself stays up
    assert_eq!(subscriber.recv_within(Duration::from_secs(1)).await, None);
    subscriber.send(&Packet::PingReq).await;
    assert_eq!(subscriber.recv().await, Some(Packet::PingResp));
    broker.shutdown().await;
}

#[tokio::test]
async fn test_keep_alive_expiry_publishes_will() {
    let (broker, addr) = start_broker(|_| {}).await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("idle-watcher", true).await;
    watcher.subscribe(1, "will/idle", QoS::AtMostOnce).await;

    let mut idle = TestClient::connect(addr).await;
    idle.mqtt_connect_with(Connect {
        client_id: "idler".to_string(),
        keep_alive: 1,
        will: Some(Will {
            topic: "will/idle".to_string(),
            payload: Bytes::from_static(b"timed out"),
            qos: QoS::AtMostOnce,
            retain: false,
        }),
        ..Default::default()
    })
    .await;

    // Closed after 1.5 keep-alive periods of silence
    let started = tokio::time::Instant::now();
    assert_eq!(idle.recv_within(Duration::from_secs(5)).await, None);
    assert!(started.elapsed() >= Duration::from_millis(1000));

    let will = watcher.expect_publish().await;
    assert_eq!(&*will.topic, "will/idle");
    assert_eq!(will.payload, Bytes::from_static(b"timed out"));
    assert_eq!(broker.connection_count(), 1);
    broker.shutdown().await;
}
