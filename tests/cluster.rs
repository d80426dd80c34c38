//! Two-node tests over an in-process cluster

mod common;

use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;

use common::{start_broker, TestClient};
use stuartmq::cluster::{Coordinator, LocalCluster};
use stuartmq::protocol::{ConnAck, Packet, QoS};

#[tokio::test]
async fn test_publish_reaches_subscriber_on_other_node() {
    let cluster = LocalCluster::new();
    let (n1, addr1) = start_broker(cluster.coordinator("n1"), |_| {}).await;
    let (n2, addr2) = start_broker(cluster.coordinator("n2"), |_| {}).await;

    let mut subscriber = TestClient::connect(addr2).await;
    subscriber.mqtt_connect("remote-sub", true).await;
    subscriber.subscribe(1, "sensors/+/temp", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr1).await;
    publisher.mqtt_connect("local-pub", true).await;
    publisher
        .publish("sensors/k1/temp", b"21.5", QoS::AtLeastOnce, Some(3), false)
        .await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(3)));

    let delivered = subscriber.expect_publish().await;
    assert_eq!(&*delivered.topic, "sensors/k1/temp");
    assert_eq!(delivered.payload, Bytes::from_static(b"21.5"));
    assert_eq!(delivered.qos, QoS::AtLeastOnce);

    n1.shutdown().await;
    n2.shutdown().await;
}

#[tokio::test]
async fn test_retained_message_replicated_to_peers() {
    let cluster = LocalCluster::new();
    let (n1, addr1) = start_broker(cluster.coordinator("n1"), |_| {}).await;
    let (n2, addr2) = start_broker(cluster.coordinator("n2"), |_| {}).await;

    let mut publisher = TestClient::connect(addr1).await;
    publisher.mqtt_connect("retainer", true).await;
    publisher
        .publish("config/mode", b"eco", QoS::AtLeastOnce, Some(1), true)
        .await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(1)));

    let mut late = TestClient::connect(addr2).await;
    late.mqtt_connect("late", true).await;
    // Replication to the peer is asynchronous
    let mut retained = None;
    for packet_id in 1..20 {
        late.subscribe(packet_id, "config/#", QoS::AtMostOnce).await;
        if let Some(Packet::Publish(p)) = late.recv_within(Duration::from_millis(100)).await {
            retained = Some(p);
            break;
        }
    }
    let retained = retained.expect("retained message never reached n2");
    assert!(retained.retain);
    assert_eq!(retained.payload, Bytes::from_static(b"eco"));

    n1.shutdown().await;
    n2.shutdown().await;
}

#[tokio::test]
async fn test_takeover_moves_session_between_nodes() {
    let cluster = LocalCluster::new();
    let (n1, addr1) = start_broker(cluster.coordinator("n1"), |_| {}).await;
    let (n2, addr2) = start_broker(cluster.coordinator("n2"), |_| {}).await;

    let mut first = TestClient::connect(addr1).await;
    assert_eq!(first.mqtt_connect("roamer", false).await, ConnAck::accepted(false));
    first.subscribe(1, "roam/#", QoS::AtLeastOnce).await;
    first.send(&Packet::Disconnect).await;
    assert_eq!(first.recv().await, None);

    // Queued on n1 while the client is offline
    let mut publisher = TestClient::connect(addr1).await;
    publisher.mqtt_connect("roam-pub", true).await;
    publisher.publish("roam/a", b"queued", QoS::AtLeastOnce, Some(1), false).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(1)));

    let mut second = TestClient::connect(addr2).await;
    assert_eq!(second.mqtt_connect("roamer", false).await, ConnAck::accepted(true));
    let queued = second.expect_publish().await;
    assert_eq!(queued.payload, Bytes::from_static(b"queued"));
    second.send(&Packet::PubAck(queued.packet_id.unwrap())).await;

    // The restored subscription now routes to n2
    publisher.publish("roam/b", b"live", QoS::AtLeastOnce, Some(2), false).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(2)));
    let live = second.expect_publish().await;
    assert_eq!(live.payload, Bytes::from_static(b"live"));

    assert_eq!(n1.session_count(), 1);
    n1.shutdown().await;
    n2.shutdown().await;
}

#[tokio::test]
async fn test_takeover_closes_connection_on_other_node() {
    let cluster = LocalCluster::new();
    let (n1, addr1) = start_broker(cluster.coordinator("n1"), |_| {}).await;
    let (n2, addr2) = start_broker(cluster.coordinator("n2"), |_| {}).await;

    let mut first = TestClient::connect(addr1).await;
    first.mqtt_connect("dup-id", true).await;

    let mut second = TestClient::connect(addr2).await;
    assert_eq!(second.mqtt_connect("dup-id", true).await, ConnAck::accepted(false));
    assert_eq!(first.recv().await, None);
    assert_eq!(n1.connection_count(), 0);

    n1.shutdown().await;
    n2.shutdown().await;
}

#[tokio::test]
async fn test_stopped_node_routes_excluded() {
    let cluster = LocalCluster::new();
    let coordinator = cluster.coordinator("n1");
    let (n1, addr1) = start_broker(coordinator.clone(), |_| {}).await;
    let (n2, addr2) = start_broker(cluster.coordinator("n2"), |_| {}).await;

    let mut subscriber = TestClient::connect(addr2).await;
    subscriber.mqtt_connect("doomed-sub", false).await;
    subscriber.subscribe(1, "alerts/#", QoS::AtLeastOnce).await;
    assert_eq!(coordinator.match_routes("alerts/fire").len(), 1);

    cluster.fail_node("n2");
    assert!(coordinator.match_routes("alerts/fire").is_empty());
    assert_eq!(coordinator.live_nodes(), vec!["n1".to_string()]);

    // The session cannot be transferred from a dead node
    let mut resumed = TestClient::connect(addr1).await;
    assert_eq!(resumed.mqtt_connect("doomed-sub", false).await, ConnAck::accepted(false));

    n1.shutdown().await;
    n2.shutdown().await;
}
