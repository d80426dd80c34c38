//! Shared helpers for broker integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use stuartmq::auth::{AllowAll, AuthService};
use stuartmq::broker::Broker;
use stuartmq::cluster::Coordinator;
use stuartmq::codec::{Decoder, Encoder};
use stuartmq::config::{Config, ListenerConfig, ListenerProtocol};
use stuartmq::metrics::Metrics;
use stuartmq::protocol::{ConnAck, Connect, Packet, Publish, QoS, SubAckReturnCode, Subscribe, Subscription};

pub async fn start_broker(
    coordinator: Arc<dyn Coordinator>,
    configure: impl FnOnce(&mut Config),
) -> (Arc<Broker>, SocketAddr) {
    start_broker_with_auth(coordinator, Arc::new(AllowAll), configure).await
}

pub async fn start_broker_with_auth(
    coordinator: Arc<dyn Coordinator>,
    auth: Arc<dyn AuthService>,
    configure: impl FnOnce(&mut Config),
) -> (Arc<Broker>, SocketAddr) {
    let mut config = Config::default();
    config.listeners = vec![ListenerConfig::tcp("127.0.0.1:0".parse().unwrap())];
    configure(&mut config);

    let broker = Broker::new(config, coordinator, auth, Arc::new(Metrics::new().unwrap()));
    broker.start().await.unwrap();
    let addr = broker.local_addr(ListenerProtocol::Tcp).unwrap();
    (broker, addr)
}

/// Minimal MQTT client over the crate codec
pub struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.expect("Failed to connect"),
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf).expect("Failed to encode");
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("Failed to write");
    }

    /// Next packet, or None on timeout or close
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        loop {
            if let Ok(Some((packet, consumed))) = self.decoder.decode(&self.buf) {
                self.buf.advance(consumed);
                return Some(packet);
            }
            match timeout(wait, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) if n > 0 => continue,
                _ => return None,
            }
        }
    }

    pub async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(Duration::from_secs(5)).await
    }

    pub async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }

    pub async fn expect_silence(&mut self) {
        let packet = self.recv_within(Duration::from_millis(300)).await;
        assert!(packet.is_none(), "unexpected packet {:?}", packet);
    }

    pub async fn mqtt_connect_with(&mut self, connect: Connect) -> ConnAck {
        self.send(&Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }

    pub async fn mqtt_connect(&mut self, client_id: &str, clean_session: bool) -> ConnAck {
        self.mqtt_connect_with(Connect {
            client_id: client_id.to_string(),
            clean_session,
            ..Default::default()
        })
        .await
    }

    pub async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> Vec<SubAckReturnCode> {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                filter: filter.to_string(),
                qos,
            }],
        }))
        .await;
        match self.recv().await {
            Some(Packet::SubAck(ack)) => {
                assert_eq!(ack.packet_id, packet_id);
                ack.return_codes
            }
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    pub async fn publish(&mut self, topic: &str, payload: &'static [u8], qos: QoS, packet_id: Option<u16>, retain: bool) {
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::from_static(payload),
        }))
        .await;
    }
}
