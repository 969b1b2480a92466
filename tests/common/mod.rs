// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use mqttd::packet::{
    Connack, ConnackCode, Connect, Packet, Publish, QoS, Suback, Subscribe, Unsubscribe, Will,
};
use mqttd::transport::{split, PacketReader, PacketWriter};
use mqttd::{Broker, BrokerConfig, BrokerEvent, Security};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Broker config bound to an ephemeral loopback port with ephemeral storage.
pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        host: [127, 0, 0, 1].into(),
        port: 0,
        ..BrokerConfig::default()
    }
}

pub async fn start_broker() -> (Broker, SocketAddr) {
    start_broker_with(test_config()).await
}

pub async fn start_broker_with(config: BrokerConfig) -> (Broker, SocketAddr) {
    let broker = Broker::new(config).await.expect("Failed to create broker");
    let addr = broker.listen().await.expect("Failed to bind listener");
    (broker, addr)
}

pub async fn start_broker_with_security(
    security: Arc<dyn Security>,
) -> (Broker, SocketAddr) {
    let broker = Broker::with_security(test_config(), security)
        .await
        .expect("Failed to create broker");
    let addr = broker.listen().await.expect("Failed to bind listener");
    (broker, addr)
}

/// Wait (bounded) for an event matching the predicate.
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<BrokerEvent>, matches: F)
where
    F: Fn(&BrokerEvent) -> bool,
{
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return;
            }
        }
    })
    .await
    .expect("timed out waiting for broker event");
}

pub async fn wait_for_disconnect(events: &mut broadcast::Receiver<BrokerEvent>, id: &str) {
    wait_for_event(events, |event| {
        matches!(event, BrokerEvent::ClientDisconnected { client_id } if client_id == id)
    })
    .await;
}

pub async fn wait_for_published(events: &mut broadcast::Receiver<BrokerEvent>, on_topic: &str) {
    wait_for_event(events, |event| {
        matches!(event, BrokerEvent::Published { topic, .. } if topic == on_topic)
    })
    .await;
}

/// CONNECT parameters for a test client.
pub struct ConnectOptions {
    pub client_id: String,
    pub clean: bool,
    pub keep_alive: u16,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl ConnectOptions {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            clean: true,
            keep_alive: 60,
            will: None,
            username: None,
            password: None,
        }
    }

    pub fn clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    pub fn keep_alive(mut self, keep_alive: u16) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn will(mut self, topic: &str, payload: &[u8], qos: QoS) -> Self {
        self.will = Some(Will {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            qos,
            retain: false,
        });
        self
    }
}

/// Minimal raw-socket MQTT client for driving the broker in tests.
pub struct TestClient {
    reader: PacketReader,
    writer: PacketWriter,
}

impl TestClient {
    /// Connect with clean session and default keepalive, expecting success.
    pub async fn connect(addr: SocketAddr, client_id: &str) -> Self {
        Self::connect_with(addr, ConnectOptions::new(client_id)).await
    }

    /// Connect with explicit options, expecting CONNACK code 0.
    pub async fn connect_with(addr: SocketAddr, options: ConnectOptions) -> Self {
        let (client, connack) = Self::connect_expect(addr, options).await;
        assert_eq!(connack.code, ConnackCode::Accepted);
        client
    }

    /// Connect and hand back whatever CONNACK the broker answered with.
    pub async fn connect_expect(addr: SocketAddr, options: ConnectOptions) -> (Self, Connack) {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        let (reader, writer) = split(stream);
        let mut client = Self { reader, writer };

        client
            .send(&Packet::Connect(Connect {
                protocol_name: "MQIsdp".to_string(),
                protocol_version: 3,
                clean_session: options.clean,
                keep_alive: options.keep_alive,
                client_id: options.client_id,
                will: options.will,
                username: options.username,
                password: options.password,
            }))
            .await;

        match client.recv().await {
            Packet::Connack(connack) => (client, connack),
            other => panic!("Expected CONNACK, got {other:?}"),
        }
    }

    pub async fn send(&mut self, packet: &Packet) {
        self.writer.write(packet).await.expect("Failed to send");
    }

    /// Receive the next packet, panicking after `RECV_TIMEOUT`.
    pub async fn recv(&mut self) -> Packet {
        tokio::time::timeout(RECV_TIMEOUT, self.reader.read())
            .await
            .expect("timed out waiting for packet")
            .expect("read failed")
            .expect("connection closed")
    }

    /// Receive the next packet if one arrives within the window.
    pub async fn try_recv(&mut self, window: Duration) -> Option<Packet> {
        match tokio::time::timeout(window, self.reader.read()).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(_)) | Err(_) => None,
        }
    }

    /// True once the broker has closed this connection.
    pub async fn wait_closed(&mut self, window: Duration) -> bool {
        matches!(
            tokio::time::timeout(window, self.reader.read()).await,
            Ok(Ok(None)) | Ok(Err(_))
        )
    }

    pub async fn subscribe(&mut self, packet_id: u16, topics: &[(&str, QoS)]) -> Suback {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            topics: topics
                .iter()
                .map(|(filter, qos)| (filter.to_string(), *qos))
                .collect(),
        }))
        .await;

        match self.recv().await {
            Packet::Suback(suback) => {
                assert_eq!(suback.packet_id, packet_id);
                suback
            }
            other => panic!("Expected SUBACK, got {other:?}"),
        }
    }

    pub async fn unsubscribe(&mut self, packet_id: u16, topics: &[&str]) {
        self.send(&Packet::Unsubscribe(Unsubscribe {
            packet_id,
            topics: topics.iter().map(|t| t.to_string()).collect(),
        }))
        .await;

        match self.recv().await {
            Packet::Unsuback { packet_id: id } => assert_eq!(id, packet_id),
            other => panic!("Expected UNSUBACK, got {other:?}"),
        }
    }

    pub async fn publish_qos0(&mut self, topic: &str, payload: &[u8], retain: bool) {
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain,
            topic: topic.to_string(),
            packet_id: None,
            payload: Bytes::copy_from_slice(payload),
        }))
        .await;
    }

    /// QoS-1 publish that waits for the broker's PUBACK.
    pub async fn publish_qos1(&mut self, packet_id: u16, topic: &str, payload: &[u8], retain: bool) {
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain,
            topic: topic.to_string(),
            packet_id: Some(packet_id),
            payload: Bytes::copy_from_slice(payload),
        }))
        .await;

        match self.recv().await {
            Packet::Puback { packet_id: id } => assert_eq!(id, packet_id),
            other => panic!("Expected PUBACK, got {other:?}"),
        }
    }

    pub async fn puback(&mut self, packet_id: u16) {
        self.send(&Packet::Puback { packet_id }).await;
    }

    pub async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("Expected PUBLISH, got {other:?}"),
        }
    }

    /// Clean disconnect: DISCONNECT then drop the socket.
    pub async fn disconnect(mut self) {
        self.send(&Packet::Disconnect).await;
        self.writer.shutdown().await;
    }
}
