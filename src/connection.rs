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

//! Per-client MQTT connection state machine.
//!
//! One task per socket owns the session end to end: CONNECT handshake,
//! keepalive watchdog, packet dispatch, QoS-1 retransmission and teardown.
//! Bus deliveries, retransmit ticks and control messages arrive over
//! channels polled by the same `select!` loop, so all session mutation
//! happens in a single logical execution context.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerEvent, ClientHandle, ControlMessage};
use crate::bus::{to_bus_filter, Delivery};
use crate::error::{Error, ProtocolError, Result};
use crate::matcher::{topic_matches_filter, validate_filter, validate_topic_name};
use crate::packet::{
    Connack, ConnackCode, Packet, Publish, QoS, Suback, Subscribe, Unsubscribe,
};
use crate::session::{Inflight, Session, SessionSubscription};
use crate::transport::{split, PacketWriter};

/// QoS-1 delivery stops after this many transmissions.
const MAX_SEND_ATTEMPTS: u32 = 10;

/// How a session left its main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// DISCONNECT, keepalive expiry, takeover, shutdown or an authorization
    /// deny. The will is not published.
    Graceful,
    /// The transport ended or a protocol violation dropped the stream. The
    /// will, if any, is published.
    Abrupt,
}

/// Outcome of handling one inbound packet.
enum Flow {
    Continue,
    /// Clean DISCONNECT from the client.
    Disconnect,
    /// An authorization hook denied the operation; the connection is closed
    /// after unsubscribing everything.
    Denied,
}

/// Scheduled QoS-1 retransmission.
struct Retry {
    publish: Publish,
    attempt: u32,
}

struct Conn {
    broker: Broker,
    writer: PacketWriter,
    session: Session,
    conn_id: u64,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
    retry_tx: mpsc::UnboundedSender<Retry>,
}

/// Drive one client socket from accept to close.
pub(crate) async fn run(broker: Broker, stream: TcpStream, peer: SocketAddr) {
    let (mut reader, mut writer) = split(stream);

    // The stream must open with CONNECT; anything else ends it
    let connect = match tokio::time::timeout(broker.inner.config.connect_timeout, reader.read())
        .await
    {
        Ok(Ok(Some(Packet::Connect(connect)))) => connect,
        Ok(Ok(Some(_))) => {
            debug!("first packet from {peer} was not CONNECT");
            return;
        }
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            debug!("handshake with {peer} failed: {e}");
            return;
        }
        Err(_) => {
            debug!("no CONNECT from {peer} within the connect timeout");
            return;
        }
    };

    match broker
        .inner
        .security
        .authenticate(
            &connect.client_id,
            connect.username.as_deref(),
            connect.password.as_deref(),
        )
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            info!("authentication denied for client '{}'", connect.client_id);
            let _ = writer
                .write(&Packet::Connack(Connack {
                    session_present: false,
                    code: ConnackCode::NotAuthorized,
                }))
                .await;
            writer.shutdown().await;
            return;
        }
        Err(e) => {
            warn!("authentication hook failed for {peer}: {e}");
            broker.emit(BrokerEvent::Error(format!("authentication failed: {e}")));
            return;
        }
    }

    let client_id = if connect.client_id.is_empty() {
        format!("auto-{}", Uuid::new_v4().simple())
    } else {
        connect.client_id.clone()
    };

    let conn_id = broker.next_conn_id();
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel();
    let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel();
    let (retry_tx, mut retry_rx) = mpsc::unbounded_channel();

    // Registering displaces any prior connection with the same client id
    broker
        .register(
            &client_id,
            ClientHandle {
                conn_id,
                ctrl: ctrl_tx,
            },
        )
        .await;

    let session = Session::new(client_id.clone(), &connect);
    let mut conn = Conn {
        broker: broker.clone(),
        writer,
        session,
        conn_id,
        delivery_tx,
        retry_tx,
    };

    if conn
        .writer
        .write(&Packet::Connack(Connack {
            session_present: false,
            code: ConnackCode::Accepted,
        }))
        .await
        .is_err()
    {
        teardown(conn, CloseReason::Graceful).await;
        return;
    }

    debug!(
        "client '{client_id}' connected from {peer} (clean={}, keepalive={})",
        conn.session.clean, conn.session.keep_alive
    );
    broker.emit(BrokerEvent::ClientConnected {
        client_id: client_id.clone(),
    });

    // Restore durable subscriptions and drain the offline queue
    if let Err(e) = conn.restore().await {
        warn!("session restore failed for '{client_id}': {e}");
        teardown(conn, CloseReason::Abrupt).await;
        return;
    }

    // Keepalive watchdog window per the protocol: keepalive * 5/4
    let window = (conn.session.keep_alive > 0)
        .then(|| Duration::from_millis(u64::from(conn.session.keep_alive) * 1250));
    let mut deadline = Instant::now() + window.unwrap_or(Duration::from_secs(0));

    let reason = loop {
        tokio::select! {
            result = reader.read() => match result {
                Ok(Some(packet)) => {
                    // Any received packet rearms the watchdog
                    if let Some(window) = window {
                        deadline = Instant::now() + window;
                    }
                    match conn.handle_packet(packet).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Disconnect) => break CloseReason::Graceful,
                        Ok(Flow::Denied) => break CloseReason::Graceful,
                        Err(e) => {
                            debug!("dropping client '{client_id}': {e}");
                            break CloseReason::Abrupt;
                        }
                    }
                }
                Ok(None) => break CloseReason::Abrupt,
                Err(e) => {
                    debug!("read error for client '{client_id}': {e}");
                    break CloseReason::Abrupt;
                }
            },
            _ = tokio::time::sleep_until(deadline), if window.is_some() => {
                debug!("keepalive expired for client '{client_id}'");
                break CloseReason::Graceful;
            }
            Some(delivery) = delivery_rx.recv() => {
                if let Err(e) = conn.forward(delivery).await {
                    debug!("delivery to client '{client_id}' failed: {e}");
                    break CloseReason::Abrupt;
                }
            }
            Some(retry) = retry_rx.recv() => {
                if let Err(e) = conn.retry(retry).await {
                    debug!("retransmit to client '{client_id}' failed: {e}");
                    break CloseReason::Abrupt;
                }
            }
            Some(ctrl) = ctrl_rx.recv() => {
                trace!("control message {ctrl:?} for client '{client_id}'");
                match ctrl {
                    ControlMessage::Takeover | ControlMessage::Shutdown => {
                        break CloseReason::Graceful;
                    }
                }
            }
        }
    };

    teardown(conn, reason).await;
}

/// Cleanup is idempotent and runs exactly once per session: cancel inflight
/// timers, release bus subscriptions, persist durable subscriptions, publish
/// the will on abrupt close, then report the disconnect.
async fn teardown(mut conn: Conn, reason: CloseReason) {
    if conn.session.closed {
        return;
    }
    conn.session.closed = true;

    let client_id = conn.session.client_id.clone();
    let owns_client_id = conn.broker.deregister(&client_id, conn.conn_id).await;

    for (_, inflight) in conn.session.inflight.drain() {
        inflight.timer.abort();
    }

    let durable = conn.session.durable_subscriptions();
    let subscriptions: Vec<(String, SessionSubscription)> =
        conn.session.subscriptions.drain().collect();
    for (_, sub) in &subscriptions {
        conn.broker.inner.bus.unsubscribe(sub.bus_id).await;
    }

    // The will fires only on abrupt close. At this point the session holds
    // no bus subscriptions and its durable state is not yet re-persisted, so
    // the will cannot be delivered back to its own session, live or queued
    if reason == CloseReason::Abrupt {
        if let Some(will) = conn.session.will.take() {
            debug!("publishing will of client '{client_id}' on '{}'", will.topic);
            conn.broker.publish_will(&will, &client_id).await;
        }
    }

    // A displaced session leaves durable state to its successor
    if !conn.session.clean && owns_client_id {
        if let Err(e) = conn
            .broker
            .inner
            .store
            .store_subscriptions(&client_id, false, &durable)
            .await
        {
            warn!("failed to persist subscriptions for '{client_id}': {e}");
        }
    }

    conn.writer.shutdown().await;
    debug!("client '{client_id}' disconnected");
    conn.broker
        .emit(BrokerEvent::ClientDisconnected { client_id });
}

impl Conn {
    /// Reconnect orchestration: restore durable subscriptions from the store
    /// and forward queued offline packets as though the bus delivered them.
    async fn restore(&mut self) -> Result<()> {
        let client_id = self.session.client_id.clone();
        let stored = self
            .broker
            .inner
            .store
            .lookup_subscriptions(&client_id, self.session.clean)
            .await?;

        for (filter, qos) in stored {
            let bus_id = self
                .broker
                .inner
                .bus
                .subscribe(&to_bus_filter(&filter), self.delivery_tx.clone())
                .await?;
            trace!("restored subscription '{filter}' for client '{client_id}'");
            self.session
                .subscriptions
                .insert(filter, SessionSubscription { qos, bus_id });
        }

        let queued = self
            .broker
            .inner
            .store
            .stream_offline_packets(&client_id, self.session.clean)
            .await?;
        for packet in queued {
            let filter = self
                .session
                .subscriptions
                .keys()
                .find(|filter| topic_matches_filter(&packet.topic, filter))
                .cloned();
            let Some(filter) = filter else { continue };
            self.forward(Delivery {
                topic: packet.topic,
                payload: packet.payload,
                qos: packet.qos,
                retain: false,
                filter,
            })
            .await?;
        }

        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<Flow> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::Puback { packet_id } => {
                self.handle_puback(packet_id);
                Ok(Flow::Continue)
            }
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe).await,
            Packet::Pingreq => {
                self.writer.write(&Packet::Pingresp).await?;
                Ok(Flow::Continue)
            }
            Packet::Disconnect => Ok(Flow::Disconnect),
            Packet::Connect(_) => {
                Err(ProtocolError::UnexpectedPacket("second CONNECT").into())
            }
            _ => Err(ProtocolError::UnexpectedPacket("server-side packet from client").into()),
        }
    }

    async fn handle_publish(&mut self, publish: Publish) -> Result<Flow> {
        if publish.qos == QoS::ExactlyOnce {
            return Err(ProtocolError::UnexpectedPacket("QoS 2 PUBLISH").into());
        }
        validate_topic_name(&publish.topic)?;

        let client_id = self.session.client_id.clone();
        match self
            .broker
            .inner
            .security
            .authorize_publish(&client_id, &publish.topic, &publish.payload)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    "publish to '{}' denied for client '{client_id}'",
                    publish.topic
                );
                return Ok(Flow::Denied);
            }
            Err(e) => {
                self.broker
                    .emit(BrokerEvent::Error(format!("authorize_publish failed: {e}")));
                return Err(Error::Auth(e.to_string()));
            }
        }

        if publish.retain {
            self.broker.inner.store.store_retained(&publish).await?;
        }

        self.broker.publish(&publish, &client_id).await?;

        if publish.qos == QoS::AtLeastOnce {
            if let Some(packet_id) = publish.packet_id {
                self.writer.write(&Packet::Puback { packet_id }).await?;
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_subscribe(&mut self, subscribe: Subscribe) -> Result<Flow> {
        let client_id = self.session.client_id.clone();
        let mut granted = Vec::with_capacity(subscribe.topics.len());
        let mut accepted: Vec<(String, QoS)> = Vec::with_capacity(subscribe.topics.len());

        for (filter, requested_qos) in &subscribe.topics {
            validate_filter(filter)?;
            // QoS 2 subscriptions are downgraded to QoS 1
            let qos = (*requested_qos).min(QoS::AtLeastOnce);

            // Duplicate subscribe: update the granted QoS in place without
            // touching the bus registration; deliveries pick up the new QoS
            // through the session map
            if let Some(sub) = self.session.subscriptions.get_mut(filter) {
                sub.qos = qos;
                granted.push(qos as u8);
                accepted.push((filter.clone(), qos));
                continue;
            }

            match self
                .broker
                .inner
                .security
                .authorize_subscribe(&client_id, filter)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    info!("subscribe to '{filter}' denied for client '{client_id}'");
                    return Ok(Flow::Denied);
                }
                Err(e) => {
                    self.broker.emit(BrokerEvent::Error(format!(
                        "authorize_subscribe failed: {e}"
                    )));
                    return Err(Error::Auth(e.to_string()));
                }
            }

            let bus_id = self
                .broker
                .inner
                .bus
                .subscribe(&to_bus_filter(filter), self.delivery_tx.clone())
                .await?;
            self.session
                .subscriptions
                .insert(filter.clone(), SessionSubscription { qos, bus_id });
            granted.push(qos as u8);
            accepted.push((filter.clone(), qos));
            trace!("client '{client_id}' subscribed to '{filter}' at {qos:?}");
        }

        self.writer
            .write(&Packet::Suback(Suback {
                packet_id: subscribe.packet_id,
                return_codes: granted,
            }))
            .await?;

        // Retained replay is supervisor business: the state machine asks the
        // store and forwards the results itself
        for (filter, _) in accepted {
            let retained = self.broker.inner.store.lookup_retained(&filter).await?;
            for message in retained {
                self.forward(Delivery {
                    topic: message.topic,
                    payload: message.payload,
                    qos: message.qos,
                    retain: true,
                    filter: filter.clone(),
                })
                .await?;
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_unsubscribe(&mut self, unsubscribe: Unsubscribe) -> Result<Flow> {
        for filter in &unsubscribe.topics {
            if let Some(sub) = self.session.subscriptions.remove(filter) {
                self.broker.inner.bus.unsubscribe(sub.bus_id).await;
                trace!(
                    "client '{}' unsubscribed from '{filter}'",
                    self.session.client_id
                );
            }
        }
        self.writer
            .write(&Packet::Unsuback {
                packet_id: unsubscribe.packet_id,
            })
            .await?;
        Ok(Flow::Continue)
    }

    fn handle_puback(&mut self, packet_id: u16) {
        match self.session.inflight.remove(&packet_id) {
            Some(inflight) => {
                inflight.timer.abort();
                trace!(
                    "PUBACK {packet_id} acknowledged for client '{}'",
                    self.session.client_id
                );
            }
            None => warn!(
                "unexpected PUBACK {packet_id} from client '{}'",
                self.session.client_id
            ),
        }
    }

    /// Deliver a matched message to this client. The effective QoS is the
    /// minimum of the publish QoS and the subscription's current QoS.
    async fn forward(&mut self, delivery: Delivery) -> Result<()> {
        let Some(sub) = self.session.subscriptions.get(&delivery.filter) else {
            // Raced an unsubscribe; nothing to deliver to
            return Ok(());
        };
        let qos = delivery.qos.min(sub.qos);

        if qos == QoS::AtMostOnce {
            return self
                .writer
                .write(&Packet::Publish(Publish {
                    dup: false,
                    qos,
                    retain: delivery.retain,
                    topic: delivery.topic,
                    packet_id: None,
                    payload: delivery.payload,
                }))
                .await;
        }

        let packet_id = self.session.next_packet_id();
        let publish = Publish {
            dup: false,
            qos,
            retain: delivery.retain,
            topic: delivery.topic,
            packet_id: Some(packet_id),
            payload: delivery.payload,
        };
        self.actual_send(publish, 0).await
    }

    /// Transmit a QoS-1 publish and schedule its retransmission with
    /// exponential backoff until the PUBACK arrives or attempts run out.
    async fn actual_send(&mut self, publish: Publish, attempt: u32) -> Result<()> {
        let Some(packet_id) = publish.packet_id else {
            return Ok(());
        };

        if attempt >= MAX_SEND_ATTEMPTS {
            warn!(
                "client '{}' is not responding to acks, dropping message {packet_id}",
                self.session.client_id
            );
            if let Some(inflight) = self.session.inflight.remove(&packet_id) {
                inflight.timer.abort();
            }
            self.broker.emit(BrokerEvent::Error(format!(
                "client '{}' not responding to acks",
                self.session.client_id
            )));
            return Ok(());
        }

        let mut wire = publish.clone();
        wire.dup = attempt > 0;
        self.writer.write(&Packet::Publish(wire)).await?;

        let delay = self.broker.inner.config.base_retry_timeout * 2u32.pow(attempt);
        let retry_tx = self.retry_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = retry_tx.send(Retry {
                publish,
                attempt: attempt + 1,
            });
        });

        if let Some(old) = self.session.inflight.insert(packet_id, Inflight { timer }) {
            old.timer.abort();
        }
        Ok(())
    }

    async fn retry(&mut self, retry: Retry) -> Result<()> {
        let Some(packet_id) = retry.publish.packet_id else {
            return Ok(());
        };
        // A PUBACK may have raced the timer
        if !self.session.inflight.contains_key(&packet_id) {
            return Ok(());
        }
        trace!(
            "retransmitting message {packet_id} to client '{}' (attempt {})",
            self.session.client_id,
            retry.attempt
        );
        self.actual_send(retry.publish, retry.attempt).await
    }
}
