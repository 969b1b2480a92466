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

//! In-memory MQTT session state, owned by a single connection task.

use std::collections::HashMap;

use rand::Rng;
use tokio::task::JoinHandle;

use crate::bus::SubscriptionId;
use crate::packet::{Connect, QoS, Will};

/// One subscription held by a session.
#[derive(Debug)]
pub struct SessionSubscription {
    /// Granted QoS. Updated in place on a duplicate SUBSCRIBE; the bus
    /// registration is never replaced, deliveries read this value instead.
    pub qos: QoS,
    pub bus_id: SubscriptionId,
}

/// An unacknowledged QoS-1 publish to this client.
#[derive(Debug)]
pub struct Inflight {
    /// Pending retransmit timer; aborted when the PUBACK arrives.
    pub timer: JoinHandle<()>,
}

/// Per-connection MQTT session.
pub struct Session {
    pub client_id: String,
    pub clean: bool,
    pub keep_alive: u16,
    pub will: Option<Will>,
    pub subscriptions: HashMap<String, SessionSubscription>,
    pub inflight: HashMap<u16, Inflight>,
    pub closed: bool,
    /// Next outgoing message id. Starts at a random value so ids are unlikely
    /// to collide with inflight messages from a previous connection.
    next_packet_id: u16,
}

impl Session {
    pub fn new(client_id: String, connect: &Connect) -> Self {
        Self {
            client_id,
            clean: connect.clean_session,
            keep_alive: connect.keep_alive,
            will: connect.will.clone(),
            subscriptions: HashMap::new(),
            inflight: HashMap::new(),
            closed: false,
            next_packet_id: rand::thread_rng().gen(),
        }
    }

    /// Allocate the next outgoing message id, wrapping within 1..=65535.
    pub fn next_packet_id(&mut self) -> u16 {
        loop {
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id != 0 {
                return self.next_packet_id;
            }
        }
    }

    /// Subscriptions worth persisting for an offline session: QoS > 0 only.
    pub fn durable_subscriptions(&self) -> HashMap<String, QoS> {
        self.subscriptions
            .iter()
            .filter(|(_, sub)| sub.qos > QoS::AtMostOnce)
            .map(|(filter, sub)| (filter.clone(), sub.qos))
            .collect()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, inflight) in self.inflight.drain() {
            inflight.timer.abort();
        }
    }
}
