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

//! Broker-internal publish/subscribe bus.
//!
//! Decouples publishers from subscribers. The default implementation is
//! in-process; the trait is the seam for clustering back-ends. The bus
//! wildcard syntax uses `*` for the trailing multi-level wildcard; MQTT `#`
//! is translated at the adapter boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tracing::trace;

use crate::error::{Error, Result};
use crate::matcher::TopicMatcher;
use crate::packet::QoS;

/// Handle identifying one bus subscription.
pub type SubscriptionId = u64;

/// A message fanned out to a subscription handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// The MQTT filter this subscription was registered under.
    pub filter: String,
}

/// Context attached to a publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
    /// Client id of the originating session, if any.
    pub publisher: Option<String>,
    /// Message id the publisher used, if any.
    pub packet_id: Option<u16>,
}

/// Translate an MQTT filter into the bus wildcard syntax.
pub fn to_bus_filter(filter: &str) -> String {
    if filter == "#" || filter.ends_with("/#") {
        format!("{}*", &filter[..filter.len() - 1])
    } else {
        filter.to_string()
    }
}

fn from_bus_filter(filter: &str) -> String {
    if filter == "*" || filter.ends_with("/*") {
        format!("{}#", &filter[..filter.len() - 1])
    } else {
        filter.to_string()
    }
}

/// Abstract pub/sub bus.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Register a handler for every topic matching `filter` (bus syntax).
    /// Deliveries arrive on the provided channel sender.
    async fn subscribe(
        &self,
        filter: &str,
        handler: mpsc::UnboundedSender<Delivery>,
    ) -> Result<SubscriptionId>;

    /// Remove a subscription. Returns whether it existed.
    async fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Fan a message out to every matching handler. Dispatch to in-memory
    /// handlers is initiated before this returns.
    async fn publish(&self, topic: &str, payload: Bytes, opts: PublishOptions) -> Result<()>;

    /// Shut the bus down; subsequent publishes fail.
    async fn close(&self);
}

struct BusEntry {
    /// MQTT-syntax filter, handed back in each delivery.
    filter: String,
    handler: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BusInner {
    matcher: TopicMatcher<SubscriptionId>,
    entries: HashMap<SubscriptionId, BusEntry>,
}

/// In-process bus implementation.
pub struct LocalBus {
    inner: RwLock<BusInner>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BusInner::default()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn subscribe(
        &self,
        filter: &str,
        handler: mpsc::UnboundedSender<Delivery>,
    ) -> Result<SubscriptionId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::BusClosed);
        }

        let mqtt_filter = from_bus_filter(filter);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.inner.write().await;
        inner.matcher.add(&mqtt_filter, id);
        inner.entries.insert(
            id,
            BusEntry {
                filter: mqtt_filter,
                handler,
            },
        );
        trace!("bus subscription {id} registered for '{filter}'");
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.write().await;
        inner.matcher.remove(&id);
        inner.entries.remove(&id).is_some()
    }

    async fn publish(&self, topic: &str, payload: Bytes, opts: PublishOptions) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::BusClosed);
        }

        let inner = self.inner.read().await;
        let matched = inner.matcher.matches(topic);
        trace!(
            "bus publish on '{topic}' matched {} subscription(s)",
            matched.len()
        );

        for id in matched {
            if let Some(entry) = inner.entries.get(&id) {
                let delivery = Delivery {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    qos: opts.qos,
                    retain: false,
                    filter: entry.filter.clone(),
                };
                // A closed receiver means the session is tearing down; it
                // unsubscribes itself during cleanup.
                let _ = entry.handler.send(delivery);
            }
        }

        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.matcher = TopicMatcher::new();
    }
}
