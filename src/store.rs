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

//! Persistence store: retained messages, durable subscriptions, offline
//! packet queues.
//!
//! Backed by a sled database with four trees. Rows carry an absolute expiry
//! timestamp; reads skip expired rows and a background sweep prunes them
//! every `check_frequency`. The store also owns the in-memory wildcard
//! matcher over subscription-index keys, rebuilt from the index at open, so
//! a publish can find offline durable subscribers by topic without scanning
//! all clients.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::matcher::{topic_matches_filter, TopicMatcher};
use crate::packet::{Publish, QoS};

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory. `None` opens an ephemeral database.
    pub path: Option<PathBuf>,
    /// Lifetime of durable subscriptions and retained messages.
    pub subscriptions_ttl: Duration,
    /// Lifetime of offline packets.
    pub packets_ttl: Duration,
    /// Period of the TTL sweep task.
    pub check_frequency: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            subscriptions_ttl: Duration::from_secs(3600),
            packets_ttl: Duration::from_secs(3600),
            check_frequency: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RetainedRow {
    payload: Vec<u8>,
    qos: u8,
    expires_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClientRecord {
    subscriptions: HashMap<String, u8>,
    expires_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexRow {
    client_id: String,
    filter: String,
    qos: u8,
    expires_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct OfflineRow {
    topic: String,
    payload: Vec<u8>,
    qos: u8,
    expires_at: i64,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn qos_from_u8(value: u8) -> QoS {
    QoS::try_from(value).unwrap_or_default()
}

/// Key of a subscription-index row: `filter + ":" + client_id`. The same
/// string is the token registered in the matcher.
fn index_key(filter: &str, client_id: &str) -> String {
    format!("{filter}:{client_id}")
}

/// Persistence store.
pub struct Store {
    db: sled::Db,
    retained: sled::Tree,
    client_subs: sled::Tree,
    sub_index: sled::Tree,
    offline: sled::Tree,
    matcher: Arc<RwLock<TopicMatcher<String>>>,
    subscriptions_ttl: Duration,
    packets_ttl: Duration,
    /// Monotonic suffix for offline keys so same-millisecond packets do not
    /// collide.
    seq: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Store {
    /// Open the store, rebuild the matcher from the subscription index and
    /// start the TTL sweep task.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let db = match &config.path {
            Some(path) => sled::open(path)?,
            None => sled::Config::new().temporary(true).open()?,
        };

        let retained = db.open_tree("retained")?;
        let client_subs = db.open_tree("client-subscriptions")?;
        let sub_index = db.open_tree("subscription-index")?;
        let offline = db.open_tree("offline-packets")?;

        let matcher = Arc::new(RwLock::new(TopicMatcher::new()));

        // Rebuild the matcher from durable subscription rows
        {
            let mut matcher = matcher.write().await;
            let now = now_ms();
            for item in sub_index.iter() {
                let (key, value) = item?;
                let Ok(row) = serde_json::from_slice::<IndexRow>(&value) else {
                    sub_index.remove(&key)?;
                    continue;
                };
                if row.expires_at <= now {
                    sub_index.remove(&key)?;
                    continue;
                }
                let key = String::from_utf8_lossy(&key).into_owned();
                matcher.add(&row.filter, key);
            }
            debug!("rebuilt matcher with {} durable subscription(s)", matcher.len());
        }

        let sweeper = spawn_sweeper(
            config.check_frequency,
            retained.clone(),
            client_subs.clone(),
            sub_index.clone(),
            offline.clone(),
            matcher.clone(),
        );

        Ok(Self {
            db,
            retained,
            client_subs,
            sub_index,
            offline,
            matcher,
            subscriptions_ttl: config.subscriptions_ttl,
            packets_ttl: config.packets_ttl,
            seq: AtomicU64::new(0),
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Store the retained message for a topic. An empty payload deletes the
    /// entry.
    pub async fn store_retained(&self, packet: &Publish) -> Result<()> {
        if packet.payload.is_empty() {
            self.retained.remove(packet.topic.as_bytes())?;
            trace!("cleared retained message for '{}'", packet.topic);
            return Ok(());
        }

        let row = RetainedRow {
            payload: packet.payload.to_vec(),
            qos: packet.qos as u8,
            expires_at: now_ms() + self.subscriptions_ttl.as_millis() as i64,
        };
        self.retained
            .insert(packet.topic.as_bytes(), serde_json::to_vec(&row)?)?;
        trace!("stored retained message for '{}'", packet.topic);
        Ok(())
    }

    /// Return every retained message whose topic matches the filter.
    pub async fn lookup_retained(&self, filter: &str) -> Result<Vec<Publish>> {
        let now = now_ms();
        let mut found = Vec::new();

        for item in self.retained.iter() {
            let (key, value) = item?;
            let topic = String::from_utf8_lossy(&key).into_owned();
            let Ok(row) = serde_json::from_slice::<RetainedRow>(&value) else {
                self.retained.remove(&key)?;
                continue;
            };
            if row.expires_at <= now {
                self.retained.remove(&key)?;
                continue;
            }
            if topic_matches_filter(&topic, filter) {
                found.push(Publish {
                    dup: false,
                    qos: qos_from_u8(row.qos),
                    retain: true,
                    topic,
                    packet_id: None,
                    payload: Bytes::from(row.payload),
                });
            }
        }

        Ok(found)
    }

    /// Persist a session's durable subscriptions (QoS > 0 only) and index
    /// them in the matcher. No-op for clean sessions.
    pub async fn store_subscriptions(
        &self,
        client_id: &str,
        clean: bool,
        subscriptions: &HashMap<String, QoS>,
    ) -> Result<()> {
        if clean {
            return Ok(());
        }

        let expires_at = now_ms() + self.subscriptions_ttl.as_millis() as i64;
        let durable: HashMap<String, u8> = subscriptions
            .iter()
            .filter(|(_, qos)| **qos > QoS::AtMostOnce)
            .map(|(filter, qos)| (filter.clone(), *qos as u8))
            .collect();

        let record = ClientRecord {
            subscriptions: durable.clone(),
            expires_at,
        };
        self.client_subs
            .insert(client_id.as_bytes(), serde_json::to_vec(&record)?)?;

        let mut matcher = self.matcher.write().await;
        for (filter, qos) in durable {
            let key = index_key(&filter, client_id);
            let row = IndexRow {
                client_id: client_id.to_string(),
                filter: filter.clone(),
                qos,
                expires_at,
            };
            self.sub_index
                .insert(key.as_bytes(), serde_json::to_vec(&row)?)?;
            matcher.add(&filter, key);
        }

        trace!("stored durable subscriptions for client '{client_id}'");
        Ok(())
    }

    /// Look up the durable subscriptions stored for a client.
    ///
    /// With `clean` set, all durable state for the client (record, index
    /// rows, matcher entries, offline packets) is deleted and an empty map is
    /// returned. Otherwise the stored record is returned and its index rows
    /// and matcher entries are retired for the duration of the connection;
    /// `store_subscriptions` recreates them when the session ends. A client
    /// that is online receives live deliveries, never offline copies.
    pub async fn lookup_subscriptions(
        &self,
        client_id: &str,
        clean: bool,
    ) -> Result<HashMap<String, QoS>> {
        let record = match self.client_subs.get(client_id.as_bytes())? {
            Some(value) => serde_json::from_slice::<ClientRecord>(&value).ok(),
            None => None,
        };

        if clean {
            self.client_subs.remove(client_id.as_bytes())?;
            if let Some(record) = &record {
                let mut matcher = self.matcher.write().await;
                for filter in record.subscriptions.keys() {
                    let key = index_key(filter, client_id);
                    self.sub_index.remove(key.as_bytes())?;
                    matcher.remove(&key);
                }
            }
            // Discard any queued packets as well
            self.drain_offline(client_id)?;
            trace!("wiped durable state for clean client '{client_id}'");
            return Ok(HashMap::new());
        }

        let Some(record) = record else {
            return Ok(HashMap::new());
        };

        if record.expires_at <= now_ms() {
            self.client_subs.remove(client_id.as_bytes())?;
            return Ok(HashMap::new());
        }

        let mut matcher = self.matcher.write().await;
        for filter in record.subscriptions.keys() {
            let key = index_key(filter, client_id);
            self.sub_index.remove(key.as_bytes())?;
            matcher.remove(&key);
        }

        Ok(record
            .subscriptions
            .into_iter()
            .map(|(filter, qos)| (filter, qos_from_u8(qos)))
            .collect())
    }

    /// Queue a published packet for every offline durable subscriber whose
    /// filter matches its topic. A write failure for one subscriber is
    /// logged and skipped so it cannot stall the publish path.
    pub async fn store_offline_packet(&self, packet: &Publish) -> Result<()> {
        let keys = {
            let matcher = self.matcher.read().await;
            matcher.matches(&packet.topic)
        };

        let now = now_ms();
        let expires_at = now + self.packets_ttl.as_millis() as i64;

        for key in keys {
            let row = match self.sub_index.get(key.as_bytes()) {
                Ok(Some(value)) => match serde_json::from_slice::<IndexRow>(&value) {
                    Ok(row) if row.expires_at > now => row,
                    _ => continue,
                },
                Ok(None) => continue,
                Err(e) => {
                    warn!("failed to read subscription row '{key}': {e}");
                    continue;
                }
            };

            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let offline_key = format!(
                "{}:{}:{:08}",
                row.client_id,
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                seq
            );
            let offline_row = OfflineRow {
                topic: packet.topic.clone(),
                payload: packet.payload.to_vec(),
                qos: packet.qos as u8,
                expires_at,
            };

            match serde_json::to_vec(&offline_row) {
                Ok(encoded) => {
                    if let Err(e) = self.offline.insert(offline_key.as_bytes(), encoded) {
                        warn!(
                            "failed to queue offline packet for client '{}': {e}",
                            row.client_id
                        );
                    }
                }
                Err(e) => warn!(
                    "failed to encode offline packet for client '{}': {e}",
                    row.client_id
                ),
            }
        }

        Ok(())
    }

    /// Drain the offline queue of a client. Every queued packet is deleted;
    /// packets are returned (oldest first) only for non-clean sessions.
    pub async fn stream_offline_packets(
        &self,
        client_id: &str,
        clean: bool,
    ) -> Result<Vec<Publish>> {
        let rows = self.drain_offline(client_id)?;
        if clean {
            return Ok(Vec::new());
        }

        let now = now_ms();
        Ok(rows
            .into_iter()
            .filter(|row| row.expires_at > now)
            .map(|row| Publish {
                dup: false,
                qos: qos_from_u8(row.qos),
                retain: false,
                topic: row.topic,
                packet_id: None,
                payload: Bytes::from(row.payload),
            })
            .collect())
    }

    /// Stop the sweep task and flush the database.
    pub async fn close(&self) -> Result<()> {
        if let Some(handle) = self.sweeper.lock().expect("sweeper lock poisoned").take() {
            handle.abort();
        }
        self.db.flush_async().await?;
        Ok(())
    }

    /// Delete and return all offline rows for a client, oldest first.
    fn drain_offline(&self, client_id: &str) -> Result<Vec<OfflineRow>> {
        let prefix = format!("{client_id}:");
        let mut rows = Vec::new();

        for item in self.offline.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            self.offline.remove(&key)?;
            if let Ok(row) = serde_json::from_slice::<OfflineRow>(&value) {
                rows.push(row);
            }
        }

        Ok(rows)
    }
}

/// Spawn the periodic TTL sweep over all four trees.
fn spawn_sweeper(
    period: Duration,
    retained: sled::Tree,
    client_subs: sled::Tree,
    sub_index: sled::Tree,
    offline: sled::Tree,
    matcher: Arc<RwLock<TopicMatcher<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        interval.tick().await;

        loop {
            interval.tick().await;
            let now = now_ms();

            sweep_tree(&retained, now, |value| {
                serde_json::from_slice::<RetainedRow>(value)
                    .map(|row| row.expires_at)
                    .ok()
            });
            sweep_tree(&client_subs, now, |value| {
                serde_json::from_slice::<ClientRecord>(value)
                    .map(|row| row.expires_at)
                    .ok()
            });
            sweep_tree(&offline, now, |value| {
                serde_json::from_slice::<OfflineRow>(value)
                    .map(|row| row.expires_at)
                    .ok()
            });

            // Expired index rows come out of the matcher as well
            let mut expired = Vec::new();
            for item in sub_index.iter() {
                let Ok((key, value)) = item else { continue };
                let keep = serde_json::from_slice::<IndexRow>(&value)
                    .map(|row| row.expires_at > now)
                    .unwrap_or(false);
                if !keep {
                    expired.push(key);
                }
            }
            if !expired.is_empty() {
                let mut matcher = matcher.write().await;
                for key in expired {
                    let _ = sub_index.remove(&key);
                    let token = String::from_utf8_lossy(&key).into_owned();
                    matcher.remove(&token);
                }
            }

            trace!("ttl sweep complete");
        }
    })
}

fn sweep_tree(tree: &sled::Tree, now: i64, expires_at: impl Fn(&[u8]) -> Option<i64>) {
    let mut expired = Vec::new();
    for item in tree.iter() {
        let Ok((key, value)) = item else { continue };
        match expires_at(&value) {
            Some(ts) if ts > now => {}
            _ => expired.push(key),
        }
    }
    for key in expired {
        let _ = tree.remove(key);
    }
}
