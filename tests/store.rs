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

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use mqttd::packet::{Publish, QoS};
use mqttd::store::{Store, StoreConfig};

fn publish(topic: &str, payload: &[u8], qos: QoS) -> Publish {
    Publish {
        dup: false,
        qos,
        retain: false,
        topic: topic.to_string(),
        packet_id: None,
        payload: Bytes::copy_from_slice(payload),
    }
}

async fn open_store() -> Store {
    Store::open(StoreConfig::default())
        .await
        .expect("Failed to open store")
}

#[tokio::test]
async fn retained_roundtrip() {
    let store = open_store().await;

    store
        .store_retained(&publish("home/temp", b"21", QoS::AtMostOnce))
        .await
        .unwrap();

    let found = store.lookup_retained("home/#").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].topic, "home/temp");
    assert_eq!(found[0].payload.as_ref(), b"21");
    assert!(found[0].retain);

    assert!(store.lookup_retained("office/#").await.unwrap().is_empty());
}

#[tokio::test]
async fn retained_overwrite_keeps_last() {
    let store = open_store().await;

    store
        .store_retained(&publish("home/temp", b"21", QoS::AtMostOnce))
        .await
        .unwrap();
    store
        .store_retained(&publish("home/temp", b"22", QoS::AtLeastOnce))
        .await
        .unwrap();

    let found = store.lookup_retained("home/temp").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].payload.as_ref(), b"22");
    assert_eq!(found[0].qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn empty_payload_clears_retained() {
    let store = open_store().await;

    store
        .store_retained(&publish("home/temp", b"21", QoS::AtMostOnce))
        .await
        .unwrap();
    store
        .store_retained(&publish("home/temp", b"", QoS::AtMostOnce))
        .await
        .unwrap();

    assert!(store.lookup_retained("home/#").await.unwrap().is_empty());
}

#[tokio::test]
async fn offline_packets_queue_for_stored_subscriber() {
    let store = open_store().await;

    let subs = HashMap::from([("a/+/c".to_string(), QoS::AtLeastOnce)]);
    store
        .store_subscriptions("client-a", false, &subs)
        .await
        .unwrap();

    store
        .store_offline_packet(&publish("a/b/c", b"x", QoS::AtLeastOnce))
        .await
        .unwrap();
    store
        .store_offline_packet(&publish("unrelated", b"y", QoS::AtLeastOnce))
        .await
        .unwrap();

    let queued = store
        .stream_offline_packets("client-a", false)
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].topic, "a/b/c");
    assert_eq!(queued[0].payload.as_ref(), b"x");
    assert_eq!(queued[0].qos, QoS::AtLeastOnce);

    // The drain is not restartable
    assert!(store
        .stream_offline_packets("client-a", false)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn offline_packets_keep_arrival_order() {
    let store = open_store().await;

    let subs = HashMap::from([("a/#".to_string(), QoS::AtLeastOnce)]);
    store
        .store_subscriptions("client-a", false, &subs)
        .await
        .unwrap();

    for i in 0..5u8 {
        store
            .store_offline_packet(&publish("a/b", &[i], QoS::AtLeastOnce))
            .await
            .unwrap();
    }

    let queued = store
        .stream_offline_packets("client-a", false)
        .await
        .unwrap();
    let order: Vec<u8> = queued.iter().map(|p| p.payload[0]).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn qos0_subscriptions_are_not_persisted() {
    let store = open_store().await;

    let subs = HashMap::from([
        ("a/b".to_string(), QoS::AtMostOnce),
        ("c/d".to_string(), QoS::AtLeastOnce),
    ]);
    store
        .store_subscriptions("client-a", false, &subs)
        .await
        .unwrap();

    let restored = store.lookup_subscriptions("client-a", false).await.unwrap();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored.get("c/d"), Some(&QoS::AtLeastOnce));
}

#[tokio::test]
async fn clean_sessions_store_nothing() {
    let store = open_store().await;

    let subs = HashMap::from([("a/b".to_string(), QoS::AtLeastOnce)]);
    store
        .store_subscriptions("client-a", true, &subs)
        .await
        .unwrap();

    assert!(store
        .lookup_subscriptions("client-a", false)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn clean_lookup_wipes_all_durable_state() {
    let store = open_store().await;

    let subs = HashMap::from([("a/+/c".to_string(), QoS::AtLeastOnce)]);
    store
        .store_subscriptions("client-a", false, &subs)
        .await
        .unwrap();
    store
        .store_offline_packet(&publish("a/b/c", b"x", QoS::AtLeastOnce))
        .await
        .unwrap();

    // clean=true deletes the record, the index rows and the queued packets
    assert!(store
        .lookup_subscriptions("client-a", true)
        .await
        .unwrap()
        .is_empty());

    assert!(store
        .lookup_subscriptions("client-a", false)
        .await
        .unwrap()
        .is_empty());
    assert!(store
        .stream_offline_packets("client-a", false)
        .await
        .unwrap()
        .is_empty());

    // Nothing routes to the wiped subscriber anymore
    store
        .store_offline_packet(&publish("a/b/c", b"y", QoS::AtLeastOnce))
        .await
        .unwrap();
    assert!(store
        .stream_offline_packets("client-a", false)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn connected_clients_accrue_no_offline_packets() {
    let store = open_store().await;

    let subs = HashMap::from([("a/#".to_string(), QoS::AtLeastOnce)]);
    store
        .store_subscriptions("client-a", false, &subs)
        .await
        .unwrap();

    // Reconnect: the record comes back and the index rows are retired for
    // the duration of the connection
    let restored = store.lookup_subscriptions("client-a", false).await.unwrap();
    assert_eq!(restored.len(), 1);

    store
        .store_offline_packet(&publish("a/b", b"x", QoS::AtLeastOnce))
        .await
        .unwrap();
    assert!(store
        .stream_offline_packets("client-a", false)
        .await
        .unwrap()
        .is_empty());

    // Session end re-creates the rows; queueing resumes
    store
        .store_subscriptions("client-a", false, &subs)
        .await
        .unwrap();
    store
        .store_offline_packet(&publish("a/b", b"y", QoS::AtLeastOnce))
        .await
        .unwrap();
    let queued = store
        .stream_offline_packets("client-a", false)
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].payload.as_ref(), b"y");
}

#[tokio::test]
async fn matcher_rebuilds_from_disk_on_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = StoreConfig {
        path: Some(dir.path().to_path_buf()),
        ..StoreConfig::default()
    };

    {
        let store = Store::open(config.clone()).await.unwrap();
        let subs = HashMap::from([("a/+/c".to_string(), QoS::AtLeastOnce)]);
        store
            .store_subscriptions("client-a", false, &subs)
            .await
            .unwrap();
        store.close().await.unwrap();
    }

    let store = Store::open(config).await.unwrap();
    store
        .store_offline_packet(&publish("a/b/c", b"x", QoS::AtLeastOnce))
        .await
        .unwrap();

    let queued = store
        .stream_offline_packets("client-a", false)
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].topic, "a/b/c");
}

#[tokio::test]
async fn expired_offline_packets_are_dropped() {
    let config = StoreConfig {
        packets_ttl: Duration::from_millis(50),
        ..StoreConfig::default()
    };
    let store = Store::open(config).await.unwrap();

    let subs = HashMap::from([("a/#".to_string(), QoS::AtLeastOnce)]);
    store
        .store_subscriptions("client-a", false, &subs)
        .await
        .unwrap();
    store
        .store_offline_packet(&publish("a/b", b"x", QoS::AtLeastOnce))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(store
        .stream_offline_packets("client-a", false)
        .await
        .unwrap()
        .is_empty());
}
