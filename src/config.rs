// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// SPDX-License-Identifier: MIT

//! Broker configuration.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::store::StoreConfig;

/// Pub/sub back-end selector. The in-process bus is the default; the enum is
/// the extension point for clustering back-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusBackend {
    #[default]
    InProcess,
}

/// Broker configuration with protocol defaults.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind.
    pub host: IpAddr,
    /// Listen port.
    pub port: u16,
    /// Initial QoS-1 resend delay; doubled on every retry.
    pub base_retry_timeout: Duration,
    /// Upper bound on concurrently connected clients.
    pub max_connections: usize,
    /// Pub/sub back-end.
    pub backend: BusBackend,
    /// Time allowed for a new socket to produce its CONNECT.
    pub connect_timeout: Duration,
    /// Persistence database directory; `None` keeps state in an ephemeral
    /// database.
    pub persistence_path: Option<PathBuf>,
    /// Durable subscription lifetime.
    pub subscriptions_ttl: Duration,
    /// Offline packet lifetime.
    pub packets_ttl: Duration,
    /// TTL sweep period.
    pub ttl_check_frequency: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 1883,
            base_retry_timeout: Duration::from_millis(1000),
            max_connections: 100_000,
            backend: BusBackend::InProcess,
            connect_timeout: Duration::from_secs(10),
            persistence_path: None,
            subscriptions_ttl: Duration::from_secs(3600),
            packets_ttl: Duration::from_secs(3600),
            ttl_check_frequency: Duration::from_secs(60),
        }
    }
}

impl BrokerConfig {
    pub(crate) fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.persistence_path.clone(),
            subscriptions_ttl: self.subscriptions_ttl,
            packets_ttl: self.packets_ttl,
            check_frequency: self.ttl_check_frequency,
        }
    }
}
