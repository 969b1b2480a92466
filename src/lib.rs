// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// SPDX-License-Identifier: MIT

//! An MQTT 3.1 broker with durable sessions, retained messages and offline
//! packet queues.

pub mod auth;
pub mod broker;
pub mod bus;
pub mod config;
mod connection;
pub mod error;
pub mod matcher;
pub mod packet;
pub mod session;
pub mod store;
pub mod tracing_setup;
pub mod transport;

pub use auth::{AllowAll, Security};
pub use broker::{Broker, BrokerEvent};
pub use config::{BrokerConfig, BusBackend};
pub use error::{Error, ProtocolError, Result};
