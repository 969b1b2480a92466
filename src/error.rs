// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// SPDX-License-Identifier: MIT

use std::io;

use thiserror::Error;

/// Top-level broker error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] sled::Error),

    #[error("Record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// An authentication/authorization hook itself failed.
    #[error("Authorization hook failed: {0}")]
    Auth(String),

    /// A hook returned a deny verdict.
    #[error("Not authorized")]
    NotAuthorized,

    #[error("Bus is closed")]
    BusClosed,
}

/// MQTT wire protocol errors. All of these end the offending stream.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("Incomplete packet: need {needed} bytes, have {have}")]
    IncompletePacket { needed: usize, have: usize },

    #[error("Invalid protocol name: '{0}'")]
    InvalidProtocolName(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("Invalid connect flags: {0:#04x}")]
    InvalidConnectFlags(u8),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("First packet must be CONNECT")]
    FirstPacketNotConnect,

    #[error("Unexpected packet: {0}")]
    UnexpectedPacket(&'static str),

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),
}

pub type Result<T> = std::result::Result<T, Error>;
