// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// SPDX-License-Identifier: MIT

//! Framed packet I/O over a split TCP stream.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{ProtocolError, Result};
use crate::packet::{decode_packet, encode_packet, Packet};

/// Reading half of an MQTT connection.
///
/// Accumulates bytes in an internal buffer and decodes complete packets.
/// `read` keeps its state in the buffer between polls, so the returned
/// future can be dropped by a `select!` without losing data.
pub struct PacketReader {
    io: OwnedReadHalf,
    buf: BytesMut,
}

/// Writing half of an MQTT connection.
pub struct PacketWriter {
    io: OwnedWriteHalf,
    buf: Vec<u8>,
}

/// Split a TCP stream into framed packet halves.
pub fn split(stream: TcpStream) -> (PacketReader, PacketWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        PacketReader {
            io: read_half,
            buf: BytesMut::with_capacity(4096),
        },
        PacketWriter {
            io: write_half,
            buf: Vec::with_capacity(1024),
        },
    )
}

impl PacketReader {
    /// Read the next packet. Returns `None` on a clean end of stream.
    pub async fn read(&mut self) -> Result<Option<Packet>> {
        loop {
            if let Some((packet, consumed)) = decode_packet(&self.buf)? {
                self.buf.advance(consumed);
                return Ok(Some(packet));
            }

            let n = self.io.read_buf(&mut self.buf).await?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(ProtocolError::IncompletePacket {
                        needed: 1,
                        have: self.buf.len(),
                    }
                    .into())
                };
            }
        }
    }
}

impl PacketWriter {
    /// Encode and transmit a packet.
    pub async fn write(&mut self, packet: &Packet) -> Result<()> {
        self.buf.clear();
        encode_packet(packet, &mut self.buf);
        self.io.write_all(&self.buf).await?;
        Ok(())
    }

    /// Flush and shut down the write side.
    pub async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}
