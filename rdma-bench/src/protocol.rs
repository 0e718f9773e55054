//! Handshake records carried as connection private data.
//!
//! Both records are plain old data and travel as their in-memory bytes.

use crate::{BenchError, Result};
use bytemuck::{Pod, Zeroable};
use std::mem::size_of;

/// Sent by the initiator with its connection request.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct ClientConnectionData {
    pub locations: i64,
    send: u8,
    _pad: [u8; 7],
}

impl ClientConnectionData {
    pub fn new(send: bool, locations: i64) -> Self {
        Self {
            locations,
            send: send as u8,
            _pad: [0; 7],
        }
    }

    pub fn send(&self) -> bool {
        self.send != 0
    }
}

/// Returned by the target when it accepts a connection.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct ServerConnectionData {
    pub address: u64,
    pub size: u64,
    pub rkey: u32,
    inline: u8,
    _pad: [u8; 3],
}

impl ServerConnectionData {
    pub fn new(address: u64, size: u64, rkey: u32, inline: bool) -> Self {
        Self {
            address,
            size,
            rkey,
            inline: inline as u8,
            _pad: [0; 3],
        }
    }

    pub fn inline(&self) -> bool {
        self.inline != 0
    }
}

pub fn encode<T: Pod>(record: &T) -> &[u8] {
    bytemuck::bytes_of(record)
}

/// Decodes a record from the front of `payload`; trailing bytes are ignored
/// since connection managers may pad private data.
pub fn decode<T: Pod>(payload: &[u8]) -> Result<T> {
    let expected = size_of::<T>();
    if payload.len() < expected {
        return Err(BenchError::protocol(format!(
            "handshake record too short: expected {expected} bytes, got {}",
            payload.len()
        )));
    }
    Ok(bytemuck::pod_read_unaligned(&payload[..expected]))
}

/// The remote buffer as advertised by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTarget {
    pub address: u64,
    pub size: u64,
    pub rkey: u32,
    pub inline: bool,
    pub send: bool,
}

impl RemoteTarget {
    pub fn new(server: &ServerConnectionData, send: bool) -> Self {
        Self {
            address: server.address,
            size: server.size,
            rkey: server.rkey,
            inline: server.inline(),
            send,
        }
    }

    /// Fails unless `max_location` locations of `aligned_size` bytes fit in
    /// the remote buffer.
    pub fn check_footprint(&self, aligned_size: usize, max_location: usize) -> Result<()> {
        let required = (aligned_size as u64)
            .checked_mul(max_location as u64)
            .ok_or_else(|| BenchError::config("remote footprint overflows"))?;
        if required > self.size {
            return Err(BenchError::config(format!(
                "requested {max_location} locations of {aligned_size} bytes ({required} bytes) \
                 but the target only exposes {} bytes",
                self.size
            )));
        }
        Ok(())
    }
}
