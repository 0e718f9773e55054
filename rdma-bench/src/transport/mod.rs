//! The narrow capability interface the benchmark consumes from an RDMA
//! stack: connection management, memory registration, work request posting
//! and completion polling.
//!
//! Two backends implement it: [`loopback`], an in-process software fabric,
//! and `verbs` (behind the `verbs` feature), which drives librdmacm and
//! libibverbs.

pub mod loopback;
#[cfg(feature = "verbs")]
pub mod verbs;

use crate::Result;
use crate::config::Opcode;
use crate::memory::PageBuffer;
use std::fmt::{Display, Formatter};
use std::io;
use std::net::SocketAddr;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;

/// Identity of the device a connection is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u64);

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev@{:#x}", self.0)
    }
}

/// The subset of device attributes the benchmark sizes its resources with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    pub max_qp_rd_atom: u32,
    pub max_qp_wr: u32,
    pub max_cqe: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacities {
    pub cq_entries: u32,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_inline_data: u32,
}

impl Capacities {
    /// Clamps the queue sizes to what the device supports.
    pub fn fit(self, caps: &DeviceCaps) -> Self {
        Self {
            cq_entries: self.cq_entries.min(caps.max_cqe),
            max_send_wr: self.max_send_wr.min(caps.max_qp_wr),
            max_recv_wr: self.max_recv_wr.min(caps.max_qp_wr),
            max_inline_data: self.max_inline_data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptParams {
    pub responder_resources: u8,
    pub initiator_depth: u8,
}

impl AcceptParams {
    pub fn from_caps(caps: &DeviceCaps) -> Self {
        let depth = caps.max_qp_rd_atom.min(u8::MAX as u32) as u8;
        Self {
            responder_resources: depth,
            initiator_depth: depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access(u8);

impl Access {
    pub const LOCAL_WRITE: Access = Access(1);
    pub const REMOTE_READ: Access = Access(1 << 1);
    pub const REMOTE_WRITE: Access = Access(1 << 2);
    pub const REMOTE_ATOMIC: Access = Access(1 << 3);
    pub const ALL: Access = Access(0b1111);

    pub fn contains(self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Access {
    type Output = Access;

    fn bitor(self, rhs: Self) -> Self::Output {
        Access(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSlice {
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSlice {
    pub addr: u64,
    pub rkey: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkRequest {
    pub id: u64,
    pub opcode: Opcode,
    pub local: LocalSlice,
    pub remote: RemoteSlice,
    pub signaled: bool,
    pub inline: bool,
    pub compare_add: u64,
    pub swap: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompletionStatus {
    #[default]
    Success,
    Error(&'static str),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    pub id: u64,
    pub status: CompletionStatus,
}

impl Completion {
    pub fn is_valid(&self) -> bool {
        self.status == CompletionStatus::Success
    }
}

pub trait MemoryRegion: Send + Sync {
    fn buffer(&self) -> &Arc<PageBuffer>;
    fn lkey(&self) -> u32;
    fn rkey(&self) -> u32;

    fn local(&self, offset: usize, len: usize) -> LocalSlice {
        debug_assert!(offset + len <= self.buffer().len());
        LocalSlice {
            addr: self.buffer().addr() + offset as u64,
            len: len as u32,
            lkey: self.lkey(),
        }
    }
}

pub trait QueuePair: Send {
    /// Posts a send-queue work request.
    ///
    /// # Safety
    ///
    /// `wr.local` must lie in a memory region that stays registered until the
    /// request's completion has been observed (or accounted for by a later
    /// signaled completion).
    unsafe fn post(&mut self, wr: &WorkRequest) -> io::Result<()>;

    /// Posts a receive buffer for two-sided sends.
    ///
    /// # Safety
    ///
    /// Same contract as [`QueuePair::post`] for `local`.
    unsafe fn post_receive(&mut self, local: LocalSlice, id: u64) -> io::Result<()>;

    /// Non-blocking; returns how many entries of `completions` were filled.
    fn poll(&mut self, completions: &mut [Completion]) -> io::Result<usize>;
}

pub trait Connection: Send {
    type Region: MemoryRegion;
    type QueuePair: QueuePair;

    fn register_memory(&self, buffer: Arc<PageBuffer>, access: Access) -> Result<Self::Region>;
    fn query_device(&self) -> Result<DeviceCaps>;
    fn queue_pair(&mut self) -> &mut Self::QueuePair;
    /// Non-blocking: whether the peer is still connected.
    fn is_connected(&mut self) -> bool;
}

/// An incoming connection request that has not been accepted yet.
pub trait ConnectRequest: Send {
    type Region: MemoryRegion;
    type Connection: Connection<Region = Self::Region>;

    fn device(&self) -> DeviceId;
    fn local_addr(&self) -> Option<SocketAddr>;
    fn peer_addr(&self) -> Option<SocketAddr>;
    fn private_data(&self) -> &[u8];
    fn query_device(&self) -> Result<DeviceCaps>;
    fn register_memory(&self, buffer: Arc<PageBuffer>, access: Access) -> Result<Self::Region>;
    fn accept(
        self,
        capacities: &Capacities,
        params: &AcceptParams,
        private_data: &[u8],
    ) -> Result<Self::Connection>;
}

pub trait Listener: Send {
    type Request: ConnectRequest;

    fn local_addr(&self) -> SocketAddr;
    fn accept_connection(&mut self) -> Result<Self::Request>;
}

pub trait Transport: Send + Sync {
    type Region: MemoryRegion + 'static;
    type Connection: Connection<Region = Self::Region> + 'static;
    type Request: ConnectRequest<Region = Self::Region, Connection = Self::Connection>;
    type Listener: Listener<Request = Self::Request>;

    /// Resolves `addr`, creates the connection's queue pair with `capacities`
    /// and connects, carrying `private_data` in the request. Returns the
    /// established connection and the private data of the peer's accept.
    fn resolve_and_connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        capacities: &Capacities,
        private_data: &[u8],
    ) -> Result<(Self::Connection, Vec<u8>)>;

    fn listen(&self, addr: SocketAddr) -> Result<Self::Listener>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacities_fit_device_limits() {
        let caps = DeviceCaps {
            max_qp_rd_atom: 300,
            max_qp_wr: 256,
            max_cqe: 128,
        };
        let wanted = Capacities {
            cq_entries: 512,
            max_send_wr: 128,
            max_recv_wr: 512,
            max_inline_data: 64,
        };
        assert_eq!(
            wanted.fit(&caps),
            Capacities {
                cq_entries: 128,
                max_send_wr: 128,
                max_recv_wr: 256,
                max_inline_data: 64,
            }
        );
        assert_eq!(AcceptParams::from_caps(&caps).initiator_depth, u8::MAX);
    }
}
