//! An in-process fabric that behaves like a reliable-connected RDMA link.
//!
//! Listeners are keyed by socket address and memory regions by key. One-sided
//! operations execute against the peer's registered memory when they are
//! posted; sends are queued in the peer's inbox and land in its posted
//! receives when the peer polls. Completions are delivered in posting order,
//! unsignaled requests occupy the send queue until a later signaled
//! completion is polled, and a failed request moves the queue pair into the
//! error state so every later request is flushed.

use super::{
    AcceptParams, Access, Capacities, Completion, CompletionStatus, ConnectRequest, Connection,
    DeviceCaps, DeviceId, Listener, LocalSlice, MemoryRegion, QueuePair, Transport, WorkRequest,
};
use crate::config::Opcode;
use crate::memory::PageBuffer;
use crate::{BenchError, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use tracing::{debug, instrument, trace};

/// Private data limits of an RDMA CM connect request and accept reply.
pub const CONNECT_PRIVATE_DATA_MAX: usize = 56;
pub const ACCEPT_PRIVATE_DATA_MAX: usize = 196;

pub const DEVICE: DeviceId = DeviceId(1);
pub const DEVICE_CAPS: DeviceCaps = DeviceCaps {
    max_qp_rd_atom: 16,
    max_qp_wr: 16384,
    max_cqe: 65536,
};

const FIRST_EPHEMERAL_PORT: u32 = 49152;

const LOC_LEN_ERR: &str = "local length error";
const LOC_PROT_ERR: &str = "local protection error";
const REM_ACCESS_ERR: &str = "remote access error";
const REM_INV_REQ_ERR: &str = "remote invalid request error";
const RETRY_EXC_ERR: &str = "transport retry counter exceeded";
const WR_FLUSH_ERR: &str = "Work Request Flushed Error";

#[derive(Clone, Default)]
pub struct LoopbackFabric {
    inner: Arc<Fabric>,
}

#[derive(Default)]
struct Fabric {
    listeners: Mutex<HashMap<SocketAddr, Sender<Pending>>>,
    regions: RwLock<HashMap<u32, RegionEntry>>,
    next_key: AtomicU32,
    next_port: AtomicU32,
    registrations: AtomicUsize,
    open_connections: AtomicUsize,
}

#[derive(Clone)]
struct RegionEntry {
    buffer: Arc<PageBuffer>,
    access: Access,
}

/// A connection request travelling from `resolve_and_connect` to a listener.
struct Pending {
    private_data: Vec<u8>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    initiator_inbox: Sender<Vec<u8>>,
    reply: Sender<Accepted>,
}

struct Accepted {
    private_data: Vec<u8>,
    inbox: Sender<Vec<u8>>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory registrations performed so far, including released ones.
    pub fn registrations(&self) -> usize {
        self.inner.registrations.load(Ordering::Relaxed)
    }

    /// Regions currently registered.
    pub fn registered_regions(&self) -> usize {
        self.inner.regions().len()
    }

    /// Initiator-side connections that have not been dropped yet.
    pub fn open_connections(&self) -> usize {
        self.inner.open_connections.load(Ordering::Relaxed)
    }
}

impl Fabric {
    fn regions(&self) -> RwLockReadGuard<'_, HashMap<u32, RegionEntry>> {
        self.regions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(self: &Arc<Self>, buffer: Arc<PageBuffer>, access: Access) -> LoopbackRegion {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed) + 1;
        self.regions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, RegionEntry {
                buffer: buffer.clone(),
                access,
            });
        self.registrations.fetch_add(1, Ordering::Relaxed);
        trace!(key, addr = buffer.addr(), len = buffer.len(), "registered");
        LoopbackRegion {
            fabric: self.clone(),
            key,
            buffer,
        }
    }

    /// Finds the listener bound to `addr`, or to the wildcard address on the
    /// same port.
    fn listener(&self, addr: SocketAddr) -> Option<Sender<Pending>> {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let wildcard = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        listeners
            .get(&addr)
            .or_else(|| listeners.get(&SocketAddr::new(wildcard, addr.port())))
            .cloned()
    }

    fn ephemeral_addr(&self, towards: SocketAddr) -> SocketAddr {
        let port = FIRST_EPHEMERAL_PORT + self.next_port.fetch_add(1, Ordering::Relaxed) % 16384;
        let ip = match towards.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        SocketAddr::new(ip, port as u16)
    }
}

fn padded(data: &[u8], limit: usize, context: &'static str) -> Result<Vec<u8>> {
    if data.len() > limit {
        return Err(BenchError::transport(
            context,
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("private data of {} bytes exceeds {limit}", data.len()),
            ),
        ));
    }
    let mut padded = data.to_vec();
    padded.resize(limit, 0);
    Ok(padded)
}

impl Transport for LoopbackFabric {
    type Region = LoopbackRegion;
    type Connection = LoopbackConnection;
    type Request = LoopbackRequest;
    type Listener = LoopbackListener;

    #[instrument(skip(self, capacities, private_data), err)]
    fn resolve_and_connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        capacities: &Capacities,
        private_data: &[u8],
    ) -> Result<(LoopbackConnection, Vec<u8>)> {
        let private_data = padded(private_data, CONNECT_PRIVATE_DATA_MAX, "rdma_connect")?;
        let refused = || {
            BenchError::transport(
                "rdma_connect",
                io::Error::new(io::ErrorKind::ConnectionRefused, format!("{addr} rejected the connection")),
            )
        };
        let listener = self.inner.listener(addr).ok_or_else(|| {
            BenchError::transport(
                "rdma_resolve_addr",
                io::Error::new(io::ErrorKind::ConnectionRefused, format!("nothing listens on {addr}")),
            )
        })?;

        let (inbox_tx, inbox_rx) = channel::unbounded();
        let (reply_tx, reply_rx) = channel::bounded(1);
        let pending = Pending {
            private_data,
            local_addr: addr,
            peer_addr: self.inner.ephemeral_addr(addr),
            initiator_inbox: inbox_tx,
            reply: reply_tx,
        };
        listener.send(pending).map_err(|_| refused())?;

        let accepted = reply_rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => BenchError::transport(
                "rdma_connect",
                io::Error::new(io::ErrorKind::TimedOut, format!("no answer from {addr} within {timeout:?}")),
            ),
            RecvTimeoutError::Disconnected => refused(),
        })?;
        debug!(%addr, "connected");

        let qp = LoopbackQueuePair::new(self.inner.clone(), *capacities, accepted.inbox, inbox_rx);
        Ok((
            LoopbackConnection::new(self.inner.clone(), qp, true),
            accepted.private_data,
        ))
    }

    #[instrument(skip(self), err)]
    fn listen(&self, addr: SocketAddr) -> Result<LoopbackListener> {
        let mut listeners = self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if listeners.contains_key(&addr) {
            return Err(BenchError::transport(
                "rdma_bind_addr",
                io::Error::new(io::ErrorKind::AddrInUse, format!("{addr} is already bound")),
            ));
        }
        let (tx, rx) = channel::unbounded();
        listeners.insert(addr, tx);
        Ok(LoopbackListener {
            fabric: self.inner.clone(),
            addr,
            requests: rx,
        })
    }
}

pub struct LoopbackListener {
    fabric: Arc<Fabric>,
    addr: SocketAddr,
    requests: Receiver<Pending>,
}

impl Listener for LoopbackListener {
    type Request = LoopbackRequest;

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn accept_connection(&mut self) -> Result<LoopbackRequest> {
        let pending = self.requests.recv().map_err(|_| {
            BenchError::transport("rdma_get_request", io::ErrorKind::ConnectionAborted.into())
        })?;
        Ok(LoopbackRequest {
            fabric: self.fabric.clone(),
            pending,
        })
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.fabric
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.addr);
    }
}

/// Dropping a request without accepting it rejects the connection.
pub struct LoopbackRequest {
    fabric: Arc<Fabric>,
    pending: Pending,
}

impl ConnectRequest for LoopbackRequest {
    type Region = LoopbackRegion;
    type Connection = LoopbackConnection;

    fn device(&self) -> DeviceId {
        DEVICE
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.pending.local_addr)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.pending.peer_addr)
    }

    fn private_data(&self) -> &[u8] {
        &self.pending.private_data
    }

    fn query_device(&self) -> Result<DeviceCaps> {
        Ok(DEVICE_CAPS)
    }

    fn register_memory(&self, buffer: Arc<PageBuffer>, access: Access) -> Result<LoopbackRegion> {
        Ok(self.fabric.register(buffer, access))
    }

    fn accept(
        self,
        capacities: &Capacities,
        params: &AcceptParams,
        private_data: &[u8],
    ) -> Result<LoopbackConnection> {
        let private_data = padded(private_data, ACCEPT_PRIVATE_DATA_MAX, "rdma_accept")?;
        if params.responder_resources as u32 > DEVICE_CAPS.max_qp_rd_atom
            || params.initiator_depth as u32 > DEVICE_CAPS.max_qp_rd_atom
        {
            return Err(BenchError::transport(
                "rdma_accept",
                io::Error::new(io::ErrorKind::InvalidInput, format!("{params:?} exceeds device limits")),
            ));
        }

        let (inbox_tx, inbox_rx) = channel::unbounded();
        self.pending
            .reply
            .send(Accepted {
                private_data,
                inbox: inbox_tx,
            })
            .map_err(|_| {
                BenchError::transport(
                    "rdma_accept",
                    io::Error::new(io::ErrorKind::ConnectionAborted, "the peer stopped waiting"),
                )
            })?;

        let qp = LoopbackQueuePair::new(
            self.fabric.clone(),
            *capacities,
            self.pending.initiator_inbox,
            inbox_rx,
        );
        Ok(LoopbackConnection::new(self.fabric, qp, false))
    }
}

pub struct LoopbackConnection {
    fabric: Arc<Fabric>,
    qp: LoopbackQueuePair,
    active: bool,
}

impl LoopbackConnection {
    fn new(fabric: Arc<Fabric>, qp: LoopbackQueuePair, active: bool) -> Self {
        if active {
            fabric.open_connections.fetch_add(1, Ordering::Relaxed);
        }
        Self { fabric, qp, active }
    }
}

impl Connection for LoopbackConnection {
    type Region = LoopbackRegion;
    type QueuePair = LoopbackQueuePair;

    fn register_memory(&self, buffer: Arc<PageBuffer>, access: Access) -> Result<LoopbackRegion> {
        Ok(self.fabric.register(buffer, access))
    }

    fn query_device(&self) -> Result<DeviceCaps> {
        Ok(DEVICE_CAPS)
    }

    fn queue_pair(&mut self) -> &mut LoopbackQueuePair {
        &mut self.qp
    }

    fn is_connected(&mut self) -> bool {
        match self.qp.deliver() {
            Ok(()) => true,
            Err(e) => e.kind() != io::ErrorKind::ConnectionReset,
        }
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        if self.active {
            self.fabric.open_connections.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Deregisters on drop.
pub struct LoopbackRegion {
    fabric: Arc<Fabric>,
    key: u32,
    buffer: Arc<PageBuffer>,
}

impl MemoryRegion for LoopbackRegion {
    fn buffer(&self) -> &Arc<PageBuffer> {
        &self.buffer
    }

    fn lkey(&self) -> u32 {
        self.key
    }

    fn rkey(&self) -> u32 {
        self.key
    }
}

impl Drop for LoopbackRegion {
    fn drop(&mut self) {
        self.fabric
            .regions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

pub struct LoopbackQueuePair {
    fabric: Arc<Fabric>,
    capacities: Capacities,
    peer: Sender<Vec<u8>>,
    inbox: Receiver<Vec<u8>>,
    arrived: VecDeque<Vec<u8>>,
    receives: VecDeque<(LocalSlice, u64)>,
    /// Completions paired with the number of send queue entries they retire.
    cq: VecDeque<(Completion, usize)>,
    send_queue: usize,
    unsignaled: usize,
    failed: bool,
}

impl LoopbackQueuePair {
    fn new(fabric: Arc<Fabric>, capacities: Capacities, peer: Sender<Vec<u8>>, inbox: Receiver<Vec<u8>>) -> Self {
        Self {
            fabric,
            capacities,
            peer,
            inbox,
            arrived: VecDeque::new(),
            receives: VecDeque::new(),
            cq: VecDeque::new(),
            send_queue: 0,
            unsignaled: 0,
            failed: false,
        }
    }

    fn complete(&mut self, id: u64, status: CompletionStatus) {
        let retire = mem::take(&mut self.unsignaled);
        self.cq.push_back((Completion { id, status }, retire));
    }

    /// # Safety
    ///
    /// Registered regions must stay allocated while they are in the registry,
    /// which `LoopbackRegion` guarantees by holding the buffer.
    unsafe fn execute(&self, wr: &WorkRequest) -> std::result::Result<(), &'static str> {
        let regions = self.fabric.regions();
        let len = wr.local.len as usize;
        let local = regions
            .get(&wr.local.lkey)
            .filter(|r| r.buffer.contains(wr.local.addr, len))
            .ok_or(LOC_PROT_ERR)?;
        let remote = |access: Access, len: usize| {
            regions
                .get(&wr.remote.rkey)
                .filter(|r| r.access.contains(access) && r.buffer.contains(wr.remote.addr, len))
                .ok_or(REM_ACCESS_ERR)
        };

        match wr.opcode {
            Opcode::Send => {
                // SAFETY: the slice lies in a registered region.
                let payload = unsafe { slice::from_raw_parts(wr.local.addr as *const u8, len) }.to_vec();
                self.peer.send(payload).map_err(|_| RETRY_EXC_ERR)?;
            }
            Opcode::Write => {
                remote(Access::REMOTE_WRITE, len)?;
                // SAFETY: both ranges were bounds checked against live regions.
                unsafe { ptr::copy(wr.local.addr as *const u8, wr.remote.addr as *mut u8, len) };
            }
            Opcode::Read => {
                if !local.access.contains(Access::LOCAL_WRITE) {
                    return Err(LOC_PROT_ERR);
                }
                remote(Access::REMOTE_READ, len)?;
                // SAFETY: as above.
                unsafe { ptr::copy(wr.remote.addr as *const u8, wr.local.addr as *mut u8, len) };
            }
            Opcode::FetchAdd | Opcode::CompareSwap => {
                if len != 8 {
                    return Err(LOC_LEN_ERR);
                }
                if !local.access.contains(Access::LOCAL_WRITE) {
                    return Err(LOC_PROT_ERR);
                }
                remote(Access::REMOTE_ATOMIC, 8)?;
                if wr.remote.addr % 8 != 0 {
                    return Err(REM_INV_REQ_ERR);
                }
                // SAFETY: aligned, in bounds of a live region, and only ever
                // accessed atomically by the fabric.
                let word = unsafe { AtomicU64::from_ptr(wr.remote.addr as *mut u64) };
                let old = if wr.opcode == Opcode::FetchAdd {
                    word.fetch_add(wr.compare_add, Ordering::AcqRel)
                } else {
                    match word.compare_exchange(wr.compare_add, wr.swap, Ordering::AcqRel, Ordering::Acquire) {
                        Ok(old) | Err(old) => old,
                    }
                };
                // SAFETY: the local slice is 8 bytes of a live region.
                unsafe { ptr::write_unaligned(wr.local.addr as *mut u64, old) };
            }
        }
        Ok(())
    }

    /// Moves arrived messages into posted receives.
    fn deliver(&mut self) -> io::Result<()> {
        loop {
            match self.inbox.try_recv() {
                Ok(message) => self.arrived.push_back(message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.arrived.is_empty() && self.cq.is_empty() {
                        return Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer disconnected"));
                    }
                    break;
                }
            }
        }

        while !self.arrived.is_empty() && !self.receives.is_empty() {
            let (Some(message), Some((local, id))) = (self.arrived.pop_front(), self.receives.pop_front()) else {
                break;
            };
            let status = match self.land(&message, local) {
                Ok(()) => CompletionStatus::Success,
                Err(status) => CompletionStatus::Error(status),
            };
            self.cq.push_back((Completion { id, status }, 0));
        }
        Ok(())
    }

    fn land(&self, message: &[u8], local: LocalSlice) -> std::result::Result<(), &'static str> {
        if message.len() > local.len as usize {
            return Err(LOC_LEN_ERR);
        }
        let regions = self.fabric.regions();
        regions
            .get(&local.lkey)
            .filter(|r| r.access.contains(Access::LOCAL_WRITE) && r.buffer.contains(local.addr, message.len()))
            .ok_or(LOC_PROT_ERR)?;
        // SAFETY: bounds checked against a live region above.
        unsafe { ptr::copy_nonoverlapping(message.as_ptr(), local.addr as *mut u8, message.len()) };
        Ok(())
    }
}

impl QueuePair for LoopbackQueuePair {
    unsafe fn post(&mut self, wr: &WorkRequest) -> io::Result<()> {
        if self.send_queue >= self.capacities.max_send_wr as usize {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "send queue is full"));
        }
        if wr.inline && wr.local.len > self.capacities.max_inline_data {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} bytes exceed the inline limit of {}",
                    wr.local.len, self.capacities.max_inline_data
                ),
            ));
        }
        self.send_queue += 1;
        self.unsignaled += 1;

        let outcome = if self.failed {
            Err(WR_FLUSH_ERR)
        } else {
            // SAFETY: forwarded caller contract.
            unsafe { self.execute(wr) }
        };
        match outcome {
            Ok(()) if !wr.signaled => {}
            Ok(()) => self.complete(wr.id, CompletionStatus::Success),
            Err(status) => {
                self.failed = true;
                self.complete(wr.id, CompletionStatus::Error(status));
            }
        }
        Ok(())
    }

    unsafe fn post_receive(&mut self, local: LocalSlice, id: u64) -> io::Result<()> {
        if self.receives.len() >= self.capacities.max_recv_wr as usize {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "receive queue is full"));
        }
        self.receives.push_back((local, id));
        Ok(())
    }

    fn poll(&mut self, completions: &mut [Completion]) -> io::Result<usize> {
        self.deliver()?;
        if self.cq.len() > self.capacities.cq_entries as usize {
            return Err(io::Error::other(format!(
                "completion queue overrun: {} entries for a queue of {}",
                self.cq.len(),
                self.capacities.cq_entries
            )));
        }

        let mut polled = 0;
        for slot in completions.iter_mut() {
            let Some((completion, retire)) = self.cq.pop_front() else {
                break;
            };
            *slot = completion;
            self.send_queue -= retire;
            polled += 1;
        }
        Ok(polled)
    }
}
