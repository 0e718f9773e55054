//! librdmacm + libibverbs backend.
//!
//! The listening id is synchronous: `rdma_get_request` and `rdma_accept` block
//! until their events arrive. Initiator ids live on a non-blocking event
//! channel so that every connection step is bounded by the caller's timeout,
//! and accepted ids are migrated to one once established so that a
//! disconnect can be noticed without blocking. The handshake records travel
//! as connection private data.

use super::{
    AcceptParams, Access, Capacities, Completion, CompletionStatus, ConnectRequest, Connection,
    DeviceCaps, DeviceId, Listener, LocalSlice, MemoryRegion, QueuePair, Transport, WorkRequest,
};
use crate::config::Opcode;
use crate::memory::PageBuffer;
use crate::{BenchError, Result};
use rdma_sys::*;
use std::collections::HashMap;
use std::ffi::CStr;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::raw::{c_int, c_void};
use std::ptr::{self, null_mut};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use std::{io, mem, slice};
use tracing::{debug, instrument, trace, warn};

const LISTEN_BACKLOG: c_int = 128;
const RETRY_COUNT: u8 = 7;
const RNR_RETRY_COUNT: u8 = 7;

/// Protection domains by device context, shared by every id on the device so
/// that a region registered once serves all of its queue pairs.
#[derive(Default)]
struct Domains(Mutex<HashMap<usize, usize>>);

impl Domains {
    fn get(&self, context: *mut ibv_context) -> Result<*mut ibv_pd> {
        let mut domains = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&pd) = domains.get(&(context as usize)) {
            return Ok(pd as *mut ibv_pd);
        }
        // SAFETY: `context` belongs to a live id.
        let pd = unsafe { ibv_alloc_pd(context) };
        if pd.is_null() {
            return Err(BenchError::transport("ibv_alloc_pd", io::Error::last_os_error()));
        }
        domains.insert(context as usize, pd as usize);
        Ok(pd)
    }
}

/// Protection domains live as long as the process; regions and queue pairs
/// may outlive any single `Verbs` handle.
#[derive(Clone, Default)]
pub struct Verbs {
    domains: Arc<Domains>,
}

impl Verbs {
    pub fn new() -> Self {
        Self::default()
    }
}

fn last_error(context: &'static str) -> BenchError {
    BenchError::transport(context, io::Error::last_os_error())
}

fn check(rc: c_int, context: &'static str) -> Result<()> {
    if rc == 0 { Ok(()) } else { Err(last_error(context)) }
}

fn to_sockaddr(addr: SocketAddr) -> libc::sockaddr_storage {
    // SAFETY: all-zero is a valid sockaddr_storage.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in>();
            // SAFETY: sockaddr_storage is large and aligned enough for any
            // socket address.
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                };
            }
        }
        SocketAddr::V6(v6) => {
            let sin6 = ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in6>();
            // SAFETY: as above.
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                (*sin6).sin6_scope_id = v6.scope_id();
            }
        }
    }
    storage
}

/// # Safety
///
/// `storage` must point to a readable `sockaddr_storage`.
unsafe fn from_sockaddr(storage: *const libc::sockaddr_storage) -> Option<SocketAddr> {
    // SAFETY: caller contract; the family tag selects the layout.
    unsafe {
        match (*storage).ss_family as c_int {
            libc::AF_INET => {
                let sin = &*storage.cast::<libc::sockaddr_in>();
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                let sin6 = &*storage.cast::<libc::sockaddr_in6>();
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }
}

/// Source and destination of an id's route: `struct rdma_addr` starts with
/// two `sockaddr_storage` sized unions.
///
/// # Safety
///
/// `id` must be a live id.
unsafe fn route_addrs(id: *mut rdma_cm_id) -> (Option<SocketAddr>, Option<SocketAddr>) {
    // SAFETY: caller contract.
    unsafe {
        let base = ptr::addr_of!((*id).route.addr).cast::<libc::sockaddr_storage>();
        (from_sockaddr(base), from_sockaddr(base.add(1)))
    }
}

/// # Safety
///
/// `context` must be an open device context.
unsafe fn query_device(context: *mut ibv_context) -> Result<DeviceCaps> {
    // SAFETY: caller contract; the attribute struct is plain data.
    unsafe {
        let mut attr: ibv_device_attr = mem::zeroed();
        let rc = ibv_query_device(context, &mut attr);
        if rc != 0 {
            return Err(BenchError::transport("ibv_query_device", io::Error::from_raw_os_error(rc)));
        }
        Ok(DeviceCaps {
            max_qp_rd_atom: attr.max_qp_rd_atom.max(0) as u32,
            max_qp_wr: attr.max_qp_wr.max(0) as u32,
            max_cqe: attr.max_cqe.max(0) as u32,
        })
    }
}

/// # Safety
///
/// `id` must be bound to a device.
unsafe fn device_name(id: *mut rdma_cm_id) -> String {
    // SAFETY: caller contract.
    unsafe {
        let name = ibv_get_device_name((*(*id).verbs).device);
        if name.is_null() {
            return "?".to_owned();
        }
        CStr::from_ptr(name).to_string_lossy().into_owned()
    }
}

fn access_flags(access: Access) -> c_int {
    let mut flags = ibv_access_flags(0);
    if access.contains(Access::LOCAL_WRITE) {
        flags = flags | ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
    }
    if access.contains(Access::REMOTE_READ) {
        flags = flags | ibv_access_flags::IBV_ACCESS_REMOTE_READ;
    }
    if access.contains(Access::REMOTE_WRITE) {
        flags = flags | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
    }
    if access.contains(Access::REMOTE_ATOMIC) {
        flags = flags | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC;
    }
    flags.0 as c_int
}

/// # Safety
///
/// `pd` must be a live protection domain.
unsafe fn register(pd: *mut ibv_pd, buffer: Arc<PageBuffer>, access: Access) -> Result<VerbsRegion> {
    // SAFETY: the buffer is kept alive by the region until deregistration.
    let mr = unsafe { ibv_reg_mr(pd, buffer.as_ptr().cast::<c_void>(), buffer.len(), access_flags(access)) };
    if mr.is_null() {
        return Err(last_error("ibv_reg_mr"));
    }
    // SAFETY: non-null result of ibv_reg_mr.
    let (lkey, rkey) = unsafe { ((*mr).lkey, (*mr).rkey) };
    trace!(lkey, rkey, addr = buffer.addr(), len = buffer.len(), "registered");
    Ok(VerbsRegion { mr, buffer, lkey, rkey })
}

/// The parts of a CM event that outlive its acknowledgement.
struct CmEvent {
    kind: rdma_cm_event_type::Type,
    status: c_int,
    private_data: Vec<u8>,
}

/// A non-blocking RDMA CM event channel.
struct EventChannel(*mut rdma_event_channel);

impl EventChannel {
    fn new() -> Result<Self> {
        // SAFETY: no preconditions.
        let channel = unsafe { rdma_create_event_channel() };
        if channel.is_null() {
            return Err(last_error("rdma_create_event_channel"));
        }
        let channel = Self(channel);
        let fd = channel.fd();
        // SAFETY: `fd` belongs to the channel.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(last_error("fcntl"));
        }
        Ok(channel)
    }

    fn fd(&self) -> c_int {
        // SAFETY: the channel is live.
        unsafe { (*self.0).fd }
    }

    /// Takes the next event off the channel, if one is pending.
    fn try_next(&self) -> Result<Option<CmEvent>> {
        let mut event = null_mut();
        // SAFETY: the channel is live.
        if unsafe { rdma_get_cm_event(self.0, &mut event) } != 0 {
            let e = io::Error::last_os_error();
            return match e.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(BenchError::transport("rdma_get_cm_event", e)),
            };
        }
        // SAFETY: the event stays valid until it is acknowledged.
        let copied = unsafe {
            CmEvent {
                kind: (*event).event,
                status: (*event).status,
                private_data: conn_private_data(event),
            }
        };
        // SAFETY: acknowledged exactly once.
        unsafe { rdma_ack_cm_event(event) };
        trace!(event = event_name(copied.kind), status = copied.status, "cm event");
        Ok(Some(copied))
    }

    /// Waits for `expected` until `deadline`. Any other event fails the step.
    fn wait(&self, expected: rdma_cm_event_type::Type, deadline: Instant, context: &'static str) -> Result<CmEvent> {
        loop {
            if let Some(event) = self.try_next()? {
                if event.kind == expected {
                    return Ok(event);
                }
                return Err(BenchError::transport(
                    context,
                    io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("{} (status {})", event_name(event.kind), event.status),
                    ),
                ));
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(BenchError::transport(
                    context,
                    io::Error::new(io::ErrorKind::TimedOut, format!("no {} in time", event_name(expected))),
                ));
            }
            let mut pollfd = libc::pollfd {
                fd: self.fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ms = left.as_millis().clamp(1, c_int::MAX as u128) as c_int;
            // SAFETY: one valid pollfd.
            if unsafe { libc::poll(&mut pollfd, 1, ms) } < 0 {
                let e = io::Error::last_os_error();
                if e.kind() != io::ErrorKind::Interrupted {
                    return Err(BenchError::transport("poll", e));
                }
            }
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        // SAFETY: every id on the channel is destroyed before it.
        unsafe { rdma_destroy_event_channel(self.0) };
    }
}

fn event_name(kind: rdma_cm_event_type::Type) -> String {
    // SAFETY: rdma_event_str returns a static string for any value.
    unsafe {
        let name = rdma_event_str(kind);
        if name.is_null() {
            return format!("event {kind}");
        }
        CStr::from_ptr(name).to_string_lossy().into_owned()
    }
}

/// Owns an id and whatever has been attached to it so far.
struct Endpoint {
    id: *mut rdma_cm_id,
    cq: *mut ibv_cq,
    has_qp: bool,
    connected: bool,
    peer_gone: bool,
    // Dropped after the id is destroyed.
    channel: Option<EventChannel>,
}

impl Endpoint {
    fn new(id: *mut rdma_cm_id, channel: Option<EventChannel>) -> Self {
        Self {
            id,
            cq: null_mut(),
            has_qp: false,
            connected: false,
            peer_gone: false,
            channel,
        }
    }

    fn wait(&self, expected: rdma_cm_event_type::Type, deadline: Instant, context: &'static str) -> Result<CmEvent> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| BenchError::transport(context, io::ErrorKind::Unsupported.into()))?;
        channel.wait(expected, deadline, context)
    }

    /// Moves an established id onto its own channel.
    fn watch(&mut self) -> Result<()> {
        let channel = EventChannel::new()?;
        // SAFETY: both the id and the channel are live.
        check(unsafe { rdma_migrate_id(self.id, channel.0) }, "rdma_migrate_id")?;
        self.channel = Some(channel);
        Ok(())
    }

    /// Drains pending events; false once the peer disconnected.
    fn peer_connected(&mut self) -> bool {
        if self.peer_gone {
            return false;
        }
        let Some(channel) = &self.channel else {
            return true;
        };
        loop {
            match channel.try_next() {
                Ok(None) => return true,
                Ok(Some(event)) => match event.kind {
                    rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED
                    | rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL
                    | rdma_cm_event_type::RDMA_CM_EVENT_TIMEWAIT_EXIT => break,
                    _ => {}
                },
                Err(e) => {
                    warn!("watching connection failed: {e}");
                    break;
                }
            }
        }
        self.peer_gone = true;
        false
    }

    fn create_queue_pair(&mut self, pd: *mut ibv_pd, capacities: &Capacities) -> Result<()> {
        // SAFETY: `id` is bound to a device once we get here.
        unsafe {
            self.cq = ibv_create_cq((*self.id).verbs, capacities.cq_entries.max(1) as c_int, null_mut(), null_mut(), 0);
            if self.cq.is_null() {
                return Err(last_error("ibv_create_cq"));
            }

            let mut attr: ibv_qp_init_attr = mem::zeroed();
            attr.send_cq = self.cq;
            attr.recv_cq = self.cq;
            attr.qp_type = ibv_qp_type::IBV_QPT_RC;
            attr.sq_sig_all = 0;
            attr.cap.max_send_wr = capacities.max_send_wr;
            attr.cap.max_recv_wr = capacities.max_recv_wr;
            attr.cap.max_send_sge = 1;
            attr.cap.max_recv_sge = 1;
            attr.cap.max_inline_data = capacities.max_inline_data;
            check(rdma_create_qp(self.id, pd, &mut attr), "rdma_create_qp")?;
        }
        self.has_qp = true;
        Ok(())
    }

    fn queue_pair(&self, capacities: &Capacities) -> VerbsQueuePair {
        // SAFETY: only called after `create_queue_pair` succeeded.
        let qp = unsafe { (*self.id).qp };
        // SAFETY: ibv_wc is plain data.
        let wc: ibv_wc = unsafe { mem::zeroed() };
        VerbsQueuePair {
            qp,
            cq: self.cq,
            wcs: vec![wc; capacities.cq_entries.max(1) as usize],
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // SAFETY: teardown in reverse order of creation; every handle is
        // owned by this endpoint.
        unsafe {
            if self.connected {
                rdma_disconnect(self.id);
            }
            if self.has_qp {
                rdma_destroy_qp(self.id);
            }
            if !self.cq.is_null() {
                ibv_destroy_cq(self.cq);
            }
            rdma_destroy_id(self.id);
        }
    }
}

fn conn_param(private_data: &[u8], params: &AcceptParams) -> rdma_conn_param {
    // SAFETY: plain data.
    let mut param: rdma_conn_param = unsafe { mem::zeroed() };
    param.private_data = private_data.as_ptr().cast::<c_void>();
    param.private_data_len = private_data.len().min(u8::MAX as usize) as u8;
    param.responder_resources = params.responder_resources;
    param.initiator_depth = params.initiator_depth;
    param.retry_count = RETRY_COUNT;
    param.rnr_retry_count = RNR_RETRY_COUNT;
    param
}

/// Copies the private data of the id's current event.
///
/// # Safety
///
/// `id` must be a live synchronous id.
unsafe fn event_private_data(id: *mut rdma_cm_id) -> Vec<u8> {
    // SAFETY: caller contract; the event and its private data stay valid
    // until the next CM call on this id.
    unsafe { conn_private_data((*id).event) }
}

/// # Safety
///
/// `event` must be null or an unacknowledged event.
unsafe fn conn_private_data(event: *const rdma_cm_event) -> Vec<u8> {
    // SAFETY: caller contract.
    unsafe {
        if event.is_null() {
            return Vec::new();
        }
        let conn = (*event).param.conn;
        if conn.private_data.is_null() {
            return Vec::new();
        }
        slice::from_raw_parts(conn.private_data.cast::<u8>(), conn.private_data_len as usize).to_vec()
    }
}

impl Transport for Verbs {
    type Region = VerbsRegion;
    type Connection = VerbsConnection;
    type Request = VerbsRequest;
    type Listener = VerbsListener;

    #[instrument(skip(self, capacities, private_data), err)]
    fn resolve_and_connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        capacities: &Capacities,
        private_data: &[u8],
    ) -> Result<(VerbsConnection, Vec<u8>)> {
        let deadline = Instant::now() + timeout;
        let timeout_ms = timeout.as_millis().min(c_int::MAX as u128) as c_int;
        let channel = EventChannel::new()?;
        let mut id = null_mut();
        // SAFETY: the channel is live.
        check(
            unsafe { rdma_create_id(channel.0, &mut id, null_mut(), rdma_port_space::RDMA_PS_TCP) },
            "rdma_create_id",
        )?;
        let mut endpoint = Endpoint::new(id, Some(channel));

        let mut dst = to_sockaddr(addr);
        // SAFETY: `dst` outlives the call.
        check(
            unsafe { rdma_resolve_addr(id, null_mut(), ptr::addr_of_mut!(dst).cast(), timeout_ms) },
            "rdma_resolve_addr",
        )?;
        endpoint.wait(rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED, deadline, "rdma_resolve_addr")?;
        // SAFETY: the address is resolved.
        check(unsafe { rdma_resolve_route(id, timeout_ms) }, "rdma_resolve_route")?;
        endpoint.wait(rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED, deadline, "rdma_resolve_route")?;

        // SAFETY: route resolution bound the id to a device.
        let context = unsafe { (*id).verbs };
        let pd = self.domains.get(context)?;
        endpoint.create_queue_pair(pd, capacities)?;

        // SAFETY: the context is open.
        let device = unsafe { query_device(context) }?;
        let mut param = conn_param(private_data, &AcceptParams::from_caps(&device));
        // SAFETY: `param` and the private data it points to outlive the call.
        check(unsafe { rdma_connect(id, &mut param) }, "rdma_connect")?;
        endpoint.connected = true;
        let reply = endpoint
            .wait(rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED, deadline, "rdma_connect")?
            .private_data;
        // SAFETY: the id is live.
        debug!(%addr, device = unsafe { device_name(id) }, "connected");

        let qp = endpoint.queue_pair(capacities);
        Ok((VerbsConnection { endpoint, pd, qp }, reply))
    }

    #[instrument(skip(self), err)]
    fn listen(&self, addr: SocketAddr) -> Result<VerbsListener> {
        let mut id = null_mut();
        // SAFETY: a null channel creates a synchronous id.
        check(
            unsafe { rdma_create_id(null_mut(), &mut id, null_mut(), rdma_port_space::RDMA_PS_TCP) },
            "rdma_create_id",
        )?;
        let listener = VerbsListener {
            id,
            addr,
            domains: self.domains.clone(),
        };
        let mut src = to_sockaddr(addr);
        // SAFETY: `src` outlives the call.
        check(unsafe { rdma_bind_addr(id, ptr::addr_of_mut!(src).cast()) }, "rdma_bind_addr")?;
        // SAFETY: the id is bound.
        check(unsafe { rdma_listen(id, LISTEN_BACKLOG) }, "rdma_listen")?;
        // SAFETY: `verbs` is null unless the address pinned a device.
        if unsafe { !(*id).verbs.is_null() } {
            debug!(device = unsafe { device_name(id) }, "listener bound to device");
        }
        Ok(listener)
    }
}

pub struct VerbsListener {
    id: *mut rdma_cm_id,
    addr: SocketAddr,
    domains: Arc<Domains>,
}

// SAFETY: the id is only used by the thread that owns the listener.
unsafe impl Send for VerbsListener {}

impl Listener for VerbsListener {
    type Request = VerbsRequest;

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn accept_connection(&mut self) -> Result<VerbsRequest> {
        let mut child = null_mut();
        // SAFETY: the listening id is live.
        check(unsafe { rdma_get_request(self.id, &mut child) }, "rdma_get_request")?;
        // SAFETY: `child` carries the connect request event.
        let (private_data, (local_addr, peer_addr)) = unsafe { (event_private_data(child), route_addrs(child)) };
        Ok(VerbsRequest {
            endpoint: Some(Endpoint::new(child, None)),
            domains: self.domains.clone(),
            private_data,
            local_addr,
            peer_addr,
        })
    }
}

impl Drop for VerbsListener {
    fn drop(&mut self) {
        // SAFETY: owned id.
        unsafe { rdma_destroy_id(self.id) };
    }
}

/// Dropping a request without accepting it rejects the connection.
pub struct VerbsRequest {
    endpoint: Option<Endpoint>,
    domains: Arc<Domains>,
    private_data: Vec<u8>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

// SAFETY: the id is only used by the thread that owns the request.
unsafe impl Send for VerbsRequest {}

impl VerbsRequest {
    fn id(&self) -> *mut rdma_cm_id {
        self.endpoint.as_ref().map_or(null_mut(), |e| e.id)
    }

    fn context(&self) -> *mut ibv_context {
        // SAFETY: a request always holds its endpoint until accepted.
        unsafe { (*self.id()).verbs }
    }
}

impl ConnectRequest for VerbsRequest {
    type Region = VerbsRegion;
    type Connection = VerbsConnection;

    fn device(&self) -> DeviceId {
        DeviceId(self.context() as u64)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn private_data(&self) -> &[u8] {
        &self.private_data
    }

    fn query_device(&self) -> Result<DeviceCaps> {
        // SAFETY: the request's id is bound to a device.
        unsafe { query_device(self.context()) }
    }

    fn register_memory(&self, buffer: Arc<PageBuffer>, access: Access) -> Result<VerbsRegion> {
        let pd = self.domains.get(self.context())?;
        // SAFETY: domains are never deallocated.
        unsafe { register(pd, buffer, access) }
    }

    fn accept(
        mut self,
        capacities: &Capacities,
        params: &AcceptParams,
        private_data: &[u8],
    ) -> Result<VerbsConnection> {
        let pd = self.domains.get(self.context())?;
        let mut endpoint = self
            .endpoint
            .take()
            .ok_or_else(|| BenchError::transport("rdma_accept", io::ErrorKind::NotConnected.into()))?;
        endpoint.create_queue_pair(pd, capacities)?;

        let mut param = conn_param(private_data, params);
        // SAFETY: `param` and the private data outlive the call.
        check(unsafe { rdma_accept(endpoint.id, &mut param) }, "rdma_accept")?;
        endpoint.connected = true;
        endpoint.watch()?;

        let qp = endpoint.queue_pair(capacities);
        Ok(VerbsConnection { endpoint, pd, qp })
    }
}

impl Drop for VerbsRequest {
    fn drop(&mut self) {
        if let Some(endpoint) = &self.endpoint {
            // SAFETY: the id still carries an unanswered connect request.
            unsafe { rdma_reject(endpoint.id, ptr::null(), 0) };
        }
    }
}

pub struct VerbsConnection {
    qp: VerbsQueuePair,
    pd: *mut ibv_pd,
    // Declared last: disconnects and destroys the id after the queue pair
    // handle is gone.
    endpoint: Endpoint,
}

// SAFETY: the connection's handles are used by one thread at a time.
unsafe impl Send for VerbsConnection {}

impl Connection for VerbsConnection {
    type Region = VerbsRegion;
    type QueuePair = VerbsQueuePair;

    fn register_memory(&self, buffer: Arc<PageBuffer>, access: Access) -> Result<VerbsRegion> {
        // SAFETY: domains are never deallocated.
        unsafe { register(self.pd, buffer, access) }
    }

    fn query_device(&self) -> Result<DeviceCaps> {
        // SAFETY: connected ids are bound to a device.
        unsafe { query_device((*self.endpoint.id).verbs) }
    }

    fn queue_pair(&mut self) -> &mut VerbsQueuePair {
        &mut self.qp
    }

    fn is_connected(&mut self) -> bool {
        self.endpoint.peer_connected()
    }
}

pub struct VerbsRegion {
    mr: *mut ibv_mr,
    buffer: Arc<PageBuffer>,
    lkey: u32,
    rkey: u32,
}

// SAFETY: the region handle is immutable after registration.
unsafe impl Send for VerbsRegion {}
unsafe impl Sync for VerbsRegion {}

impl MemoryRegion for VerbsRegion {
    fn buffer(&self) -> &Arc<PageBuffer> {
        &self.buffer
    }

    fn lkey(&self) -> u32 {
        self.lkey
    }

    fn rkey(&self) -> u32 {
        self.rkey
    }
}

impl Drop for VerbsRegion {
    fn drop(&mut self) {
        // SAFETY: owned registration.
        unsafe { ibv_dereg_mr(self.mr) };
    }
}

pub struct VerbsQueuePair {
    qp: *mut ibv_qp,
    cq: *mut ibv_cq,
    wcs: Vec<ibv_wc>,
}

// SAFETY: posting and polling happen on the thread that owns the connection.
unsafe impl Send for VerbsQueuePair {}

fn status_text(status: ibv_wc_status::Type) -> &'static str {
    // SAFETY: libibverbs returns pointers to static strings.
    let text = unsafe { ibv_wc_status_str(status) };
    if text.is_null() {
        return "unknown completion status";
    }
    // SAFETY: as above.
    unsafe { CStr::from_ptr(text) }.to_str().unwrap_or("unknown completion status")
}

impl QueuePair for VerbsQueuePair {
    unsafe fn post(&mut self, wr: &WorkRequest) -> io::Result<()> {
        let mut sge = ibv_sge {
            addr: wr.local.addr,
            length: wr.local.len,
            lkey: wr.local.lkey,
        };
        // SAFETY: plain data, filled in below.
        let mut send_wr: ibv_send_wr = unsafe { mem::zeroed() };
        send_wr.wr_id = wr.id;
        send_wr.sg_list = &mut sge;
        send_wr.num_sge = 1;
        send_wr.opcode = match wr.opcode {
            Opcode::Read => ibv_wr_opcode::IBV_WR_RDMA_READ,
            Opcode::Write => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            Opcode::FetchAdd => ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD,
            Opcode::CompareSwap => ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP,
            Opcode::Send => ibv_wr_opcode::IBV_WR_SEND,
        };
        let mut flags = ibv_send_flags(0);
        if wr.signaled {
            flags = flags | ibv_send_flags::IBV_SEND_SIGNALED;
        }
        if wr.inline {
            flags = flags | ibv_send_flags::IBV_SEND_INLINE;
        }
        send_wr.send_flags = flags.0;

        // SAFETY: writing the union member that matches the opcode.
        unsafe {
            match wr.opcode {
                Opcode::Read | Opcode::Write => {
                    send_wr.wr.rdma.remote_addr = wr.remote.addr;
                    send_wr.wr.rdma.rkey = wr.remote.rkey;
                }
                Opcode::FetchAdd | Opcode::CompareSwap => {
                    send_wr.wr.atomic.remote_addr = wr.remote.addr;
                    send_wr.wr.atomic.rkey = wr.remote.rkey;
                    send_wr.wr.atomic.compare_add = wr.compare_add;
                    send_wr.wr.atomic.swap = wr.swap;
                }
                Opcode::Send => {}
            }
        }

        let mut bad = null_mut();
        // SAFETY: the work request and its scatter entry live across the
        // call; the caller guarantees the local memory stays registered.
        let rc = unsafe { ibv_post_send(self.qp, &mut send_wr, &mut bad) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }

    unsafe fn post_receive(&mut self, local: LocalSlice, id: u64) -> io::Result<()> {
        let mut sge = ibv_sge {
            addr: local.addr,
            length: local.len,
            lkey: local.lkey,
        };
        // SAFETY: plain data.
        let mut recv_wr: ibv_recv_wr = unsafe { mem::zeroed() };
        recv_wr.wr_id = id;
        recv_wr.sg_list = &mut sge;
        recv_wr.num_sge = 1;
        let mut bad = null_mut();
        // SAFETY: as in `post`.
        let rc = unsafe { ibv_post_recv(self.qp, &mut recv_wr, &mut bad) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }

    fn poll(&mut self, completions: &mut [Completion]) -> io::Result<usize> {
        let n = completions.len().min(self.wcs.len());
        // SAFETY: `wcs` has room for `n` entries.
        let polled = unsafe { ibv_poll_cq(self.cq, n as c_int, self.wcs.as_mut_ptr()) };
        if polled < 0 {
            return Err(io::Error::other("ibv_poll_cq failed"));
        }
        let polled = polled as usize;
        for (completion, wc) in completions.iter_mut().zip(&self.wcs[..polled]) {
            *completion = Completion {
                id: wc.wr_id,
                status: if wc.status == ibv_wc_status::IBV_WC_SUCCESS {
                    CompletionStatus::Success
                } else {
                    CompletionStatus::Error(status_text(wc.status))
                },
            };
        }
        Ok(polled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addresses_survive_sockaddr_conversion() {
        for addr in ["10.1.2.3:13345", "[fe80::1]:4791", "0.0.0.0:0"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let storage = to_sockaddr(addr);
            assert_eq!(unsafe { from_sockaddr(&storage) }, Some(addr));
        }
    }

    #[test]
    fn access_maps_to_verbs_flags() {
        let all = access_flags(Access::ALL) as u32;
        let expected = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC;
        assert_eq!(all, expected.0);
        assert_eq!(access_flags(Access::LOCAL_WRITE) as u32, ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0);
    }

    #[test]
    fn unspecified_addresses_have_no_route_family() {
        // SAFETY: zeroed storage has family AF_UNSPEC.
        let storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        assert_eq!(unsafe { from_sockaddr(&storage) }, None);
    }
}
