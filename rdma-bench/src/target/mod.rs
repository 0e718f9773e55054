//! The passive side: exposes one zeroed buffer to every initiator that
//! connects and, for two-sided runs, keeps receives posted.

pub mod cache;
mod reaper;

use crate::config::TargetConfig;
use crate::memory::PageBuffer;
use crate::protocol::{self, ClientConnectionData, ServerConnectionData};
use crate::transport::{
    AcceptParams, Capacities, Completion, ConnectRequest, Connection, Listener, MemoryRegion, QueuePair, Transport,
};
use crate::{BenchError, Result};
use cache::{ConnectionContext, ContextCache};
use reaper::{Held, Reaper};
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::io;
use std::thread;
use tracing::{debug, info, instrument, warn};

pub const MAX_SEND_WR: u32 = 128;
pub const MAX_RECV_WR: u32 = 512;
const IDLE_POLLS_PER_CHECK: u32 = 4096;

pub struct Target<T: Transport> {
    config: TargetConfig,
    buffer: Arc<PageBuffer>,
    listener: T::Listener,
    cache: ContextCache<T::Region>,
    reaper: Reaper<T::Connection>,
    accepted: usize,
}

impl<T: Transport> Target<T> {
    #[instrument(name = "Target::bind", skip(transport), err)]
    pub fn bind(transport: &T, config: TargetConfig) -> Result<Self> {
        config.validate()?;
        let buffer = Arc::new(PageBuffer::zeroed(config.buffer_size()?)?);
        let listener = transport.listen(config.addr)?;
        info!(
            "listening on {} ({} bytes, {} locations of {} bytes)",
            listener.local_addr(),
            buffer.len(),
            config.locations,
            config.size
        );
        Ok(Self {
            config,
            buffer,
            listener,
            cache: ContextCache::new(),
            reaper: Reaper::spawn()?,
            accepted: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn buffer(&self) -> &Arc<PageBuffer> {
        &self.buffer
    }

    /// Connection requests seen so far, including rejected ones.
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn devices(&self) -> usize {
        self.cache.len()
    }

    /// Accepted connections whose initiators are still around.
    pub fn live_connections(&self) -> usize {
        self.reaper.live()
    }

    /// Accepts connections until a fatal error. A misbehaving initiator only
    /// loses its own connection.
    pub fn serve(&mut self) -> Result<()> {
        loop {
            match self.accept_one() {
                Ok(()) => {}
                Err(e) if is_connection_scoped(&e) => warn!("connection #{} dropped: {e}", self.accepted - 1),
                Err(e) => return Err(e),
            }
        }
    }

    /// Waits for one connection request and accepts it.
    pub fn accept_one(&mut self) -> Result<()> {
        let request = self.listener.accept_connection()?;
        let number = self.accepted;
        self.accepted += 1;
        info!(
            "#{number} {} <- {} (dev = {})",
            Endpoint(request.local_addr()),
            Endpoint(request.peer_addr()),
            request.device()
        );

        let client: ClientConnectionData = protocol::decode(request.private_data())?;
        debug!(locations = client.locations, send = client.send(), "client parameters");
        let context = self.cache.get_or_create(&request, &self.buffer)?;

        let send = client.send();
        let capacities = Capacities {
            cq_entries: if send { MAX_RECV_WR } else { 1 },
            max_send_wr: MAX_SEND_WR,
            max_recv_wr: MAX_RECV_WR,
            max_inline_data: if self.config.inline {
                u32::try_from(self.config.size).unwrap_or(u32::MAX)
            } else {
                0
            },
        }
        .fit(&context.device);
        let reply = ServerConnectionData::new(
            self.buffer.addr(),
            self.buffer.len() as u64,
            context.region.rkey(),
            self.config.inline,
        );
        let params = AcceptParams::from_caps(&context.device);
        let mut connection = request.accept(&capacities, &params, protocol::encode(&reply))?;

        if send {
            let receive = context
                .region
                .local(0, self.buffer.len().min(u32::MAX as usize));
            for id in 0..capacities.max_recv_wr as u64 {
                // SAFETY: the region lives in `context`, which the responder
                // keeps alive for as long as the connection.
                unsafe { connection.queue_pair().post_receive(receive, id) }
                    .map_err(|e| BenchError::transport("ibv_post_recv", e))?;
            }
            let responder = thread::Builder::new()
                .name(format!("responder-{number}"))
                .spawn(move || respond(number, connection, context))?;
            self.reaper.hold(Held::Responder(number, responder));
        } else {
            self.reaper.hold(Held::Idle(number, connection));
        }
        Ok(())
    }
}

fn is_connection_scoped(e: &BenchError) -> bool {
    matches!(
        e,
        BenchError::Protocol(_) | BenchError::TransportSetup { context: "rdma_accept", .. }
    )
}

/// Reposts every consumed receive until the peer goes away.
fn respond<C: Connection>(number: usize, mut connection: C, context: Arc<ConnectionContext<C::Region>>) {
    let receive = context
        .region
        .local(0, context.region.buffer().len().min(u32::MAX as usize));
    let mut completions = vec![Completion::default(); MAX_RECV_WR as usize];
    let mut received = 0u64;
    let mut idle = 0u32;
    loop {
        let polled = match connection.queue_pair().poll(&mut completions) {
            Ok(0) => {
                idle = idle.wrapping_add(1);
                if idle % IDLE_POLLS_PER_CHECK == 0 && !connection.is_connected() {
                    debug!(number, received, "peer disconnected");
                    return;
                }
                thread::yield_now();
                continue;
            }
            Ok(polled) => polled,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!(number, received, "peer disconnected");
                return;
            }
            Err(e) => {
                warn!(number, "polling receives failed: {e}");
                return;
            }
        };
        for completion in &completions[..polled] {
            if !completion.is_valid() {
                warn!(number, id = completion.id, "receive failed: {:?}", completion.status);
                return;
            }
            // SAFETY: see `Target::accept_one`.
            if let Err(e) = unsafe { connection.queue_pair().post_receive(receive, completion.id) } {
                warn!(number, "reposting receive failed: {e}");
                return;
            }
        }
        received += polled as u64;
    }
}

struct Endpoint(Option<SocketAddr>);

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{addr}"),
            None => f.write_str("?"),
        }
    }
}
