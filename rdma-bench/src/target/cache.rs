use crate::Result;
use crate::memory::PageBuffer;
use crate::transport::{Access, ConnectRequest, DeviceCaps, DeviceId, MemoryRegion};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Per-device setup shared by every connection on that device.
pub struct ConnectionContext<R> {
    pub region: R,
    pub device: DeviceCaps,
}

pub struct ContextCache<R> {
    contexts: HashMap<DeviceId, Arc<ConnectionContext<R>>>,
}

impl<R: MemoryRegion> ContextCache<R> {
    pub fn new() -> Self {
        Self {
            contexts: HashMap::new(),
        }
    }

    /// Registers `buffer` and queries the device on first sight of the
    /// request's device; reuses both afterwards.
    #[instrument(skip_all, err, fields(device = %request.device()))]
    pub fn get_or_create<Q>(&mut self, request: &Q, buffer: &Arc<PageBuffer>) -> Result<Arc<ConnectionContext<R>>>
    where
        Q: ConnectRequest<Region = R>,
    {
        match self.contexts.entry(request.device()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let device = request.query_device()?;
                let region = request.register_memory(buffer.clone(), Access::ALL)?;
                debug!(rkey = region.rkey(), ?device, "registered shared buffer");
                Ok(entry
                    .insert(Arc::new(ConnectionContext { region, device }))
                    .clone())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

impl<R: MemoryRegion> Default for ContextCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::{self, LoopbackFabric};
    use crate::transport::{Capacities, Listener, Transport};
    use std::net::SocketAddr;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn registers_once_per_device() {
        let fabric = LoopbackFabric::new();
        let addr: SocketAddr = "127.0.0.1:4791".parse().unwrap();
        let mut listener = fabric.listen(addr).unwrap();
        let capacities = Capacities {
            cq_entries: 1,
            max_send_wr: 1,
            max_recv_wr: 1,
            max_inline_data: 0,
        };

        let clients = {
            let fabric = fabric.clone();
            thread::spawn(move || {
                // Every attempt is rejected; only the requests matter here.
                for _ in 0..3 {
                    let _ = fabric.resolve_and_connect(addr, Duration::from_secs(5), &capacities, &[]);
                }
            })
        };

        let buffer = Arc::new(PageBuffer::zeroed(4096).unwrap());
        let mut cache = ContextCache::new();
        let mut rkeys = Vec::new();
        for _ in 0..3 {
            let request = listener.accept_connection().unwrap();
            let context = cache.get_or_create(&request, &buffer).unwrap();
            assert_eq!(context.device, loopback::DEVICE_CAPS);
            rkeys.push(context.region.rkey());
        }
        clients.join().unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(fabric.registrations(), 1);
        assert!(rkeys.iter().all(|&k| k == rkeys[0]));
    }
}
