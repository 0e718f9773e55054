//! Holds accepted connections until their initiators go away.

use crate::Result;
use crate::transport::Connection;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

pub const REAP_INTERVAL: Duration = Duration::from_millis(100);

pub enum Held<C> {
    /// A one-sided connection; nothing on this side touches its queue pair.
    Idle(usize, C),
    /// A two-sided connection, owned by the thread reposting its receives.
    Responder(usize, JoinHandle<()>),
}

impl<C: Connection> Held<C> {
    /// False once the connection is gone.
    fn check(&mut self) -> bool {
        match self {
            Held::Idle(number, connection) => {
                let connected = connection.is_connected();
                if !connected {
                    debug!(number = *number, "peer disconnected");
                }
                connected
            }
            Held::Responder(_, responder) => !responder.is_finished(),
        }
    }

    fn release(self) {
        if let Held::Responder(number, responder) = self {
            if responder.join().is_err() {
                warn!(number, "responder panicked");
            }
        }
    }
}

pub struct Reaper<C> {
    handoff: Option<Sender<Held<C>>>,
    live: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
}

impl<C: Connection + 'static> Reaper<C> {
    pub fn spawn() -> Result<Self> {
        let (handoff, held) = channel::unbounded();
        let live = Arc::new(AtomicUsize::new(0));
        let thread = {
            let live = live.clone();
            thread::Builder::new()
                .name("reaper".to_owned())
                .spawn(move || reap(held, &live))?
        };
        Ok(Self {
            handoff: Some(handoff),
            live,
            thread: Some(thread),
        })
    }

    pub fn hold(&self, held: Held<C>) {
        self.live.fetch_add(1, Ordering::SeqCst);
        let Some(handoff) = &self.handoff else {
            return;
        };
        if let Err(returned) = handoff.send(held) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            returned.into_inner().release();
        }
    }

    /// Connections whose initiators have not been seen leaving yet.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl<C> Drop for Reaper<C> {
    fn drop(&mut self) {
        drop(self.handoff.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Remaining connections are dropped, and responders detached, once the
/// handoff closes.
fn reap<C: Connection>(handoff: Receiver<Held<C>>, live: &AtomicUsize) {
    let mut held: Vec<Held<C>> = Vec::new();
    loop {
        match handoff.recv_timeout(REAP_INTERVAL) {
            Ok(entry) => held.push(entry),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
        let mut released = 0;
        let mut i = 0;
        while i < held.len() {
            if held[i].check() {
                i += 1;
            } else {
                held.swap_remove(i).release();
                released += 1;
            }
        }
        if released > 0 {
            let left = live.fetch_sub(released, Ordering::SeqCst) - released;
            trace!(released, live = left, "released connections");
        }
    }
}
