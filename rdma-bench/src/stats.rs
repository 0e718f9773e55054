//! Counters shared between the hot loop and the reporter.
//!
//! The hot loop only ever issues single-word atomic read-modify-writes here;
//! it never waits on the reporter.

use std::cell::UnsafeCell;
use std::fmt::{Display, Formatter};
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Cooperative cancellation shared by the reporter and the hot loop.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What the hot loop feeds per signaled completion.
pub trait Collector: Send + Sync + 'static {
    /// Whether the pipeline has to timestamp submissions for this collector.
    const TIMESTAMPS: bool;

    /// `retired` operations completed; `latency_ns` is only meaningful when
    /// `TIMESTAMPS` is set.
    fn record(&self, retired: u64, latency_ns: u64);

    /// Detaches everything recorded since the previous snapshot.
    fn snapshot(&self) -> Snapshot;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Throughput(u64),
    Latency(Option<LatencySummary>),
}

impl Display for Snapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Snapshot::Throughput(ops) => write!(f, "{ops} ops/sec"),
            Snapshot::Latency(Some(summary)) => write!(
                f,
                "{} ns median\t{:.1} ns mean\t{} samples",
                summary.median, summary.mean, summary.count
            ),
            Snapshot::Latency(None) => f.write_str("no samples"),
        }
    }
}

#[derive(Debug, Default)]
pub struct ThroughputCounter(AtomicU64);

impl ThroughputCounter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns the count since the previous call and resets it.
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

impl Collector for ThroughputCounter {
    const TIMESTAMPS: bool = false;

    #[inline]
    fn record(&self, retired: u64, _latency_ns: u64) {
        self.add(retired);
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::Throughput(self.take())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatencySummary {
    pub count: usize,
    pub median: u64,
    pub mean: f64,
}

impl LatencySummary {
    /// Sorts `samples` in place.
    pub fn from_samples(samples: &mut [u64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();

        let count = samples.len();
        let sum: u128 = samples.iter().map(|&s| s as u128).sum();
        Some(Self {
            count,
            median: samples[count / 2],
            mean: sum as f64 / count as f64,
        })
    }
}

const ACTIVE: usize = 0b001;
const WRITING: usize = 0b010;
const DRAINING: usize = 0b100;

/// Latency samples in two preallocated buffers: the hot loop appends to the
/// active one while the reporter drains the other.
///
/// `state` holds the active buffer index plus a writer-busy and a
/// drainer-busy bit. A writer claims the active buffer with one `fetch_or`;
/// the reporter detaches it with one `fetch_xor` and then only has to wait
/// for a writer that claimed the old buffer before the flip.
pub struct LatencySamples {
    state: AtomicUsize,
    buffers: [UnsafeCell<Vec<u64>>; 2],
    cap: usize,
}

// SAFETY: buffer `i` is accessed mutably only by the holder of the WRITING
// bit while `i` is active, or by the holder of the DRAINING bit after it has
// flipped `i` out and observed WRITING clear.
unsafe impl Sync for LatencySamples {}

impl LatencySamples {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            state: AtomicUsize::new(0),
            buffers: [
                UnsafeCell::new(Vec::with_capacity(cap)),
                UnsafeCell::new(Vec::with_capacity(cap)),
            ],
            cap,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Appends a sample unless the interval's cap is reached. Never blocks.
    #[inline]
    pub fn push(&self, latency_ns: u64) -> bool {
        let state = self.state.fetch_or(WRITING, Ordering::Acquire);
        if state & WRITING != 0 {
            // Another writer holds the buffer; there is only ever one hot loop.
            return false;
        }
        // SAFETY: we hold WRITING for the active buffer, see the Sync impl.
        let buffer = unsafe { &mut *self.buffers[state & ACTIVE].get() };
        let pushed = buffer.len() < self.cap;
        if pushed {
            buffer.push(latency_ns);
        }
        self.state.fetch_and(!WRITING, Ordering::Release);
        pushed
    }

    /// Swaps the buffers and hands the detached samples to `f`, then clears
    /// them. Returns `None` if another drain is in progress.
    pub fn drain<R>(&self, f: impl FnOnce(&mut Vec<u64>) -> R) -> Option<R> {
        if self.state.fetch_or(DRAINING, Ordering::Acquire) & DRAINING != 0 {
            return None;
        }
        let detached = self.state.fetch_xor(ACTIVE, Ordering::AcqRel) & ACTIVE;
        // A writer that claimed the detached buffer before the flip is still
        // inside `push`; any later claim targets the other buffer.
        while self.state.load(Ordering::Acquire) & WRITING != 0 {
            hint::spin_loop();
        }
        // SAFETY: detached is no longer active and no writer holds it.
        let buffer = unsafe { &mut *self.buffers[detached].get() };
        let result = f(buffer);
        buffer.clear();
        self.state.fetch_and(!DRAINING, Ordering::Release);
        Some(result)
    }
}

impl Collector for LatencySamples {
    const TIMESTAMPS: bool = true;

    #[inline]
    fn record(&self, _retired: u64, latency_ns: u64) {
        self.push(latency_ns);
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::Latency(self.drain(|samples| LatencySummary::from_samples(samples)).flatten())
    }
}
