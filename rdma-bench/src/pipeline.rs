//! The initiator's hot loop.
//!
//! One thread alternates between filling the send queue up to the window and
//! busy-polling the completion queue. Only every `cq_mod`-th submission is
//! signaled; its completion retires the whole group of `cq_mod` operations,
//! relying on in-order completion within a queue pair.

use crate::config::Opcode;
use crate::location::LocationSelector;
use crate::protocol::RemoteTarget;
use crate::stats::{Collector, StopFlag};
use crate::transport::{Completion, CompletionStatus, MemoryRegion, QueuePair, RemoteSlice, WorkRequest};
use crate::{BenchError, Result};
use std::hint;
use std::time::Instant;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub window: usize,
    pub cq_mod: usize,
    pub opcode: Opcode,
    pub size: usize,
    pub inline: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub submitted: u64,
    pub completed: u64,
    pub signaled: u64,
    pub max_in_flight: usize,
}

pub struct Pipeline<'r, R: MemoryRegion> {
    config: PipelineConfig,
    region: &'r R,
    remote: RemoteTarget,
    locations: LocationSelector,

    submit_times: Vec<Instant>,
    completions: Vec<Completion>,

    in_flight: usize,
    submitted: u64,
    completed: u64,
    signaled: u64,
    max_in_flight: usize,
}

impl<'r, R: MemoryRegion> Pipeline<'r, R> {
    /// Fails unless `1 <= cq_mod <= window`.
    pub fn new(
        config: PipelineConfig,
        region: &'r R,
        remote: RemoteTarget,
        locations: LocationSelector,
    ) -> Result<Self> {
        if config.window == 0 || !(1..=config.window).contains(&config.cq_mod) {
            return Err(BenchError::config(format!(
                "cq_mod {} must be between 1 and tx depth {}",
                config.cq_mod, config.window
            )));
        }
        Ok(Self {
            config,
            region,
            remote,
            locations,
            submit_times: vec![Instant::now(); config.window],
            completions: vec![Completion::default(); config.window],
            in_flight: 0,
            submitted: 0,
            completed: 0,
            signaled: 0,
            max_in_flight: 0,
        })
    }

    /// Runs until `stop` is raised, then completes the current signaling
    /// group and drains every outstanding operation.
    #[instrument(skip_all, name = "Pipeline::run", err, fields(window = self.config.window, cq_mod = self.config.cq_mod))]
    pub fn run<Q, C>(&mut self, qp: &mut Q, collector: &C, stop: &StopFlag) -> Result<PipelineSummary>
    where
        Q: QueuePair,
        C: Collector,
    {
        let cq_mod = self.config.cq_mod as u64;
        let mut stopping = false;

        loop {
            while self.in_flight < self.config.window {
                if stopping && self.submitted % cq_mod == 0 {
                    break;
                }
                self.submit::<Q, C>(qp)?;
            }

            if stopping && self.in_flight == 0 {
                break;
            }

            self.drain(qp, collector)?;

            if !stopping && stop.is_raised() {
                debug!(submitted = self.submitted, in_flight = self.in_flight, "Stopping");
                stopping = true;
            }
        }

        debug_assert_eq!(self.submitted, self.completed);
        Ok(self.summary())
    }

    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            submitted: self.submitted,
            completed: self.completed,
            signaled: self.signaled,
            max_in_flight: self.max_in_flight,
        }
    }

    #[inline]
    fn submit<Q: QueuePair, C: Collector>(&mut self, qp: &mut Q) -> Result<()> {
        let number = self.submitted + 1;
        let signaled = number % self.config.cq_mod as u64 == 0;
        let slot = (self.submitted % self.config.window as u64) as usize;

        let location = self.locations.next_location();
        let wr = WorkRequest {
            id: slot as u64,
            opcode: self.config.opcode,
            local: self.region.local(location.local_offset, self.config.size),
            remote: RemoteSlice {
                addr: self.remote.address + location.remote_offset,
                rkey: self.remote.rkey,
            },
            signaled,
            inline: self.config.inline,
            compare_add: 1,
            swap: 1,
        };

        if C::TIMESTAMPS && signaled {
            self.submit_times[slot] = Instant::now();
        }
        // SAFETY: the local slice lies in `region`, which outlives the
        // pipeline, and `run` drains every operation before returning.
        unsafe { qp.post(&wr) }.map_err(|e| BenchError::transport("ibv_post_send", e))?;

        self.submitted = number;
        self.in_flight += 1;
        self.max_in_flight = self.max_in_flight.max(self.in_flight);
        Ok(())
    }

    /// Spins until at least one completion arrives and accounts for it.
    #[inline]
    fn drain<Q: QueuePair, C: Collector>(&mut self, qp: &mut Q, collector: &C) -> Result<()> {
        let polled = loop {
            let polled = qp
                .poll(&mut self.completions)
                .map_err(|e| BenchError::transport("ibv_poll_cq", e))?;
            if polled > 0 {
                break polled;
            }
            hint::spin_loop();
        };

        let now = C::TIMESTAMPS.then(Instant::now);
        let retired = self.config.cq_mod;
        for completion in &self.completions[..polled] {
            if let CompletionStatus::Error(status) = completion.status {
                return Err(BenchError::Operation {
                    id: completion.id,
                    status: status.to_owned(),
                });
            }
            if self.in_flight < retired {
                return Err(BenchError::Operation {
                    id: completion.id,
                    status: "unexpected completion".to_owned(),
                });
            }
            self.in_flight -= retired;
            self.completed += retired as u64;
            self.signaled += 1;

            let latency = match now {
                Some(now) => {
                    let slot = completion.id as usize % self.config.window;
                    now.duration_since(self.submit_times[slot]).as_nanos() as u64
                }
                None => 0,
            };
            collector.record(retired as u64, latency);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Locations;
    use crate::memory::PageBuffer;
    use crate::protocol::ServerConnectionData;
    use crate::stats::{LatencySamples, ThroughputCounter};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Arc;

    struct TestRegion(Arc<PageBuffer>);

    impl MemoryRegion for TestRegion {
        fn buffer(&self) -> &Arc<PageBuffer> {
            &self.0
        }
        fn lkey(&self) -> u32 {
            1
        }
        fn rkey(&self) -> u32 {
            1
        }
    }

    /// Completes each signaled request on the poll after it was posted and
    /// tracks how many operations the hardware would still hold.
    #[derive(Default)]
    struct ScriptedQueuePair {
        posted: Vec<WorkRequest>,
        ready: VecDeque<Completion>,
        staged: VecDeque<Completion>,
        outstanding: usize,
        unsignaled_since_last: usize,
        retire: VecDeque<usize>,
        max_outstanding: usize,
        stop_after: Option<(usize, StopFlag)>,
        fail_at: Option<u64>,
        empty_polls: usize,
    }

    impl QueuePair for ScriptedQueuePair {
        unsafe fn post(&mut self, wr: &WorkRequest) -> io::Result<()> {
            self.posted.push(*wr);
            self.outstanding += 1;
            self.max_outstanding = self.max_outstanding.max(self.outstanding);
            self.unsignaled_since_last += 1;
            if wr.signaled {
                let status = if self.fail_at == Some(self.posted.len() as u64) {
                    CompletionStatus::Error("remote access error")
                } else {
                    CompletionStatus::Success
                };
                self.staged.push_back(Completion { id: wr.id, status });
                self.retire.push_back(self.unsignaled_since_last);
                self.unsignaled_since_last = 0;
            }
            if let Some((n, stop)) = &self.stop_after {
                if self.posted.len() >= *n {
                    stop.raise();
                }
            }
            Ok(())
        }

        unsafe fn post_receive(&mut self, _local: crate::transport::LocalSlice, _id: u64) -> io::Result<()> {
            unreachable!()
        }

        fn poll(&mut self, completions: &mut [Completion]) -> io::Result<usize> {
            if self.ready.is_empty() {
                self.empty_polls += 1;
                self.ready.append(&mut self.staged);
                return Ok(0);
            }
            let mut n = 0;
            while n < completions.len() {
                let Some(completion) = self.ready.pop_front() else { break };
                completions[n] = completion;
                self.outstanding -= self.retire.pop_front().unwrap();
                n += 1;
            }
            Ok(n)
        }
    }

    fn region(len: usize) -> TestRegion {
        TestRegion(Arc::new(PageBuffer::zeroed(len).unwrap()))
    }

    fn remote() -> RemoteTarget {
        RemoteTarget::new(&ServerConnectionData::new(0x10_0000, 1 << 20, 7, false), false)
    }

    fn config(window: usize, cq_mod: usize) -> PipelineConfig {
        PipelineConfig {
            window,
            cq_mod,
            opcode: Opcode::Write,
            size: 8,
            inline: false,
        }
    }

    fn run(window: usize, cq_mod: usize, stop_after: usize) -> (PipelineSummary, ScriptedQueuePair, u64) {
        let region = region(4 * 64);
        let selector = Locations::Cyclic(4).selector(64, 3);
        let mut pipeline = Pipeline::new(config(window, cq_mod), &region, remote(), selector).unwrap();
        let stop = StopFlag::new();
        let mut qp = ScriptedQueuePair {
            stop_after: Some((stop_after, stop.clone())),
            ..Default::default()
        };
        let counter = ThroughputCounter::new();
        let summary = pipeline.run(&mut qp, &counter, &stop).unwrap();
        (summary, qp, counter.take())
    }

    #[test]
    fn never_exceeds_window() {
        for window in [1, 2, 3, 7, 16] {
            for cq_mod in 1..=window {
                let (summary, qp, _) = run(window, cq_mod, 200);
                assert!(summary.max_in_flight <= window, "window {window} cq_mod {cq_mod}");
                assert!(qp.max_outstanding <= window, "window {window} cq_mod {cq_mod}");
            }
        }
    }

    #[test]
    fn drains_everything_on_stop() {
        for (window, cq_mod) in [(1, 1), (16, 1), (16, 4), (10, 3), (5, 5)] {
            let (summary, qp, counted) = run(window, cq_mod, 101);
            assert_eq!(summary.submitted, summary.completed);
            assert_eq!(summary.completed, summary.signaled * cq_mod as u64);
            assert_eq!(summary.submitted % cq_mod as u64, 0);
            assert_eq!(qp.outstanding, 0);
            assert_eq!(counted, summary.completed);
            assert!(qp.posted.last().unwrap().signaled);
        }
    }

    #[test]
    fn signals_every_cq_mod_th_request() {
        let (_, qp, _) = run(8, 4, 64);
        for (i, wr) in qp.posted.iter().enumerate() {
            assert_eq!(wr.signaled, (i + 1) % 4 == 0, "request {i}");
            assert_eq!(wr.id, (i % 8) as u64);
        }
    }

    #[test]
    fn targets_selected_locations() {
        let (_, qp, _) = run(4, 1, 32);
        let region_base = qp.posted[0].local.addr - qp.posted[0].local.addr % 4096;
        for wr in &qp.posted {
            let remote_offset = wr.remote.addr - remote().address;
            let local_offset = wr.local.addr - region_base;
            assert_eq!(remote_offset % 64, 0);
            assert!(remote_offset < 4 * 64);
            assert_eq!(local_offset, remote_offset);
            assert_eq!(wr.remote.rkey, 7);
            assert_eq!(wr.local.len, 8);
        }
    }

    #[test]
    fn failed_completion_is_fatal() {
        let region = region(64);
        let selector = Locations::Cyclic(1).selector(64, 0);
        let mut pipeline = Pipeline::new(config(4, 2), &region, remote(), selector).unwrap();
        let mut qp = ScriptedQueuePair {
            fail_at: Some(6),
            ..Default::default()
        };
        let err = pipeline
            .run(&mut qp, &ThroughputCounter::new(), &StopFlag::new())
            .unwrap_err();
        match err {
            BenchError::Operation { status, .. } => assert_eq!(status, "remote access error"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn latency_mode_samples_each_signaled_completion() {
        let region = region(64);
        let selector = Locations::Fixed(0).selector(64, 0);
        let mut pipeline = Pipeline::new(config(4, 2), &region, remote(), selector).unwrap();
        let stop = StopFlag::new();
        let mut qp = ScriptedQueuePair {
            stop_after: Some((40, stop.clone())),
            ..Default::default()
        };
        let samples = LatencySamples::with_cap(1024);
        let summary = pipeline.run(&mut qp, &samples, &stop).unwrap();
        let count = samples.drain(|s| s.len()).unwrap() + samples.drain(|s| s.len()).unwrap();
        assert_eq!(count as u64, summary.signaled);
    }

    #[test]
    fn rejects_signaling_modulus_outside_window() {
        let region = region(64);
        for (window, cq_mod) in [(4, 0), (4, 5), (0, 0)] {
            let selector = Locations::Fixed(0).selector(64, 0);
            let err = Pipeline::new(config(window, cq_mod), &region, remote(), selector)
                .err()
                .unwrap();
            assert!(err.is_configuration(), "window {window} cq_mod {cq_mod}");
        }
    }
}
