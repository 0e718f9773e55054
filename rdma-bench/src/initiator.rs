//! The active side: connects, learns where the remote buffer lives and drives
//! the pipeline while a reporter thread prints statistics.

use crate::config::{InitiatorConfig, Mode};
use crate::memory::PageBuffer;
use crate::pipeline::{Pipeline, PipelineConfig, PipelineSummary};
use crate::protocol::{self, ClientConnectionData, RemoteTarget, ServerConnectionData};
use crate::reporter::Reporter;
use crate::stats::{Collector, LatencySamples, StopFlag, ThroughputCounter};
use crate::transport::{Access, Capacities, Connection, MemoryRegion, QueuePair, Transport};
use crate::{BenchError, Result};
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub pipeline: PipelineSummary,
    pub reports: u64,
    pub seed: u64,
    pub remote: RemoteTarget,
}

/// Queue sizes for the initiator's connection.
pub fn capacities(config: &InitiatorConfig) -> Capacities {
    let window = config.window as u32;
    let send = config.opcode.is_two_sided();
    Capacities {
        cq_entries: if send { 2 * window } else { window },
        max_send_wr: window,
        max_recv_wr: if send { window } else { 1 },
        max_inline_data: config.inline_data as u32,
    }
}

/// Runs one benchmark against the target at `config.addr`, writing report
/// lines to `out`.
///
/// Everything that can be checked locally is checked before connecting, and
/// the remote footprint is checked before any operation is posted.
#[instrument(name = "initiator::run", skip_all, err, fields(addr = %config.addr, op = %config.opcode))]
pub fn run<T, W>(transport: &T, config: &InitiatorConfig, out: W) -> Result<RunSummary>
where
    T: Transport,
    W: Write + Send,
{
    config.validate()?;
    let aligned = config.aligned_size()?;
    let locations = config.location_set();
    let send = config.opcode.is_two_sided();

    let hello = ClientConnectionData::new(send, config.locations);
    let (mut connection, reply) = transport.resolve_and_connect(
        config.addr,
        config.connect_timeout,
        &capacities(config),
        protocol::encode(&hello),
    )?;
    let server: ServerConnectionData = protocol::decode(&reply)?;
    let remote = RemoteTarget::new(&server, send);
    debug!(
        address = format_args!("{:#x}", remote.address),
        size = remote.size,
        rkey = remote.rkey,
        inline = remote.inline,
        "handshake complete"
    );
    remote.check_footprint(aligned, locations.max_location())?;

    let buffer = Arc::new(PageBuffer::zeroed(aligned * locations.slots())?);
    let region = connection.register_memory(buffer, Access::ALL)?;

    let seed = config.seed.unwrap_or_else(rand::random);
    info!(
        seed,
        ?locations,
        window = config.window,
        cq_mod = config.cq_mod,
        "running {} {:?} for {:?}",
        config.opcode,
        config.mode,
        config.duration
    );

    let pipeline = Pipeline::new(
        PipelineConfig {
            window: config.window,
            cq_mod: config.cq_mod,
            opcode: config.opcode,
            size: config.size,
            inline: config.inline_data > 0,
        },
        &region,
        remote,
        locations.selector(aligned, seed),
    )?;
    let ticks = config.duration.as_secs();
    let qp = connection.queue_pair();
    let (summary, reports) = match config.mode {
        Mode::Throughput => drive(qp, pipeline, Arc::new(ThroughputCounter::new()), ticks, out)?,
        Mode::Latency => drive(qp, pipeline, Arc::new(LatencySamples::with_cap(config.sample_cap)), ticks, out)?,
    };
    info!(
        submitted = summary.submitted,
        completed = summary.completed,
        reports,
        "run complete"
    );

    Ok(RunSummary {
        pipeline: summary,
        reports,
        seed,
        remote,
    })
}

/// Runs the pipeline on this thread and the reporter on a scoped one. A
/// pipeline failure raises the stop flag so the reporter ends early.
fn drive<Q, R, C, W>(
    qp: &mut Q,
    mut pipeline: Pipeline<'_, R>,
    collector: Arc<C>,
    ticks: u64,
    out: W,
) -> Result<(PipelineSummary, u64)>
where
    Q: QueuePair,
    R: MemoryRegion,
    C: Collector,
    W: Write + Send,
{
    let stop = StopFlag::new();
    let reporter = Reporter::new(collector.clone(), ticks, stop.clone(), out);

    thread::scope(|scope| -> Result<(PipelineSummary, u64)> {
        let reporter = thread::Builder::new()
            .name("reporter".into())
            .spawn_scoped(scope, move || reporter.run())?;

        let result = pipeline.run(qp, &*collector, &stop);
        if result.is_err() {
            stop.raise();
        }
        let reports = reporter
            .join()
            .map_err(|_| BenchError::Io(io::Error::other("reporter thread panicked")))?;
        Ok((result?, reports?))
    })
}
