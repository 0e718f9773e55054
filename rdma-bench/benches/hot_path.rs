//! Per-operation costs of the initiator's hot loop, measured against the
//! loopback fabric so they run without RDMA hardware.

use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use rdma_bench::config::Opcode;
use rdma_bench::location::Locations;
use rdma_bench::memory::PageBuffer;
use rdma_bench::pipeline::{Pipeline, PipelineConfig};
use rdma_bench::protocol::RemoteTarget;
use rdma_bench::stats::{Collector, LatencySamples, StopFlag, ThroughputCounter};
use rdma_bench::transport::loopback::{self, LoopbackFabric};
use rdma_bench::transport::{
    AcceptParams, Access, Capacities, ConnectRequest, Connection, Listener, MemoryRegion, Transport,
};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WINDOW: usize = 64;

fn bench_location_selector(c: &mut Criterion) {
    let mut group = c.benchmark_group("location_selector");
    group.throughput(Throughput::Elements(1));
    for locations in [1i64, 4096] {
        let mut selector = Locations::from_raw(locations).selector(64, 7);
        group.bench_function(format!("next_location/{locations}"), |b| {
            b.iter(|| black_box(selector.next_location()))
        });
    }
    group.finish();
}

fn bench_collectors(c: &mut Criterion) {
    let mut group = c.benchmark_group("collectors");
    group.throughput(Throughput::Elements(1));

    let counter = ThroughputCounter::new();
    group.bench_function("throughput_record", |b| b.iter(|| counter.record(black_box(8), 0)));

    let samples = LatencySamples::with_cap(1 << 20);
    group.bench_function("latency_record", |b| {
        b.iter(|| samples.record(1, black_box(1_500)));
        samples.snapshot();
    });
    group.bench_function("latency_snapshot_10k", |b| {
        b.iter_batched(
            || {
                for ns in 0..10_000 {
                    samples.record(1, ns);
                }
            },
            |()| black_box(samples.snapshot()),
            BatchSize::PerIteration,
        )
    });
    group.finish();
}

fn bench_loopback_pipeline(c: &mut Criterion) {
    let fabric = LoopbackFabric::new();
    let addr = "127.0.0.1:13345".parse().unwrap();
    let mut listener = fabric.listen(addr).unwrap();
    let remote_buffer = Arc::new(PageBuffer::zeroed(WINDOW * 64).unwrap());

    let target = {
        let remote_buffer = remote_buffer.clone();
        thread::spawn(move || {
            let request = listener.accept_connection().unwrap();
            let region = request.register_memory(remote_buffer, Access::ALL).unwrap();
            let capacities = Capacities {
                cq_entries: 1,
                max_send_wr: 1,
                max_recv_wr: 1,
                max_inline_data: 0,
            };
            let connection = request
                .accept(&capacities, &AcceptParams::from_caps(&loopback::DEVICE_CAPS), &[])
                .unwrap();
            (region, connection)
        })
    };
    let capacities = Capacities {
        cq_entries: WINDOW as u32,
        max_send_wr: WINDOW as u32,
        max_recv_wr: 1,
        max_inline_data: 0,
    };
    let (mut connection, _) = fabric
        .resolve_and_connect(addr, Duration::from_secs(5), &capacities, &[])
        .unwrap();
    let (remote_region, _target_connection) = target.join().unwrap();

    let local = connection
        .register_memory(Arc::new(PageBuffer::zeroed(WINDOW * 64).unwrap()), Access::ALL)
        .unwrap();
    let remote = RemoteTarget {
        address: remote_buffer.addr(),
        size: remote_buffer.len() as u64,
        rkey: remote_region.rkey(),
        inline: false,
        send: false,
    };

    // A raised flag makes every `run` submit one window and drain it.
    let stop = StopFlag::new();
    stop.raise();
    let collector = ThroughputCounter::new();

    let mut group = c.benchmark_group("loopback_pipeline");
    group.throughput(Throughput::Elements(WINDOW as u64));
    for (opcode, cq_mod) in [(Opcode::Write, 1), (Opcode::Write, 16), (Opcode::Read, 16), (Opcode::FetchAdd, 16)] {
        let config = PipelineConfig {
            window: WINDOW,
            cq_mod,
            opcode,
            size: 8,
            inline: false,
        };
        let selector = Locations::Cyclic(WINDOW).selector(64, 1);
        let mut pipeline = Pipeline::new(config, &local, remote, selector).unwrap();
        group.bench_function(format!("{opcode}/cq_mod={cq_mod}"), |b| {
            b.iter(|| {
                pipeline
                    .run(connection.queue_pair(), &collector, &stop)
                    .unwrap()
            })
        });
    }
    group.finish();
    black_box(collector.take());
}

criterion_group!(benches, bench_location_selector, bench_collectors, bench_loopback_pipeline);
criterion_main!(benches);
