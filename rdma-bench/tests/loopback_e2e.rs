use rdma_bench::config::{InitiatorConfig, Mode, Opcode, TargetConfig};
use rdma_bench::initiator;
use rdma_bench::memory::PageBuffer;
use rdma_bench::target::Target;
use rdma_bench::transport::loopback::LoopbackFabric;
use rdma_bench::{BenchError, MI_B};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn start_target(fabric: &LoopbackFabric, port: u16, size: usize, locations: usize) -> (SocketAddr, Arc<PageBuffer>) {
    let config = TargetConfig {
        addr: format!("127.0.0.1:{port}").parse().unwrap(),
        size,
        locations,
        inline: true,
    };
    let mut target = Target::bind(fabric, config).unwrap();
    let addr = target.local_addr();
    let buffer = target.buffer().clone();
    thread::spawn(move || {
        let _ = target.serve();
    });
    (addr, buffer)
}

fn report_lines(out: &[u8]) -> Vec<String> {
    String::from_utf8(out.to_vec())
        .unwrap()
        .lines()
        .map(str::to_owned)
        .collect()
}

#[test]
fn write_throughput_reports_every_second() {
    let fabric = LoopbackFabric::new();
    let (addr, _) = start_target(&fabric, 7001, MI_B, 1);
    let config = InitiatorConfig {
        addr,
        locations: 4,
        window: 16,
        size: 8,
        alignment: 64,
        opcode: Opcode::Write,
        mode: Mode::Throughput,
        duration: Duration::from_secs(2),
        seed: Some(1),
        ..InitiatorConfig::default()
    };

    let mut out = Vec::new();
    let summary = initiator::run(&fabric, &config, &mut out).unwrap();

    let lines = report_lines(&out);
    assert_eq!(lines.len(), 2, "{lines:?}");
    for line in &lines {
        assert!(line.ends_with(" ops/sec"), "{line}");
        assert_eq!(line.split('\t').count(), 2, "{line}");
    }
    assert_eq!(summary.reports, 2);
    assert_eq!(summary.seed, 1);
    assert!(summary.pipeline.submitted > 0);
    assert_eq!(summary.pipeline.submitted, summary.pipeline.completed);
    assert!(summary.pipeline.max_in_flight <= 16);
}

#[test]
fn oversized_request_is_refused_after_handshake() {
    let fabric = LoopbackFabric::new();
    let (addr, _) = start_target(&fabric, 7002, 64, 1);
    let config = InitiatorConfig {
        addr,
        locations: 4,
        size: 8,
        alignment: 64,
        duration: Duration::from_secs(1),
        ..InitiatorConfig::default()
    };

    let mut out = Vec::new();
    let err = initiator::run(&fabric, &config, &mut out).unwrap_err();
    assert!(err.is_configuration(), "{err}");
    assert!(out.is_empty());
    assert_eq!(fabric.open_connections(), 0);
}

#[test]
fn atomics_with_wrong_size_never_connect() {
    let fabric = LoopbackFabric::new();
    let config = InitiatorConfig {
        addr: "127.0.0.1:7003".parse().unwrap(),
        opcode: Opcode::FetchAdd,
        size: 16,
        ..InitiatorConfig::default()
    };
    let err = initiator::run(&fabric, &config, Vec::new()).unwrap_err();
    assert!(err.is_configuration(), "{err}");
    assert_eq!(fabric.open_connections(), 0);
}

#[test]
fn missing_target_is_a_transport_error() {
    let fabric = LoopbackFabric::new();
    let config = InitiatorConfig {
        addr: "127.0.0.1:7004".parse().unwrap(),
        duration: Duration::from_secs(1),
        ..InitiatorConfig::default()
    };
    let err = initiator::run(&fabric, &config, Vec::new()).unwrap_err();
    assert!(matches!(err, BenchError::TransportSetup { .. }), "{err}");
}

#[test]
fn fetch_add_counts_every_operation_at_the_fixed_location() {
    let fabric = LoopbackFabric::new();
    let (addr, buffer) = start_target(&fabric, 7005, 64, 4);
    let config = InitiatorConfig {
        addr,
        locations: -2,
        window: 8,
        cq_mod: 4,
        size: 8,
        alignment: 64,
        opcode: Opcode::FetchAdd,
        duration: Duration::from_secs(1),
        ..InitiatorConfig::default()
    };

    let summary = initiator::run(&fabric, &config, Vec::new()).unwrap();
    assert_eq!(summary.pipeline.submitted % 4, 0);
    assert_eq!(buffer.load_u64(2 * 64), summary.pipeline.submitted);
    assert_eq!(buffer.load_u64(0), 0);
    assert_eq!(buffer.load_u64(3 * 64), 0);
}

#[test]
fn latency_mode_reports_median_and_mean() {
    let fabric = LoopbackFabric::new();
    let (addr, _) = start_target(&fabric, 7006, 4096, 16);
    let config = InitiatorConfig {
        addr,
        locations: 16,
        window: 4,
        size: 256,
        alignment: 4096,
        opcode: Opcode::Read,
        mode: Mode::Latency,
        duration: Duration::from_secs(2),
        sample_cap: 1024,
        ..InitiatorConfig::default()
    };

    let mut out = Vec::new();
    let summary = initiator::run(&fabric, &config, &mut out).unwrap();
    let lines = report_lines(&out);
    assert_eq!(lines.len(), 2, "{lines:?}");
    let last = &lines[1];
    assert!(last.contains(" ns median\t"), "{last}");
    let count: usize = last
        .rsplit('\t')
        .next()
        .and_then(|field| field.strip_suffix(" samples"))
        .unwrap()
        .parse()
        .unwrap();
    assert!(count > 0 && count <= 1024, "{last}");
    assert_eq!(summary.pipeline.signaled, summary.pipeline.submitted);
}

#[test]
fn two_sided_sends_are_received() {
    let fabric = LoopbackFabric::new();
    let (addr, _) = start_target(&fabric, 7007, 64, 16);
    let config = InitiatorConfig {
        addr,
        locations: 1,
        window: 32,
        cq_mod: 8,
        size: 64,
        alignment: 64,
        inline_data: 64,
        opcode: Opcode::Send,
        duration: Duration::from_secs(1),
        ..InitiatorConfig::default()
    };

    let mut out = Vec::new();
    let summary = initiator::run(&fabric, &config, &mut out).unwrap();
    assert_eq!(report_lines(&out).len(), 1);
    assert!(summary.pipeline.submitted > 0);
    assert_eq!(summary.pipeline.submitted, summary.pipeline.completed);
    assert!(summary.remote.send);
}

#[test]
fn one_target_serves_consecutive_initiators() {
    let fabric = LoopbackFabric::new();
    let (addr, _) = start_target(&fabric, 7008, 64, 8);
    let config = InitiatorConfig {
        addr,
        locations: 8,
        window: 2,
        duration: Duration::from_secs(1),
        ..InitiatorConfig::default()
    };

    for _ in 0..2 {
        let summary = initiator::run(&fabric, &config, Vec::new()).unwrap();
        assert_eq!(summary.reports, 1);
    }
    assert_eq!(fabric.registrations(), 3);
}
