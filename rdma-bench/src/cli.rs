//! Command-line surfaces of the binaries.

use crate::config::{DEFAULT_SAMPLE_CAP, InitiatorConfig, Mode, Opcode, TargetConfig};
use crate::{DEFAULT_PORT, GI_B, KI_B, MI_B};
use clap::Parser;
use clap::error::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Options shared by every binary that drives a benchmark.
#[derive(Debug, Clone, clap::Args)]
pub struct BenchOptions {
    /// Number of remote locations; zero or negative targets only location |N|
    #[arg(short, long, default_value_t = 1, allow_negative_numbers = true)]
    pub locations: i64,

    /// Operations kept in flight
    #[arg(long = "tx", default_value_t = 1)]
    pub window: usize,

    /// Request a completion for every N-th operation
    #[arg(long, default_value_t = 1)]
    pub cq_mod: usize,

    #[arg(long = "op", value_enum, default_value_t = Opcode::Write)]
    pub opcode: Opcode,

    #[arg(short = 't', long = "type", value_enum, default_value_t = Mode::Throughput)]
    pub mode: Mode,

    /// Run time in seconds
    #[arg(short, long, default_value_t = 10)]
    pub duration: u64,

    /// Maximum inline data; 0 disables inlining
    #[arg(short, long = "inline", default_value = "0", value_parser = parse_size)]
    pub inline_data: usize,

    /// Operation size, e.g. 8, 4K, 1M
    #[arg(short, long, default_value = "8", value_parser = parse_size)]
    pub size: usize,

    /// Distance between locations is the size rounded up to this
    #[arg(short, long, default_value = "64", value_parser = parse_size)]
    pub alignment: usize,

    /// Seed for the location order
    #[arg(long)]
    pub seed: Option<u64>,

    /// Latency samples kept per report interval
    #[arg(long, default_value_t = DEFAULT_SAMPLE_CAP)]
    pub sample_cap: usize,
}

impl BenchOptions {
    pub fn into_config(self, addr: SocketAddr) -> InitiatorConfig {
        InitiatorConfig {
            addr,
            locations: self.locations,
            window: self.window,
            cq_mod: self.cq_mod,
            opcode: self.opcode,
            mode: self.mode,
            duration: Duration::from_secs(self.duration),
            inline_data: self.inline_data,
            size: self.size,
            alignment: self.alignment,
            seed: self.seed,
            sample_cap: self.sample_cap,
            ..InitiatorConfig::default()
        }
    }
}

#[derive(Debug, Parser)]
#[command(version, about = "Drive RDMA operations against a target and report throughput or latency.")]
pub struct InitiatorArgs {
    pub ip: IpAddr,

    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[command(flatten)]
    pub bench: BenchOptions,

    #[arg(long, default_value_t = Level::INFO)]
    pub log: Level,
}

impl From<InitiatorArgs> for InitiatorConfig {
    fn from(args: InitiatorArgs) -> Self {
        args.bench.into_config(SocketAddr::new(args.ip, args.port))
    }
}

#[derive(Debug, Parser)]
#[command(version, about = "Expose a zeroed buffer to RDMA initiators.")]
pub struct TargetArgs {
    #[arg(default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub ip: IpAddr,

    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Size of one location, e.g. 64, 4K, 1M
    #[arg(short, long, value_parser = parse_size)]
    pub size: usize,

    /// Number of locations
    #[arg(short, long, default_value_t = 1)]
    pub locations: usize,

    /// Allow inline sends of up to one location
    #[arg(short, long)]
    pub inline: bool,

    #[arg(long, default_value_t = Level::INFO)]
    pub log: Level,
}

impl From<TargetArgs> for TargetConfig {
    fn from(args: TargetArgs) -> Self {
        TargetConfig {
            addr: SocketAddr::new(args.ip, args.port),
            size: args.size,
            locations: args.locations,
            inline: args.inline,
        }
    }
}

#[derive(Debug, Parser)]
#[command(version, about = "Run a target and an initiator in one process over the loopback fabric.")]
pub struct LoopbackArgs {
    #[command(flatten)]
    pub bench: BenchOptions,

    /// Size of the target's buffer
    #[arg(long, default_value = "1M", value_parser = parse_size)]
    pub target_size: usize,

    #[arg(long, default_value_t = Level::INFO)]
    pub log: Level,
}

impl LoopbackArgs {
    pub fn configs(self) -> (TargetConfig, InitiatorConfig) {
        let target = TargetConfig {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            size: self.target_size,
            locations: 1,
            inline: self.bench.inline_data > 0,
        };
        let initiator = self.bench.into_config(target.addr);
        (target, initiator)
    }
}

/// Parses `8`, `4K`, `4KiB`, `1M`, `2G` (binary multiples).
pub fn parse_size(value: &str) -> Result<usize, String> {
    let value = value.trim();
    let digits = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    let (number, unit) = value.split_at(digits);
    let number: usize = number.parse().map_err(|_| format!("invalid size `{value}`"))?;
    let multiplier = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => KI_B,
        "M" | "MB" | "MIB" => MI_B,
        "G" | "GB" | "GIB" => GI_B,
        _ => return Err(format!("unknown size unit `{unit}`")),
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size `{value}` overflows"))
}

/// Parses arguments; help and version output exit with status 1, usage
/// errors with clap's status 2.
pub fn parse_or_exit<T: Parser>() -> T {
    match T::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            process::exit(1);
        }
        Err(e) => e.exit(),
    }
}

/// Logs go to stderr so report lines on stdout stay machine readable.
pub fn init_tracing(level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::from_level(level).into())
                .from_env_lossy(),
        )
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_with_units() {
        assert_eq!(parse_size("8"), Ok(8));
        assert_eq!(parse_size("4K"), Ok(4096));
        assert_eq!(parse_size("4kib"), Ok(4096));
        assert_eq!(parse_size("1M"), Ok(MI_B));
        assert_eq!(parse_size("2G"), Ok(2 * GI_B));
        assert!(parse_size("K").is_err());
        assert!(parse_size("3X").is_err());
        assert!(parse_size("-1").is_err());
    }

    #[test]
    fn initiator_defaults() {
        let args = InitiatorArgs::try_parse_from(["rdma-bench-initiator", "10.0.0.1"]).unwrap();
        let config = InitiatorConfig::from(args);
        assert_eq!(config.addr, "10.0.0.1:13345".parse().unwrap());
        assert_eq!(config.window, 1);
        assert_eq!(config.opcode, Opcode::Write);
        assert_eq!(config.mode, Mode::Throughput);
        assert_eq!(config.duration, Duration::from_secs(10));
        config.validate().unwrap();
    }

    #[test]
    fn initiator_options() {
        let args = InitiatorArgs::try_parse_from([
            "rdma-bench-initiator",
            "10.0.0.1",
            "4791",
            "-l",
            "-3",
            "--tx",
            "32",
            "--cq-mod",
            "8",
            "--op",
            "fadd",
            "-t",
            "lat",
            "-s",
            "8",
            "-a",
            "4K",
            "--seed",
            "7",
        ])
        .unwrap();
        let config = InitiatorConfig::from(args);
        assert_eq!(config.addr.port(), 4791);
        assert_eq!(config.locations, -3);
        assert_eq!(config.window, 32);
        assert_eq!(config.cq_mod, 8);
        assert_eq!(config.opcode, Opcode::FetchAdd);
        assert_eq!(config.mode, Mode::Latency);
        assert_eq!(config.alignment, 4096);
        assert_eq!(config.seed, Some(7));
    }

    #[test]
    fn help_is_reported_as_its_own_kind() {
        let err = InitiatorArgs::try_parse_from(["rdma-bench-initiator", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        let err = InitiatorArgs::try_parse_from(["rdma-bench-initiator", "10.0.0.1", "--op", "xor"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn target_requires_size() {
        assert!(TargetArgs::try_parse_from(["rdma-bench-target"]).is_err());
        let args = TargetArgs::try_parse_from(["rdma-bench-target", "-s", "1M", "-l", "4", "-i"]).unwrap();
        let config = TargetConfig::from(args);
        assert_eq!(config.addr, "0.0.0.0:13345".parse().unwrap());
        assert_eq!(config.buffer_size().unwrap(), 4 * MI_B);
        assert!(config.inline);
    }
}
