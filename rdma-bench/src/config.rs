use crate::location::Locations;
use crate::{BenchError, DEFAULT_PORT, Result, aligned_size};
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_SAMPLE_CAP: usize = 1_000_000;
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);
pub const ATOMIC_SIZE: usize = 8;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Read,
    Write,
    #[value(name = "fadd")]
    FetchAdd,
    #[value(name = "cas")]
    CompareSwap,
    Send,
}

impl Opcode {
    pub fn is_atomic(self) -> bool {
        matches!(self, Opcode::FetchAdd | Opcode::CompareSwap)
    }

    pub fn is_two_sided(self) -> bool {
        self == Opcode::Send
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Opcode::Read => "read",
            Opcode::Write => "write",
            Opcode::FetchAdd => "fadd",
            Opcode::CompareSwap => "cas",
            Opcode::Send => "send",
        };
        f.write_str(name)
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    #[value(name = "lat")]
    Latency,
    #[value(name = "bw")]
    Throughput,
}

#[derive(Debug, Clone)]
pub struct InitiatorConfig {
    pub addr: SocketAddr,
    /// Positive: number of locations visited in shuffled order.
    /// Zero or negative: the single location with index `|locations|`.
    pub locations: i64,
    pub window: usize,
    pub cq_mod: usize,
    pub opcode: Opcode,
    pub mode: Mode,
    pub duration: Duration,
    pub inline_data: usize,
    pub size: usize,
    pub alignment: usize,
    pub seed: Option<u64>,
    pub sample_cap: usize,
    pub connect_timeout: Duration,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            locations: 1,
            window: 1,
            cq_mod: 1,
            opcode: Opcode::Write,
            mode: Mode::Throughput,
            duration: Duration::from_secs(10),
            inline_data: 0,
            size: 8,
            alignment: 64,
            seed: None,
            sample_cap: DEFAULT_SAMPLE_CAP,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl InitiatorConfig {
    /// Checks every local constraint; runs before any connection attempt.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(BenchError::config("operation size must be non-zero"));
        }
        if self.size > u32::MAX as usize {
            return Err(BenchError::config(format!(
                "operation size {} exceeds a single scatter entry",
                self.size
            )));
        }
        if self.inline_data > u32::MAX as usize {
            return Err(BenchError::config(format!(
                "inline data size {} is too large",
                self.inline_data
            )));
        }
        if self.inline_data != 0 && self.inline_data < self.size {
            return Err(BenchError::config(format!(
                "inline data size {} is smaller than operation size {}",
                self.inline_data, self.size
            )));
        }
        if self.inline_data != 0 && (self.opcode.is_atomic() || self.opcode == Opcode::Read) {
            return Err(BenchError::config(format!(
                "inline data is not supported for {}",
                self.opcode
            )));
        }
        if self.window == 0 {
            return Err(BenchError::config("tx depth must be at least 1"));
        }
        if self.window > u32::MAX as usize / 2 {
            return Err(BenchError::config(format!("tx depth {} is too large", self.window)));
        }
        if self.cq_mod == 0 || self.cq_mod > self.window {
            return Err(BenchError::config(format!(
                "cq_mod {} must be between 1 and tx depth {}",
                self.cq_mod, self.window
            )));
        }
        let aligned = self.aligned_size()?;
        if self.opcode.is_atomic() {
            if self.size != ATOMIC_SIZE {
                return Err(BenchError::config(format!(
                    "{} requires an operation size of {ATOMIC_SIZE} bytes, got {}",
                    self.opcode, self.size
                )));
            }
            if aligned % ATOMIC_SIZE != 0 {
                return Err(BenchError::config(format!(
                    "{} requires {ATOMIC_SIZE}-byte aligned locations, got a stride of {aligned}",
                    self.opcode
                )));
            }
        }
        if self.mode == Mode::Latency && self.sample_cap == 0 {
            return Err(BenchError::config("latency sample cap must be non-zero"));
        }
        Locations::from_raw(self.locations)
            .slots()
            .checked_mul(aligned)
            .ok_or_else(|| BenchError::config("local buffer size overflows"))?;
        Ok(())
    }

    pub fn aligned_size(&self) -> Result<usize> {
        aligned_size(self.size, self.alignment).ok_or_else(|| {
            BenchError::config(format!(
                "cannot align size {} to {}",
                self.size, self.alignment
            ))
        })
    }

    pub fn location_set(&self) -> Locations {
        Locations::from_raw(self.locations)
    }
}

#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub addr: SocketAddr,
    pub size: usize,
    pub locations: usize,
    pub inline: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            size: 0,
            locations: 1,
            inline: false,
        }
    }
}

impl TargetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(BenchError::config("buffer size must be non-zero"));
        }
        if self.locations == 0 {
            return Err(BenchError::config("location count must be non-zero"));
        }
        self.buffer_size()?;
        Ok(())
    }

    pub fn buffer_size(&self) -> Result<usize> {
        self.size
            .checked_mul(self.locations)
            .ok_or_else(|| BenchError::config("target buffer size overflows"))
    }
}
