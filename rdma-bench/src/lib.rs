pub mod cli;
pub mod config;
pub mod error;
pub mod initiator;
pub mod location;
pub mod memory;
pub mod pipeline;
pub mod protocol;
pub mod reporter;
pub mod stats;
pub mod target;
pub mod transport;

pub use error::{BenchError, Result};

pub const KI_B: usize = 1024;
pub const MI_B: usize = 1024 * KI_B;
pub const GI_B: usize = 1024 * MI_B;

pub const DEFAULT_PORT: u16 = 13345;

/// Rounds `size` up to the next multiple of `alignment`.
///
/// Returns `None` for a zero alignment or on overflow.
pub fn aligned_size(size: usize, alignment: usize) -> Option<usize> {
    if alignment == 0 {
        return None;
    }
    size.div_ceil(alignment).checked_mul(alignment)
}
