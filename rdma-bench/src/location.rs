use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

/// Which locations of the remote buffer the benchmark touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locations {
    /// Visit `[0, n)` in an order shuffled once at start, cycling forever.
    Cyclic(usize),
    /// Always target the location with this index.
    Fixed(usize),
}

impl Locations {
    /// Positive values select `Cyclic`, zero and negative values select
    /// `Fixed(|raw|)`.
    pub fn from_raw(raw: i64) -> Self {
        if raw > 0 {
            Locations::Cyclic(raw as usize)
        } else {
            Locations::Fixed(raw.unsigned_abs() as usize)
        }
    }

    /// Number of remote locations that must fit in the target's buffer.
    pub fn max_location(&self) -> usize {
        match *self {
            Locations::Cyclic(n) => n,
            Locations::Fixed(index) => index.saturating_add(1),
        }
    }

    /// Number of locations backed by the local buffer.
    pub fn slots(&self) -> usize {
        match *self {
            Locations::Cyclic(n) => n,
            Locations::Fixed(_) => 1,
        }
    }

    pub fn selector(&self, aligned_size: usize, seed: u64) -> LocationSelector {
        let order = match *self {
            Locations::Cyclic(n) => {
                let mut order: Vec<usize> = (0..n).collect();
                order.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
                order
            }
            Locations::Fixed(index) => vec![index],
        };
        let local_stride = if self.slots() > 1 { aligned_size } else { 0 };
        LocationSelector {
            order,
            cursor: 0,
            aligned_size,
            local_stride,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub index: usize,
    pub local_offset: usize,
    /// Offset from the remote buffer's base address.
    pub remote_offset: u64,
}

/// Endless cursor over a fixed visiting order.
#[derive(Debug, Clone)]
pub struct LocationSelector {
    order: Vec<usize>,
    cursor: usize,
    aligned_size: usize,
    local_stride: usize,
}

impl LocationSelector {
    #[inline]
    pub fn next_location(&mut self) -> Location {
        if self.cursor == self.order.len() {
            self.cursor = 0;
        }
        let index = self.order[self.cursor];
        self.cursor += 1;
        Location {
            index,
            local_offset: index * self.local_stride,
            remote_offset: index as u64 * self.aligned_size as u64,
        }
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }
}
