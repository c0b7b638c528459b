//! Statistical buckets derived from recorded events.

use std::num::NonZero;

use foldhash::{HashMap, HashMapExt};

/// Aggregated statistics of the allocations sharing one grouping key (the whole process,
/// a thread, a call stack or a single stack frame).
///
/// Only allocations contribute; deallocations never reach a bucket.
#[derive(Clone, Debug, Default)]
pub struct StatBucket {
    count: u64,
    total_size: u128,
    max_size: usize,

    // Allocation size -> number of allocations of exactly that size.
    size_frequency: HashMap<usize, u64>,
}

impl StatBucket {
    pub(crate) fn new() -> Self {
        Self {
            count: 0,
            total_size: 0,
            max_size: 0,
            size_frequency: HashMap::new(),
        }
    }

    /// Adds one allocation of `size` bytes. Zero-sized entries (deallocations) are ignored.
    pub(crate) fn register(&mut self, size: usize) {
        if size == 0 {
            return;
        }

        self.count = self.count.saturating_add(1);
        self.total_size = self.total_size.saturating_add(size as u128);
        self.max_size = self.max_size.max(size);

        let frequency = self.size_frequency.entry(size).or_insert(0);
        *frequency = frequency.saturating_add(1);
    }

    /// Number of allocations.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of the sizes of all allocations, in bytes.
    #[must_use]
    pub fn total_size(&self) -> u128 {
        self.total_size
    }

    /// Size of the largest allocation, in bytes. Zero if the bucket is empty.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Whether no allocation contributed to this bucket.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of allocations of each distinct size, ordered by ascending size.
    pub fn size_frequency(&self) -> impl Iterator<Item = (usize, u64)> {
        let mut frequencies: Vec<_> = self
            .size_frequency
            .iter()
            .map(|(&size, &count)| (size, count))
            .collect();
        frequencies.sort_unstable_by_key(|&(size, _)| size);
        frequencies.into_iter()
    }

    /// Distributes the allocations of this bucket over `bins` equally wide size ranges
    /// spanning `1..=max_size`.
    #[must_use]
    pub fn histogram(&self, bins: NonZero<u16>) -> Histogram {
        let mut counts = vec![0_u64; usize::from(bins.get())].into_boxed_slice();

        if let Some(max_size) = NonZero::new(self.max_size) {
            for (&size, &frequency) in &self.size_frequency {
                let bin = Histogram::bin_of(size, max_size, bins);

                // The bin index is always in range because every registered size is at most
                // `max_size`; we still refuse to index out of bounds.
                debug_assert!(bin < counts.len());
                if let Some(slot) = counts.get_mut(bin) {
                    *slot = slot.saturating_add(frequency);
                }
            }
        }

        Histogram { counts }
    }
}

/// Number of allocations per size range of a [`StatBucket`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Histogram {
    counts: Box<[u64]>,
}

impl Histogram {
    /// The bin for an allocation of `size` bytes in a bucket whose largest allocation is
    /// `max_size` bytes: `floor(bins * (size - 1) / max_size)`.
    ///
    /// Sizes are expected to be in `1..=max_size`; out-of-range sizes are clamped.
    #[must_use]
    pub fn bin_of(size: usize, max_size: NonZero<usize>, bins: NonZero<u16>) -> usize {
        let size = size.clamp(1, max_size.get());

        let scaled = u128::from(bins.get()).saturating_mul(size.saturating_sub(1) as u128);

        #[expect(
            clippy::integer_division,
            reason = "the floor of the ratio is the definition of the bin"
        )]
        let bin = scaled / max_size.get() as u128;

        // `size - 1 < max_size`, so `bin < bins`, which always fits.
        usize::try_from(bin).unwrap_or(usize::MAX)
    }

    /// Number of allocations in each bin, from the smallest sizes to the largest.
    #[must_use]
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Count of the fullest bin. Zero for an empty bucket.
    #[must_use]
    pub fn largest(&self) -> u64 {
        self.counts.iter().copied().max().unwrap_or(0)
    }
}
