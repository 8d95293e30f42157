//! A growable column of `f64` values backed by same-sized chunks.
//!
//! Row positions translate to (chunk, offset) with power-of-two
//! arithmetic: chunk index is `position >> order`, offset is
//! `position & mask`. Growth only ever appends chunks, so addresses
//! and offsets handed out before a grow stay valid after it.

use std::hint::black_box;
use std::sync::Arc;

use crate::chunk::{ChunkFactory, DirectChunk};
use crate::error::AccessError;

pub struct Column {
    chunks: Vec<Arc<DirectChunk>>,
    /// Base-2 log of the chunk capacity.
    chunk_order: u32,
    /// Mask extracting the intra-chunk offset.
    chunk_mask: usize,
    capacity: usize,
    factory: ChunkFactory,
}

impl Column {
    /// Creates an empty column. The chunk capacity is the smallest
    /// power of two `>= chunk_capacity_hint`.
    pub fn new(chunk_capacity_hint: usize, factory: ChunkFactory) -> Self {
        let chunk_order = chunk_capacity_hint.max(1).next_power_of_two().trailing_zeros();
        Self {
            chunks: Vec::new(),
            chunk_order,
            chunk_mask: (1usize << chunk_order) - 1,
            capacity: 0,
            factory,
        }
    }

    /// Number of rows a single chunk holds.
    pub fn chunk_capacity(&self) -> usize {
        1usize << self.chunk_order
    }

    /// Number of rows this column can currently hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> &[Arc<DirectChunk>] {
        &self.chunks
    }

    /// Chunk holding the given row.
    #[inline]
    pub fn chunk_index(&self, position: usize) -> usize {
        position >> self.chunk_order
    }

    /// Position of the given row inside its chunk.
    #[inline]
    pub fn chunk_offset(&self, position: usize) -> usize {
        position & self.chunk_mask
    }

    /// Grows the column until it can hold `capacity` rows. Idempotent,
    /// append-only: existing chunks are never moved or replaced, so a
    /// no-op when the column is already big enough. Returns the
    /// requested target, not the (possibly larger) resulting capacity.
    ///
    /// Must not be called concurrently with a read or write pass; the
    /// caller serializes growth externally.
    pub fn ensure_capacity(&mut self, capacity: usize) -> Result<usize, AccessError> {
        if self.capacity < capacity {
            let target_chunks = 1 + self.chunk_index(capacity - 1);
            while self.chunks.len() < target_chunks {
                let chunk = (self.factory)(self.chunk_capacity())?;
                self.chunks.push(Arc::new(chunk));
            }
            self.capacity = self.chunks.len() << self.chunk_order;
        }
        Ok(capacity)
    }

    /// Bounds-checked read.
    pub fn read(&self, position: usize) -> Result<f64, AccessError> {
        if position >= self.capacity {
            return Err(AccessError::OutOfBounds {
                position,
                capacity: self.capacity,
            });
        }
        // SAFETY: position < capacity, so the chunk index is valid and
        // the offset is within the chunk.
        Ok(unsafe { self.read_unchecked(position) })
    }

    /// Bounds-checked write.
    pub fn write(&self, position: usize, value: f64) -> Result<(), AccessError> {
        if position >= self.capacity {
            return Err(AccessError::OutOfBounds {
                position,
                capacity: self.capacity,
            });
        }
        // SAFETY: as in read().
        unsafe { self.write_unchecked(position, value) };
        Ok(())
    }

    /// Unchecked hot-path read.
    ///
    /// # Safety
    /// `position < self.capacity()`.
    #[inline]
    pub unsafe fn read_unchecked(&self, position: usize) -> f64 {
        debug_assert!(position < self.capacity);
        self.chunks
            .get_unchecked(self.chunk_index(position))
            .read_unchecked(self.chunk_offset(position))
    }

    /// Unchecked hot-path write.
    ///
    /// # Safety
    /// `position < self.capacity()`, and no concurrent writer for the
    /// same chunk.
    #[inline]
    pub unsafe fn write_unchecked(&self, position: usize, value: f64) {
        debug_assert!(position < self.capacity);
        self.chunks
            .get_unchecked(self.chunk_index(position))
            .write_unchecked(self.chunk_offset(position), value);
    }

    /// Sum of every stored value, accumulated in chunk order then
    /// offset order. Deterministic by construction, which is what the
    /// benchmark needs for reproducible checks; never the fast path.
    pub fn sum(&self) -> f64 {
        let chunk_capacity = self.chunk_capacity();
        let mut result = 0.0;
        for chunk in &self.chunks {
            for r in 0..chunk_capacity {
                // SAFETY: r < chunk capacity by loop bound.
                result += unsafe { chunk.read_unchecked(r) };
            }
        }
        result
    }

    /// Touches every element in order. Only exists to time memory
    /// traffic: the sentinel derives from the data and every read goes
    /// through `black_box`, so the scan cannot be optimized away. The
    /// returned value is very likely `false`.
    pub fn read_all(&self) -> bool {
        let chunk_capacity = self.chunk_capacity();
        let mut sentinel = false;
        for chunk in &self.chunks {
            for r in 0..chunk_capacity {
                // SAFETY: r < chunk capacity by loop bound.
                sentinel = black_box(unsafe { chunk.read_unchecked(r) }) == 0.0;
            }
        }
        sentinel
    }

    /// Degraded variant of [`Column::read_all`] with a data-dependent
    /// branch per element, for comparing against the straight scan.
    pub fn slow_read_all(&self) -> bool {
        let chunk_capacity = self.chunk_capacity();
        let mut sentinel = false;
        for chunk in &self.chunks {
            for r in 0..chunk_capacity {
                if !sentinel {
                    // SAFETY: r < chunk capacity by loop bound.
                    sentinel = black_box(unsafe { chunk.read_unchecked(r) }) == 0.0;
                }
            }
        }
        sentinel
    }

    /// Checks that every chunk actually resides on `expected`.
    ///
    /// `None` skips the check (no verification requested). On mismatch
    /// the error carries the full per-node distribution; a wrong
    /// placement is never silently corrected, since it would invalidate
    /// whatever the benchmark measured.
    pub fn verify_node_affinity(&self, expected: Option<usize>) -> Result<(), AccessError> {
        let Some(expected) = expected else {
            return Ok(());
        };
        let Some(first) = self.chunks.first() else {
            return Ok(());
        };

        let mut histogram = vec![0usize; first.platform().node_count()];
        for chunk in &self.chunks {
            let node = chunk.resolved_node()?;
            if node >= histogram.len() {
                histogram.resize(node + 1, 0);
            }
            histogram[node] += 1;
        }

        if histogram.get(expected).copied().unwrap_or(0) == self.chunks.len() {
            Ok(())
        } else {
            Err(AccessError::AffinityViolation {
                expected,
                histogram,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{mmap_factory, node_alloc_factory};
    use crate::testing::MockPlatform;

    fn column(chunk_capacity: usize) -> Column {
        Column::new(chunk_capacity, mmap_factory(MockPlatform::shared(1, 4)))
    }

    #[test]
    fn hint_rounds_up_to_a_power_of_two() {
        assert_eq!(column(1000).chunk_capacity(), 1024);
        assert_eq!(column(1024).chunk_capacity(), 1024);
        assert_eq!(column(1025).chunk_capacity(), 2048);
        assert_eq!(column(1).chunk_capacity(), 1);
    }

    #[test]
    fn starts_empty() {
        let col = column(64);
        assert_eq!(col.capacity(), 0);
        assert_eq!(col.chunk_count(), 0);
        assert!(matches!(col.read(0), Err(AccessError::OutOfBounds { .. })));
    }

    #[test]
    fn index_and_offset_identities() {
        let col = column(64); // order 6
        for p in [0usize, 1, 63, 64, 65, 127, 128, 1000, 4095] {
            assert_eq!(col.chunk_index(p), p >> 6);
            assert_eq!(col.chunk_offset(p), p & 63);
            assert!(col.chunk_offset(p) < col.chunk_capacity());
        }
    }

    #[test]
    fn ensure_capacity_appends_exactly_enough_chunks() {
        let mut col = column(64);
        assert_eq!(col.ensure_capacity(1).unwrap(), 1);
        assert_eq!(col.chunk_count(), 1);
        assert_eq!(col.capacity(), 64);

        assert_eq!(col.ensure_capacity(65).unwrap(), 65);
        assert_eq!(col.chunk_count(), 2);
        assert_eq!(col.capacity(), 128);

        // Idempotent below the current capacity.
        col.ensure_capacity(10).unwrap();
        assert_eq!(col.chunk_count(), 2);
    }

    #[test]
    fn growth_preserves_existing_data() {
        let mut col = column(16);
        col.ensure_capacity(16).unwrap();
        for p in 0..16 {
            col.write(p, p as f64).unwrap();
        }
        let addresses: Vec<usize> = col.chunks().iter().map(|c| c.address()).collect();

        col.ensure_capacity(160).unwrap();
        for p in 0..16 {
            assert_eq!(col.read(p).unwrap(), p as f64);
        }
        // Old chunks were not relocated.
        for (chunk, addr) in col.chunks().iter().zip(addresses) {
            assert_eq!(chunk.address(), addr);
        }
    }

    #[test]
    fn round_trips_across_chunk_boundaries() {
        let mut col = column(8);
        col.ensure_capacity(40).unwrap();
        for p in 0..col.capacity() {
            col.write(p, (p * 3) as f64).unwrap();
        }
        for p in 0..col.capacity() {
            assert_eq!(col.read(p).unwrap(), (p * 3) as f64);
        }
    }

    #[test]
    fn sum_is_deterministic_over_the_whole_capacity() {
        let mut col = column(32);
        col.ensure_capacity(100).unwrap(); // rounds up to 4 chunks = 128
        for p in 0..100 {
            col.write(p, 1.0).unwrap();
        }
        // Unwritten tail positions are zero-filled by the platform.
        assert_eq!(col.sum(), 100.0);
    }

    #[test]
    fn read_all_touches_without_failing() {
        let mut col = column(16);
        col.ensure_capacity(64).unwrap();
        for p in 0..64 {
            col.write(p, 1.0).unwrap();
        }
        // All values are non-zero, so both sentinels stay false.
        assert!(!col.read_all());
        assert!(!col.slow_read_all());
    }

    #[test]
    fn affinity_check_passes_when_all_chunks_match() {
        let platform = MockPlatform::shared(2, 8);
        let mut col = Column::new(16, node_alloc_factory(platform, 1));
        col.ensure_capacity(64).unwrap();
        col.verify_node_affinity(Some(1)).unwrap();
        // No verification requested.
        col.verify_node_affinity(None).unwrap();
    }

    #[test]
    fn affinity_check_reports_the_distribution() {
        let platform = MockPlatform::shared(2, 8);
        let mut col = Column::new(16, node_alloc_factory(platform, 1));
        col.ensure_capacity(64).unwrap();
        let err = col.verify_node_affinity(Some(0)).unwrap_err();
        match err {
            AccessError::AffinityViolation {
                expected,
                histogram,
            } => {
                assert_eq!(expected, 0);
                assert_eq!(histogram.iter().sum::<usize>(), col.chunk_count());
                assert_eq!(histogram[1], col.chunk_count());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_column_trivially_satisfies_affinity() {
        let col = column(16);
        col.verify_node_affinity(Some(0)).unwrap();
    }
}
