//! Segments of the pipe's chain and the free list that recycles them.
//!
//! A [Segment] binds one memory [Block] and tracks how many bytes of it hold
//! data (`end`) and where the segment starts in the stream (`running_index`).
//! The chain itself is owned by the pipe, which links segments in order so that
//! `running_index(next) == running_index(prev) + prev.end`.

use crate::pool::{Block, BufferPool};
use tracing::trace;

/// One block of memory and its valid-byte window.
#[derive(Default)]
pub(crate) struct Segment {
    block: Option<Block>,
    end: usize,
    running_index: u64,
}

impl Segment {
    /// Returns the number of bytes written into the segment.
    #[inline]
    pub(crate) fn end(&self) -> usize {
        self.end
    }

    /// Returns the offset of the segment's first byte within the stream.
    #[inline]
    pub(crate) fn running_index(&self) -> u64 {
        self.running_index
    }

    /// Returns the offset one past the segment's last written byte.
    #[inline]
    pub(crate) fn end_index(&self) -> u64 {
        self.running_index + self.end as u64
    }

    /// Returns the size of the bound block (zero if unbound).
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.block.as_ref().map_or(0, Block::capacity)
    }

    /// Returns the number of bytes that can still be written after `end`.
    #[inline]
    pub(crate) fn writable(&self) -> usize {
        self.capacity() - self.end
    }

    /// Returns a pointer to the first byte of the bound block.
    ///
    /// # Panics
    ///
    /// Panics if no block is bound.
    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.block
            .as_ref()
            .expect("segment has no memory bound")
            .as_ptr()
    }

    /// Extends the valid-byte window by `n` bytes.
    pub(crate) fn commit(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.capacity());
        self.end += n;
    }

    /// Places the segment at `running_index` within the stream.
    pub(crate) fn set_running_index(&mut self, running_index: u64) {
        self.running_index = running_index;
    }

    /// Binds `block` to the segment, releasing any block it held.
    pub(crate) fn bind(&mut self, block: Block) {
        debug_assert_eq!(self.end, 0);
        self.block = Some(block);
    }

    /// Releases the bound memory (returning it to its pool if pooled) and
    /// clears all bookkeeping.
    pub(crate) fn reset(&mut self) {
        self.block = None;
        self.end = 0;
        self.running_index = 0;
    }
}

/// Recomputes `running_index` for every segment after the first in `chain`.
pub(crate) fn relink<'a>(chain: impl IntoIterator<Item = &'a mut Segment>) {
    let mut next = None;
    for segment in chain {
        if let Some(running_index) = next {
            segment.running_index = running_index;
        }
        next = Some(segment.end_index());
    }
}

/// Capacity-bounded stack of reset segments owned by a single pipe.
pub(crate) struct SegmentPool {
    segments: Vec<Segment>,
    capacity: usize,
}

impl SegmentPool {
    /// Creates an empty free list retaining at most `capacity` segments.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            segments: Vec::new(),
            capacity,
        }
    }

    /// Returns the number of segments waiting for reuse.
    pub(crate) fn len(&self) -> usize {
        self.segments.len()
    }

    /// Pops a recycled segment (or creates one) and binds a block sized for
    /// `size_hint`.
    ///
    /// The block holds `max(minimum_segment_size, size_hint)` bytes, clamped to
    /// the pool's largest class. A hint above that class receives an unpooled
    /// block of exactly `size_hint` bytes.
    pub(crate) fn acquire(
        &mut self,
        pool: &BufferPool,
        minimum_segment_size: usize,
        size_hint: usize,
    ) -> Segment {
        let mut segment = self.segments.pop().unwrap_or_default();
        let max_size = pool.max_size();
        let block = if size_hint <= max_size {
            pool.alloc(size_hint.max(minimum_segment_size).min(max_size))
        } else {
            pool.alloc(size_hint)
        };
        trace!(
            capacity = block.capacity(),
            pooled = block.is_pooled(),
            size_hint,
            "acquired segment"
        );
        segment.bind(block);
        segment
    }

    /// Resets `segment` and keeps it for reuse if there is room.
    pub(crate) fn release(&mut self, mut segment: Segment) {
        segment.reset();
        if self.segments.len() < self.capacity {
            self.segments.push(segment);
        }
    }
}
