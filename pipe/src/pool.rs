//! Pool of reusable memory blocks backing pipe segments.
//!
//! Blocks are organized into power-of-two size classes from `min_size` to
//! `max_size`. For example, with `min_size = 4096` and `max_size = 32768`:
//! - Class 0: 4096 bytes
//! - Class 1: 8192 bytes
//! - Class 2: 16384 bytes
//! - Class 3: 32768 bytes
//!
//! Requests are rounded up to the next size class. Requests larger than
//! `max_size` return [PoolError::Oversized] from [BufferPool::try_alloc], or fall
//! back to an unpooled block of exactly the requested size from [BufferPool::alloc].
//!
//! # Thread Safety
//!
//! [BufferPool] is `Send + Sync` and can be shared by any number of pipes.
//! Allocation and return are lock-free (atomic counters and a
//! [crossbeam_queue::ArrayQueue] per size class).
//!
//! # Pool Lifecycle
//!
//! Pooled blocks hold a weak reference to the pool. A block returned after the
//! pool is dropped is deallocated directly.

use crossbeam_queue::ArrayQueue;
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    mem::ManuallyDrop,
    num::NonZeroUsize,
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
};

/// Error returned when pooled allocation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The requested capacity exceeds the maximum block size.
    Oversized,
    /// The pool is exhausted for the required size class.
    Exhausted,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Oversized => write!(f, "requested capacity exceeds maximum block size"),
            Self::Exhausted => write!(f, "pool exhausted for required size class"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Returns the cache line size for the current architecture.
///
/// Uses 128 bytes for x86_64 and aarch64 as a conservative estimate that
/// accounts for spatial prefetching. Uses 64 bytes for other architectures.
const fn cache_line_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))] {
            128
        } else {
            64
        }
    }
}

/// Configuration for a [BufferPool].
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Minimum block size. Must be >= alignment and a power of two.
    pub min_size: NonZeroUsize,
    /// Maximum block size. Must be a power of two and >= min_size.
    pub max_size: NonZeroUsize,
    /// Maximum number of blocks retained per size class.
    pub max_per_class: NonZeroUsize,
    /// Whether to pre-allocate all blocks on pool creation.
    pub prefill: bool,
    /// Block alignment. Must be a power of two.
    pub alignment: NonZeroUsize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self::for_network()
    }
}

impl BufferPoolConfig {
    /// Network preset: cache-line aligned, cache_line_size to 64KB blocks,
    /// 1024 per class, not prefilled.
    pub const fn for_network() -> Self {
        let cache_line = NZUsize!(cache_line_size());
        Self {
            min_size: cache_line,
            max_size: NZUsize!(64 * 1024),
            max_per_class: NZUsize!(1024),
            prefill: false,
            alignment: cache_line,
        }
    }

    /// Validates the configuration, panicking on invalid values.
    ///
    /// # Panics
    ///
    /// - `alignment` is not a power of two
    /// - `min_size` is not a power of two
    /// - `max_size` is not a power of two
    /// - `min_size < alignment`
    /// - `max_size < min_size`
    fn validate(&self) {
        assert!(
            self.alignment.is_power_of_two(),
            "alignment must be a power of two"
        );
        assert!(
            self.min_size.is_power_of_two(),
            "min_size must be a power of two"
        );
        assert!(
            self.max_size.is_power_of_two(),
            "max_size must be a power of two"
        );
        assert!(
            self.min_size >= self.alignment,
            "min_size ({}) must be >= alignment ({})",
            self.min_size,
            self.alignment
        );
        assert!(
            self.max_size >= self.min_size,
            "max_size must be >= min_size"
        );
    }

    /// Returns the number of size classes.
    fn num_classes(&self) -> usize {
        // Classes are: min_size, min_size*2, min_size*4, ..., max_size
        (self.max_size.get() / self.min_size.get()).trailing_zeros() as usize + 1
    }

    /// Returns the size class index for a given size, or `None` if size > max_size.
    fn class_index(&self, size: usize) -> Option<usize> {
        if size > self.max_size.get() {
            return None;
        }
        if size <= self.min_size.get() {
            return Some(0);
        }
        let size_class = size.next_power_of_two();
        let index = (size_class / self.min_size.get()).trailing_zeros() as usize;
        (index < self.num_classes()).then_some(index)
    }

    /// Returns the block size for a given class index.
    const fn class_size(&self, index: usize) -> usize {
        self.min_size.get() << index
    }
}

/// A zero-initialized, aligned allocation.
///
/// Memory is zeroed on allocation so every byte of the block may be handed out
/// as an initialized `&mut [u8]`.
pub(crate) struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: AlignedBuffer owns its memory and can be sent between threads.
unsafe impl Send for AlignedBuffer {}
// SAFETY: AlignedBuffer exposes only raw pointers; callers synchronize access to the bytes.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates a new zeroed buffer with the given capacity and alignment.
    ///
    /// # Panics
    ///
    /// Panics if allocation fails or the layout is invalid.
    fn new(capacity: usize, alignment: usize) -> Self {
        let layout = Layout::from_size_align(capacity.max(1), alignment).expect("invalid layout");

        // SAFETY: Layout is valid (non-zero size, power-of-two alignment).
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("allocation failed");

        Self { ptr, layout }
    }

    #[inline]
    const fn capacity(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Per-size-class state.
///
/// The freelist stores `Option<AlignedBuffer>` where:
/// - `Some(buf)` = a reusable block
/// - `None` = an available slot for creating a new block
struct SizeClass {
    size: usize,
    alignment: usize,
    freelist: ArrayQueue<Option<AlignedBuffer>>,
    /// Number of blocks currently rented out.
    allocated: AtomicUsize,
    /// Number of reusable blocks sitting in the freelist.
    available: AtomicUsize,
}

impl SizeClass {
    fn new(size: usize, alignment: usize, max_blocks: usize, prefill: bool) -> Self {
        let freelist = ArrayQueue::new(max_blocks);
        for _ in 0..max_blocks {
            let entry = prefill.then(|| AlignedBuffer::new(size, alignment));
            let _ = freelist.push(entry);
        }
        Self {
            size,
            alignment,
            freelist,
            allocated: AtomicUsize::new(0),
            available: AtomicUsize::new(if prefill { max_blocks } else { 0 }),
        }
    }
}

struct BufferPoolInner {
    config: BufferPoolConfig,
    classes: Vec<SizeClass>,
}

impl BufferPoolInner {
    fn try_alloc(&self, class_index: usize) -> Option<AlignedBuffer> {
        let class = &self.classes[class_index];
        match class.freelist.pop() {
            Some(Some(buffer)) => {
                class.allocated.fetch_add(1, Ordering::Relaxed);
                class.available.fetch_sub(1, Ordering::Relaxed);
                Some(buffer)
            }
            Some(None) => {
                class.allocated.fetch_add(1, Ordering::Relaxed);
                Some(AlignedBuffer::new(class.size, class.alignment))
            }
            None => None,
        }
    }

    fn return_buffer(&self, buffer: AlignedBuffer) {
        let Some(class_index) = self.config.class_index(buffer.capacity()) else {
            return;
        };
        let class = &self.classes[class_index];
        class.allocated.fetch_sub(1, Ordering::Relaxed);
        if class.freelist.push(Some(buffer)).is_ok() {
            class.available.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A pool of reusable, aligned memory blocks.
///
/// When a block is requested, the smallest size class that fits is used.
/// Pooled blocks return to the pool when dropped.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BufferPoolConfig::default())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.inner.config)
            .field("num_classes", &self.inner.classes.len())
            .finish()
    }
}

impl BufferPool {
    /// Creates a new pool with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn new(config: BufferPoolConfig) -> Self {
        config.validate();

        let classes = (0..config.num_classes())
            .map(|i| {
                SizeClass::new(
                    config.class_size(i),
                    config.alignment.get(),
                    config.max_per_class.get(),
                    config.prefill,
                )
            })
            .collect();

        Self {
            inner: Arc::new(BufferPoolInner { config, classes }),
        }
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &BufferPoolConfig {
        &self.inner.config
    }

    /// Returns the largest block size the pool can serve.
    pub fn max_size(&self) -> usize {
        self.inner.config.max_size.get()
    }

    /// Returns the number of pooled blocks currently rented out.
    pub fn allocated(&self) -> usize {
        self.inner
            .classes
            .iter()
            .map(|class| class.allocated.load(Ordering::Relaxed))
            .sum()
    }

    /// Returns the number of blocks waiting in the free lists for reuse.
    pub fn available(&self) -> usize {
        self.inner
            .classes
            .iter()
            .map(|class| class.available.load(Ordering::Relaxed))
            .sum()
    }

    /// Allocates a block with at least `capacity` bytes.
    ///
    /// Falls back to an unpooled block (deallocated on drop) if `capacity`
    /// exceeds `max_size` or the size class is exhausted.
    pub(crate) fn alloc(&self, capacity: usize) -> Block {
        self.try_alloc(capacity).unwrap_or_else(|_| {
            let size = capacity.max(self.inner.config.min_size.get());
            Block::Unpooled(AlignedBuffer::new(size, self.inner.config.alignment.get()))
        })
    }

    /// Attempts to allocate a pooled block.
    ///
    /// # Errors
    ///
    /// - [PoolError::Oversized]: `capacity` exceeds `max_size`
    /// - [PoolError::Exhausted]: pool exhausted for required size class
    pub(crate) fn try_alloc(&self, capacity: usize) -> Result<Block, PoolError> {
        let class_index = self
            .inner
            .config
            .class_index(capacity)
            .ok_or(PoolError::Oversized)?;
        let buffer = self
            .inner
            .try_alloc(class_index)
            .ok_or(PoolError::Exhausted)?;
        Ok(Block::Pooled(PooledBlock {
            buffer: ManuallyDrop::new(buffer),
            pool: Arc::downgrade(&self.inner),
        }))
    }
}

/// A block rented from a [BufferPool], returned on drop.
pub(crate) struct PooledBlock {
    buffer: ManuallyDrop<AlignedBuffer>,
    pool: Weak<BufferPoolInner>,
}

impl Drop for PooledBlock {
    fn drop(&mut self) {
        // SAFETY: Drop is only called once and the buffer is not used afterwards.
        let buffer = unsafe { ManuallyDrop::take(&mut self.buffer) };
        if let Some(pool) = self.pool.upgrade() {
            pool.return_buffer(buffer);
        }
    }
}

/// Memory bound to a segment.
///
/// Dropping a [Block::Pooled] returns it to its pool; dropping a
/// [Block::Unpooled] frees it.
pub(crate) enum Block {
    Pooled(PooledBlock),
    Unpooled(AlignedBuffer),
}

impl Block {
    /// Returns the usable size of the block in bytes.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        match self {
            Self::Pooled(block) => block.buffer.capacity(),
            Self::Unpooled(buffer) => buffer.capacity(),
        }
    }

    /// Returns a pointer to the first byte of the block.
    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        match self {
            Self::Pooled(block) => block.buffer.as_ptr(),
            Self::Unpooled(buffer) => buffer.as_ptr(),
        }
    }

    /// Returns `true` if the block will be returned to a pool when dropped.
    pub(crate) fn is_pooled(&self) -> bool {
        matches!(self, Self::Pooled(_))
    }
}
