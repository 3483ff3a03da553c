//! Bump-pointer allocators and the refill protocol that feeds them.
//!
//! Allocators only know how to bump through memory they were handed. Where
//! that memory comes from, what happens to leftovers and which requests are
//! routed elsewhere is decided by a [`RefillManager`] injected at
//! construction.

mod bump;
mod chunk_list;
mod tlab;

pub use bump::AtomicBumpAllocator;
pub use chunk_list::ChunkListAllocator;
pub use tlab::Tlab;

use object::WORD_SIZE;

/// A contiguous range `[start, end)` handed to an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: usize,
    pub end: usize,
}

impl Extent {
    pub const EMPTY: Extent = Extent { start: 0, end: 0 };

    #[inline(always)]
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.end - self.start
    }
}

/// Smallest headroom an allocator keeps past its soft limit: enough to plant
/// a two-word filler in whatever is left.
pub const MIN_HEADROOM: usize = 2 * WORD_SIZE;

/// Supplies memory to an allocator and decides how to route requests that
/// do not fit the current extent.
///
/// Methods are called with the allocator's refill lock held, so at most one
/// call per allocator is in progress at any time. Implementations that are
/// shared between allocators synchronize internally.
pub trait RefillManager {
    /// Whether the current extent, with `space_left` bytes remaining, should
    /// be given up to serve a request of `size` bytes. Returning `false`
    /// sends the request to [`allocate_overflow`](Self::allocate_overflow)
    /// first.
    fn should_refill(&self, size: usize, space_left: usize) -> bool;

    /// A fresh extent of at least `size` bytes (the allocator adds its
    /// headroom to the request), or `None` if only a collection can provide
    /// one.
    fn allocate_refill(&self, size: usize) -> Option<Extent>;

    /// Serves `size` bytes outside the current extent.
    fn allocate_overflow(&self, size: usize) -> Option<usize>;

    fn is_large(&self, size: usize) -> bool;

    /// Serves a large request from dedicated memory.
    fn allocate_large(&self, size: usize) -> Option<usize>;

    /// Formats `[start, end)` so heap walks can step over it.
    fn make_parsable(&self, start: usize, end: usize);
}

/// Refill capability of allocators that accept discontiguous memory.
pub trait ChunkListRefill: RefillManager {
    /// Address of the first chunk of a `{size, next}` linked list holding at
    /// least one chunk of `size` bytes, or `None` if none is available.
    fn allocate_chunk_list(&self, size: usize) -> Option<usize>;
}

impl<T: RefillManager + ?Sized> RefillManager for std::sync::Arc<T> {
    #[inline(always)]
    fn should_refill(&self, size: usize, space_left: usize) -> bool {
        (**self).should_refill(size, space_left)
    }

    #[inline(always)]
    fn allocate_refill(&self, size: usize) -> Option<Extent> {
        (**self).allocate_refill(size)
    }

    #[inline(always)]
    fn allocate_overflow(&self, size: usize) -> Option<usize> {
        (**self).allocate_overflow(size)
    }

    #[inline(always)]
    fn is_large(&self, size: usize) -> bool {
        (**self).is_large(size)
    }

    #[inline(always)]
    fn allocate_large(&self, size: usize) -> Option<usize> {
        (**self).allocate_large(size)
    }

    #[inline(always)]
    fn make_parsable(&self, start: usize, end: usize) {
        (**self).make_parsable(start, end)
    }
}

impl<T: ChunkListRefill + ?Sized> ChunkListRefill for std::sync::Arc<T> {
    #[inline(always)]
    fn allocate_chunk_list(&self, size: usize) -> Option<usize> {
        (**self).allocate_chunk_list(size)
    }
}

/// Rounds `size` up to whole words.
#[inline(always)]
pub const fn align_size(size: usize) -> usize {
    (size + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

/// Plants a filler over `[start, end)` if the range is not empty.
///
/// # Safety
///
/// The range must be writable, word aligned dead space.
#[inline]
pub unsafe fn fill(start: usize, end: usize) {
    debug_assert!(start <= end);
    if end > start {
        // SAFETY: forwarded to caller
        unsafe { object::write_filler(start, end - start) };
    }
}
