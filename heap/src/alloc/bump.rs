use std::{
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use object::WORD_SIZE;
use parking_lot::Mutex;

use super::{Extent, MIN_HEADROOM, RefillManager};
use crate::AllocError;

/// Lock-free bump-pointer allocator over one contiguous extent at a time.
///
/// ```text
/// start          top                  end      hard_limit
///   |  allocated  |       free         | headroom |
/// ```
///
/// `top` is the only field the fast path touches. The other fields are
/// rewritten under the refill lock in an order that makes a racing fast
/// path either fail its CAS or land inside the new extent.
#[derive(Debug)]
pub struct AtomicBumpAllocator<R: RefillManager> {
    start: AtomicUsize,
    top: AtomicUsize,
    /// Soft limit. Allocations never cross it.
    end: AtomicUsize,
    /// `end + headroom`, the real end of the extent.
    hard_limit: AtomicUsize,
    headroom: usize,
    refill_lock: Mutex<()>,
    refill: R,
}

impl<R: RefillManager> AtomicBumpAllocator<R> {
    pub fn new(refill: R, headroom: usize) -> Self {
        debug_assert!(headroom >= MIN_HEADROOM && headroom.is_multiple_of(WORD_SIZE));
        Self {
            start: AtomicUsize::new(0),
            top: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
            hard_limit: AtomicUsize::new(0),
            headroom,
            refill_lock: Mutex::new(()),
            refill,
        }
    }

    #[inline(always)]
    pub fn refill_manager(&self) -> &R {
        &self.refill
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        self.start.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn hard_limit(&self) -> usize {
        self.hard_limit.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn headroom(&self) -> usize {
        self.headroom
    }

    /// Bytes handed out of the current extent, frozen leftovers included.
    pub fn used(&self) -> usize {
        self.top().saturating_sub(self.start())
    }

    #[inline(always)]
    fn try_bump(&self, size: usize) -> Option<usize> {
        let mut top = self.top.load(Ordering::Acquire);
        loop {
            let end = self.end.load(Ordering::Acquire);
            let next = top.checked_add(size)?;
            if next > end {
                return None;
            }
            match self
                .top
                .compare_exchange_weak(top, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(top),
                Err(current) => top = current,
            }
        }
    }

    /// Allocates `size` bytes of uninitialized memory.
    #[inline(always)]
    pub fn allocate(&self, size: usize) -> Result<usize, AllocError> {
        debug_assert!(size > 0 && size.is_multiple_of(WORD_SIZE), "bad size {size}");
        if let Some(addr) = self.try_bump(size) {
            return Ok(addr);
        }
        self.allocate_slow(size)
    }

    /// Allocates `size` zeroed bytes.
    pub fn allocate_cleared(&self, size: usize) -> Result<usize, AllocError> {
        let addr = self.allocate(size)?;
        // SAFETY: the range was just handed out to us exclusively
        unsafe { ptr::write_bytes(addr as *mut u8, 0, size) };
        Ok(addr)
    }

    #[cold]
    #[inline(never)]
    fn allocate_slow(&self, size: usize) -> Result<usize, AllocError> {
        let needs_collection = AllocError::NeedsCollection { requested: size };
        let _guard = self.refill_lock.lock();
        loop {
            // someone else may have refilled while we waited for the lock
            if let Some(addr) = self.try_bump(size) {
                return Ok(addr);
            }

            if self.refill.is_large(size) {
                return self.refill.allocate_large(size).ok_or(needs_collection);
            }

            let space_left = self.end().saturating_sub(self.top());
            if !self.refill.should_refill(size, space_left)
                && let Some(addr) = self.refill.allocate_overflow(size)
            {
                return Ok(addr);
            }

            self.freeze();
            let Some(extent) = self.refill.allocate_refill(size + self.headroom) else {
                return Err(needs_collection);
            };
            debug_assert!(extent.size() >= size + self.headroom);
            log::trace!(
                "bump refill 0x{:x}..0x{:x} for {size} bytes",
                extent.start,
                extent.end
            );
            self.publish(extent);
        }
    }

    /// Advances `top` to `hard_limit` so no fast path can use the leftover,
    /// then hands the leftover to the refill manager.
    fn freeze(&self) {
        let hard_limit = self.hard_limit.load(Ordering::Acquire);
        let old_top = self.top.swap(hard_limit, Ordering::AcqRel);
        if old_top < hard_limit {
            self.refill.make_parsable(old_top, hard_limit);
        }
    }

    fn publish(&self, extent: Extent) {
        debug_assert!(extent.size() > self.headroom);
        self.end.store(0, Ordering::Release);
        self.start.store(extent.start, Ordering::Release);
        self.hard_limit.store(extent.end, Ordering::Release);
        self.top.store(extent.start, Ordering::Release);
        self.end.store(extent.end - self.headroom, Ordering::Release);
    }

    /// Replaces the current extent without consulting the refill manager.
    /// The old leftover is not made parsable.
    pub fn reset(&self, extent: Extent) {
        let _guard = self.refill_lock.lock();
        self.publish(extent);
    }

    /// Makes the leftover parsable and drops the extent. The next
    /// allocation refills.
    pub fn retire(&self) {
        let _guard = self.refill_lock.lock();
        self.freeze();
        self.end.store(0, Ordering::Release);
        self.start.store(0, Ordering::Release);
        self.hard_limit.store(0, Ordering::Release);
        self.top.store(0, Ordering::Release);
    }
}
