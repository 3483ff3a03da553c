use object::WORD_SIZE;

use super::{ChunkListRefill, Extent};
use crate::{AllocError, freespace::FreeChunk};

/// Bump allocator over a linked list of discontiguous free chunks.
///
/// Owned by a single thread (the collector's promotion buffer), so no
/// atomics. An allocation never spans two chunks; the tail of a chunk that
/// cannot satisfy a request is made parsable and the next chunk is used.
#[derive(Debug)]
pub struct ChunkListAllocator<R: ChunkListRefill> {
    top: usize,
    end: usize,
    /// Next unused chunk, [`FreeChunk::NONE`] when the list is exhausted.
    next_chunk: usize,
    refill: R,
}

impl<R: ChunkListRefill> ChunkListAllocator<R> {
    pub fn new(refill: R) -> Self {
        Self {
            top: 0,
            end: 0,
            next_chunk: FreeChunk::NONE,
            refill,
        }
    }

    #[inline(always)]
    pub fn refill_manager(&self) -> &R {
        &self.refill
    }

    /// The chunk currently bumped through.
    pub fn current(&self) -> Extent {
        Extent::new(self.top, self.end)
    }

    #[inline(always)]
    fn bump(&mut self, size: usize) -> Option<usize> {
        let next = self.top + size;
        if next > self.end {
            return None;
        }
        let addr = self.top;
        self.top = next;
        Some(addr)
    }

    #[inline(always)]
    pub fn allocate(&mut self, size: usize) -> Result<usize, AllocError> {
        debug_assert!(size > 0 && size.is_multiple_of(WORD_SIZE), "bad size {size}");
        if let Some(addr) = self.bump(size) {
            return Ok(addr);
        }
        self.allocate_slow(size)
    }

    #[cold]
    fn allocate_slow(&mut self, size: usize) -> Result<usize, AllocError> {
        let needs_collection = AllocError::NeedsCollection { requested: size };
        if self.refill.is_large(size) {
            return self.refill.allocate_large(size).ok_or(needs_collection);
        }
        if !self.refill.should_refill(size, self.end - self.top)
            && let Some(addr) = self.refill.allocate_overflow(size)
        {
            return Ok(addr);
        }

        loop {
            self.drop_current();
            while self.take_next_chunk() {
                if let Some(addr) = self.bump(size) {
                    return Ok(addr);
                }
                self.drop_current();
            }
            let Some(head) = self.refill.allocate_chunk_list(size) else {
                return Err(needs_collection);
            };
            log::trace!("chunk list refill at 0x{head:x} for {size} bytes");
            self.next_chunk = head;
        }
    }

    fn drop_current(&mut self) {
        if self.top < self.end {
            self.refill.make_parsable(self.top, self.end);
        }
        self.top = 0;
        self.end = 0;
    }

    fn take_next_chunk(&mut self) -> bool {
        if self.next_chunk == FreeChunk::NONE {
            return false;
        }
        // SAFETY: the refill manager only hands out formatted chunk lists
        let chunk = unsafe { FreeChunk::at(self.next_chunk) };
        self.next_chunk = chunk.next_addr();
        self.top = chunk.addr();
        self.end = chunk.end();
        true
    }

    /// Makes the current tail and every unused chunk parsable.
    pub fn retire(&mut self) {
        self.drop_current();
        while self.take_next_chunk() {
            self.drop_current();
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::alloc::{RefillManager, fill};
    use crate::freespace::link_chunks;

    #[derive(Default)]
    struct ListRefill {
        lists: Mutex<Vec<usize>>,
        parsable: Mutex<Vec<(usize, usize)>>,
    }

    impl RefillManager for ListRefill {
        fn should_refill(&self, _size: usize, _space_left: usize) -> bool {
            true
        }

        fn allocate_refill(&self, _size: usize) -> Option<Extent> {
            None
        }

        fn allocate_overflow(&self, _size: usize) -> Option<usize> {
            None
        }

        fn is_large(&self, _size: usize) -> bool {
            false
        }

        fn allocate_large(&self, _size: usize) -> Option<usize> {
            None
        }

        fn make_parsable(&self, start: usize, end: usize) {
            unsafe { fill(start, end) };
            self.parsable.lock().push((start, end));
        }
    }

    impl ChunkListRefill for ListRefill {
        fn allocate_chunk_list(&self, _size: usize) -> Option<usize> {
            self.lists.lock().pop()
        }
    }

    #[test]
    fn allocations_never_span_chunks() {
        let mut mem = vec![0u64; 128];
        let base = mem.as_mut_ptr() as usize;
        let chunks = [(base, 64), (base + 128, 32), (base + 256, 256)];
        let refill = ListRefill::default();
        refill.lists.lock().push(unsafe { link_chunks(&chunks) });
        let mut alloc = ChunkListAllocator::new(refill);

        assert_eq!(alloc.allocate(48), Ok(base));
        // 16 bytes left in the first chunk, the 32 byte chunk is too small
        assert_eq!(alloc.allocate(48), Ok(base + 256));
        assert_eq!(alloc.allocate(16), Ok(base + 304));
        assert_eq!(
            *alloc.refill_manager().parsable.lock(),
            vec![(base + 48, base + 64), (base + 128, base + 160)]
        );
        assert_eq!(alloc.current(), Extent::new(base + 320, base + 512));
    }

    #[test]
    fn exhausted_lists_ask_for_collection() {
        let mut mem = vec![0u64; 16];
        let base = mem.as_mut_ptr() as usize;
        let refill = ListRefill::default();
        refill.lists.lock().push(unsafe { link_chunks(&[(base, 64)]) });
        let mut alloc = ChunkListAllocator::new(refill);

        assert_eq!(alloc.allocate(64), Ok(base));
        assert_eq!(
            alloc.allocate(8),
            Err(AllocError::NeedsCollection { requested: 8 })
        );
    }

    #[test]
    fn retire_formats_unused_chunks() {
        let mut mem = vec![0u64; 64];
        let base = mem.as_mut_ptr() as usize;
        let refill = ListRefill::default();
        refill
            .lists
            .lock()
            .push(unsafe { link_chunks(&[(base, 64), (base + 128, 64)]) });
        let mut alloc = ChunkListAllocator::new(refill);

        alloc.allocate(16).expect("allocate");
        alloc.retire();
        assert_eq!(
            *alloc.refill_manager().parsable.lock(),
            vec![(base + 16, base + 64), (base + 128, base + 192)]
        );
        assert_eq!(alloc.current(), Extent::EMPTY);
    }
}
