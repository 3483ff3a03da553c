use super::FreeChunk;

const BIN_COUNT: usize = 16;

/// Size-segregated, doubly linked free lists.
///
/// Bin `i` holds chunks of `[min << i, min << (i + 1))` bytes, the last bin
/// everything larger. Allocation is first fit, starting at the bin of the
/// requested size.
#[derive(Debug)]
pub struct SegregatedFreeList {
    min_size: usize,
    heads: [usize; BIN_COUNT],
    len: usize,
    free_bytes: usize,
}

impl SegregatedFreeList {
    pub fn new(min_size: usize) -> Self {
        debug_assert!(min_size >= FreeChunk::DOUBLY_LINKED_SIZE);
        Self {
            min_size,
            heads: [FreeChunk::NONE; BIN_COUNT],
            len: 0,
            free_bytes: 0,
        }
    }

    #[inline(always)]
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    #[inline(always)]
    fn bin_index(&self, size: usize) -> usize {
        let ratio = (size / self.min_size).max(1);
        (ratio.ilog2() as usize).min(BIN_COUNT - 1)
    }

    /// Formats `[addr, addr + size)` as a chunk at the head of its bin.
    ///
    /// # Safety
    ///
    /// The range must be writable dead space of at least `min_size` bytes,
    /// not already on any list.
    pub unsafe fn insert(&mut self, addr: usize, size: usize) {
        debug_assert!(size >= self.min_size);
        let bin = self.bin_index(size);
        let head = self.heads[bin];
        // SAFETY: forwarded to caller
        unsafe { FreeChunk::format_doubly_linked(addr, size, head, FreeChunk::NONE) };
        if head != FreeChunk::NONE {
            // SAFETY: list members are formatted chunks
            unsafe { FreeChunk::at(head) }.set_prev(addr);
        }
        self.heads[bin] = addr;
        self.len += 1;
        self.free_bytes += size;
    }

    fn unlink(&mut self, bin: usize, chunk: FreeChunk) {
        let prev = chunk.prev_addr();
        let next = chunk.next_addr();
        if prev == FreeChunk::NONE {
            self.heads[bin] = next;
        } else {
            // SAFETY: list members are formatted chunks
            unsafe { FreeChunk::at(prev) }.set_next(next);
        }
        if next != FreeChunk::NONE {
            // SAFETY: list members are formatted chunks
            unsafe { FreeChunk::at(next) }.set_prev(prev);
        }
        self.len -= 1;
        self.free_bytes -= chunk.size();
    }

    /// Unlinks and returns the first chunk of at least `size` bytes.
    pub fn take(&mut self, size: usize) -> Option<FreeChunk> {
        for bin in self.bin_index(size)..BIN_COUNT {
            let mut cursor = self.heads[bin];
            while cursor != FreeChunk::NONE {
                // SAFETY: list members are formatted chunks
                let chunk = unsafe { FreeChunk::at(cursor) };
                if chunk.size() >= size {
                    self.unlink(bin, chunk);
                    return Some(chunk);
                }
                cursor = chunk.next_addr();
            }
        }
        None
    }

    /// Forgets every chunk. The memory stays formatted.
    pub fn clear(&mut self) {
        self.heads = [FreeChunk::NONE; BIN_COUNT];
        self.len = 0;
        self.free_bytes = 0;
    }

    /// Whether `addr` starts a chunk on one of the lists.
    pub fn contains(&self, addr: usize) -> bool {
        self.heads.iter().any(|&head| {
            let mut cursor = head;
            while cursor != FreeChunk::NONE {
                if cursor == addr {
                    return true;
                }
                // SAFETY: list members are formatted chunks
                cursor = unsafe { FreeChunk::at(cursor) }.next_addr();
            }
            false
        })
    }
}
