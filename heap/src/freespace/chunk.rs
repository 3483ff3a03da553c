use object::{Cell, WORD_SIZE, classify};

use crate::error::invariant_violation;

/// A free chunk formatted in place at the start of reclaimed memory.
///
/// ```text
/// word 0: size in bytes (low bit clear, walks see a filler)
/// word 1: address of the next chunk, 0 at the end of the list
/// word 2: address of the previous chunk (doubly linked chunks only)
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FreeChunk(usize);

impl FreeChunk {
    /// `next`/`prev` value terminating a list.
    pub const NONE: usize = 0;
    /// Size of a singly linked chunk header.
    pub const MIN_SIZE: usize = 2 * WORD_SIZE;
    /// Size of a doubly linked chunk header.
    pub const DOUBLY_LINKED_SIZE: usize = 3 * WORD_SIZE;

    const SIZE_OFFSET: usize = 0;
    const NEXT_OFFSET: usize = WORD_SIZE;
    const PREV_OFFSET: usize = 2 * WORD_SIZE;

    /// Formats a singly linked chunk.
    ///
    /// # Safety
    ///
    /// `[addr, addr + size)` must be writable dead space.
    pub unsafe fn format(addr: usize, size: usize, next: usize) -> Self {
        debug_assert!(size >= Self::MIN_SIZE && size.is_multiple_of(WORD_SIZE));
        let chunk = Self(addr);
        chunk.write(Self::SIZE_OFFSET, size);
        chunk.write(Self::NEXT_OFFSET, next);
        chunk
    }

    /// Formats a doubly linked chunk.
    ///
    /// # Safety
    ///
    /// Same as [`FreeChunk::format`].
    pub unsafe fn format_doubly_linked(addr: usize, size: usize, next: usize, prev: usize) -> Self {
        debug_assert!(size >= Self::DOUBLY_LINKED_SIZE);
        // SAFETY: forwarded to caller
        let chunk = unsafe { Self::format(addr, size, next) };
        chunk.write(Self::PREV_OFFSET, prev);
        chunk
    }

    /// Views an already formatted chunk.
    ///
    /// # Safety
    ///
    /// `addr` must hold a chunk written by one of the `format` functions.
    pub unsafe fn at(addr: usize) -> Self {
        // SAFETY: forwarded to caller
        match unsafe { classify(addr) } {
            Cell::Filler(size) if size >= Self::MIN_SIZE => Self(addr),
            cell => invariant_violation(
                format_args!("expected a free chunk at 0x{addr:x}, found {cell:?}"),
                Some(addr..addr + 4 * WORD_SIZE),
            ),
        }
    }

    #[inline(always)]
    fn read(self, offset: usize) -> usize {
        // SAFETY: constructors guarantee a formatted chunk
        unsafe { *((self.0 + offset) as *const usize) }
    }

    #[inline(always)]
    fn write(self, offset: usize, value: usize) {
        // SAFETY: constructors guarantee a formatted chunk
        unsafe { *((self.0 + offset) as *mut usize) = value };
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn size(self) -> usize {
        self.read(Self::SIZE_OFFSET)
    }

    #[inline(always)]
    pub fn end(self) -> usize {
        self.0 + self.size()
    }

    #[inline(always)]
    pub fn next_addr(self) -> usize {
        self.read(Self::NEXT_OFFSET)
    }

    pub fn next(self) -> Option<FreeChunk> {
        match self.next_addr() {
            Self::NONE => None,
            // SAFETY: lists only link formatted chunks
            next => Some(unsafe { Self::at(next) }),
        }
    }

    #[inline(always)]
    pub fn set_next(self, next: usize) {
        self.write(Self::NEXT_OFFSET, next);
    }

    #[inline(always)]
    pub fn prev_addr(self) -> usize {
        debug_assert!(self.size() >= Self::DOUBLY_LINKED_SIZE);
        self.read(Self::PREV_OFFSET)
    }

    #[inline(always)]
    pub fn set_prev(self, prev: usize) {
        debug_assert!(self.size() >= Self::DOUBLY_LINKED_SIZE);
        self.write(Self::PREV_OFFSET, prev);
    }
}

impl std::fmt::Debug for FreeChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeChunk")
            .field("addr", &format_args!("0x{:x}", self.0))
            .field("size", &self.size())
            .field("next", &format_args!("0x{:x}", self.next_addr()))
            .finish()
    }
}

/// Iterates a singly linked chunk list starting at `head`.
pub struct ChunkIter {
    next: usize,
}

impl ChunkIter {
    /// # Safety
    ///
    /// `head` must be [`FreeChunk::NONE`] or the first chunk of a well
    /// formed list.
    pub unsafe fn new(head: usize) -> Self {
        Self { next: head }
    }
}

impl Iterator for ChunkIter {
    type Item = FreeChunk;

    fn next(&mut self) -> Option<FreeChunk> {
        if self.next == FreeChunk::NONE {
            return None;
        }
        // SAFETY: guaranteed by `ChunkIter::new`
        let chunk = unsafe { FreeChunk::at(self.next) };
        self.next = chunk.next_addr();
        Some(chunk)
    }
}

/// Formats `chunks` (address, size) as one singly linked list in the given
/// order and returns its head.
///
/// # Safety
///
/// Every chunk must be writable dead space of at least
/// [`FreeChunk::MIN_SIZE`] bytes.
pub unsafe fn link_chunks(chunks: &[(usize, usize)]) -> usize {
    let mut next = FreeChunk::NONE;
    for &(addr, size) in chunks.iter().rev() {
        // SAFETY: forwarded to caller
        unsafe { FreeChunk::format(addr, size, next) };
        next = addr;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_words_match_layout() {
        let mut mem = [0usize; 8];
        let addr = mem.as_mut_ptr() as usize;
        let chunk = unsafe { FreeChunk::format_doubly_linked(addr, 64, 0x1000, 0x2000) };
        assert_eq!(mem[0], 64);
        assert_eq!(mem[1], 0x1000);
        assert_eq!(mem[2], 0x2000);
        assert_eq!(chunk.end(), addr + 64);
        assert_eq!(unsafe { classify(addr) }, Cell::Filler(64));
    }

    #[test]
    fn linked_chunks_iterate_in_order() {
        let mut mem = [0usize; 32];
        let base = mem.as_mut_ptr() as usize;
        let chunks = [(base, 32), (base + 64, 16), (base + 128, 48)];
        let head = unsafe { link_chunks(&chunks) };
        let seen: Vec<(usize, usize)> = unsafe { ChunkIter::new(head) }
            .map(|c| (c.addr(), c.size()))
            .collect();
        assert_eq!(seen, chunks);
    }
}
