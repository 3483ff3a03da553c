use super::fill;

/// Thread-local allocation buffer: a plain bump window owned by one
/// mutator, carved out of the nursery allocator.
#[derive(Debug, Default)]
pub struct Tlab {
    top: usize,
    end: usize,
}

impl Tlab {
    pub const fn new() -> Self {
        Self { top: 0, end: 0 }
    }

    #[inline(always)]
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        let next = self.top + size;
        if next > self.end {
            return None;
        }
        let addr = self.top;
        self.top = next;
        Some(addr)
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.end - self.top
    }

    /// Starts bumping through `[start, end)`. The previous window must have
    /// been retired.
    pub fn reset(&mut self, start: usize, end: usize) {
        debug_assert!(self.top == self.end, "tlab replaced without retiring");
        self.top = start;
        self.end = end;
    }

    /// Plants a filler over the unused tail and empties the buffer.
    pub fn retire(&mut self) {
        // SAFETY: the tail was handed to this buffer and never allocated
        unsafe { fill(self.top, self.end) };
        self.top = 0;
        self.end = 0;
    }
}

#[cfg(test)]
mod tests {
    use object::{Cell, classify};

    use super::*;

    #[test]
    fn bumps_until_full_then_retires_tail() {
        let mut mem = [0u64; 8];
        let base = mem.as_mut_ptr() as usize;
        let mut tlab = Tlab::new();
        assert_eq!(tlab.allocate(16), None);

        tlab.reset(base, base + 64);
        assert_eq!(tlab.allocate(16), Some(base));
        assert_eq!(tlab.allocate(24), Some(base + 16));
        assert_eq!(tlab.allocate(32), None);
        assert_eq!(tlab.remaining(), 24);

        tlab.retire();
        assert_eq!(unsafe { classify(base + 40) }, Cell::Filler(24));
        assert_eq!(tlab.remaining(), 0);
    }
}
