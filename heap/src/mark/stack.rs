/// Bounded stack of grey object addresses.
///
/// A full stack does not grow: the marker flushes it and rescans the color
/// map instead.
#[derive(Debug)]
pub struct MarkingStack {
    entries: Vec<usize>,
    capacity: usize,
}

impl MarkingStack {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `false` without pushing when the stack is full.
    #[inline(always)]
    #[must_use]
    pub fn push(&mut self, addr: usize) -> bool {
        if self.entries.len() == self.capacity {
            return false;
        }
        self.entries.push(addr);
        true
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Option<usize> {
        self.entries.pop()
    }

    /// Empties the stack, returning the lowest address it held.
    pub fn flush(&mut self) -> Option<usize> {
        self.entries.drain(..).min()
    }
}
