use std::ops::Range;

use object::WORD_SIZE;

/// One bit per heap word over a covered range.
///
/// An object's color is the pair of bits at its first two words:
///
/// ```text
/// white 00    black 10    grey 11   (first bit, second bit)
/// ```
///
/// Objects are at least two words long so pairs never overlap. A word `w`
/// of the map holds a grey mark iff `w & (w >> 1) != 0`, or its top bit
/// and the next word's bottom bit are both set. Only the leftmost pair
/// found from an object start is guaranteed to be a real grey mark; a grey
/// object's second bit may pair up with a following object's first bit,
/// but the grey object's own pair is always found first.
#[derive(Debug)]
pub struct ColorMap {
    covered: Range<usize>,
    words: Vec<u64>,
}

impl ColorMap {
    pub fn new(covered: Range<usize>) -> Self {
        debug_assert!(covered.start.is_multiple_of(WORD_SIZE));
        let bits = (covered.end - covered.start) / WORD_SIZE;
        Self {
            covered,
            words: vec![0; bits.div_ceil(64) + 1],
        }
    }

    #[inline(always)]
    pub fn covered(&self) -> Range<usize> {
        self.covered.clone()
    }

    #[inline(always)]
    pub fn covers(&self, addr: usize) -> bool {
        self.covered.contains(&addr)
    }

    #[inline(always)]
    fn bit(&self, addr: usize) -> usize {
        debug_assert!(self.covers(addr), "0x{addr:x} outside the color map");
        (addr - self.covered.start) / WORD_SIZE
    }

    #[inline(always)]
    fn addr(&self, bit: usize) -> usize {
        self.covered.start + bit * WORD_SIZE
    }

    #[inline(always)]
    fn get(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    #[inline(always)]
    fn set(&mut self, bit: usize) {
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    #[inline(always)]
    fn unset(&mut self, bit: usize) {
        self.words[bit / 64] &= !(1 << (bit % 64));
    }

    #[inline(always)]
    pub fn is_white(&self, addr: usize) -> bool {
        !self.get(self.bit(addr))
    }

    /// Black or grey.
    #[inline(always)]
    pub fn is_marked(&self, addr: usize) -> bool {
        self.get(self.bit(addr))
    }

    #[inline(always)]
    pub fn is_grey(&self, addr: usize) -> bool {
        let bit = self.bit(addr);
        self.get(bit) && self.get(bit + 1)
    }

    #[inline(always)]
    pub fn is_black(&self, addr: usize) -> bool {
        let bit = self.bit(addr);
        self.get(bit) && !self.get(bit + 1)
    }

    #[inline(always)]
    pub fn mark_grey(&mut self, addr: usize) {
        let bit = self.bit(addr);
        self.set(bit);
        self.set(bit + 1);
    }

    #[inline(always)]
    pub fn mark_black(&mut self, addr: usize) {
        let bit = self.bit(addr);
        self.set(bit);
        self.unset(bit + 1);
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Bits `p` in word `index` such that bits `p` and `p + 1` are both set.
    #[inline(always)]
    fn grey_pairs(&self, index: usize) -> u64 {
        let word = self.words[index];
        let next = self.words.get(index + 1).copied().unwrap_or(0);
        (word & (word >> 1)) | ((word >> 63) & next & 1) << 63
    }

    fn scan(&self, from: usize, to: usize, pairs: bool) -> Option<usize> {
        let to = to.min(self.covered.end);
        if from >= to {
            return None;
        }
        let first_bit = self.bit(from);
        let end_bit = (to - self.covered.start).div_ceil(WORD_SIZE);
        let mut index = first_bit / 64;
        let mut mask = !0u64 << (first_bit % 64);
        while index * 64 < end_bit {
            let bits = (if pairs { self.grey_pairs(index) } else { self.words[index] }) & mask;
            if bits != 0 {
                let bit = index * 64 + bits.trailing_zeros() as usize;
                return (bit < end_bit).then(|| self.addr(bit));
            }
            index += 1;
            mask = !0;
        }
        None
    }

    /// Leftmost grey mark in `[from, to)`. `from` must be an object start or
    /// lie after every grey object to its left.
    #[inline]
    pub fn next_grey(&self, from: usize, to: usize) -> Option<usize> {
        self.scan(from, to, true)
    }

    /// Leftmost marked (black or grey) object start in `[from, to)`. `from`
    /// must be an object start.
    #[inline]
    pub fn next_marked(&self, from: usize, to: usize) -> Option<usize> {
        self.scan(from, to, false)
    }

    /// Number of grey objects in `range`, walking from object start to
    /// object start.
    pub fn count_grey(&self, range: Range<usize>, size_of: impl Fn(usize) -> usize) -> usize {
        let mut count = 0;
        let mut cursor = range.start;
        while let Some(addr) = self.next_grey(cursor, range.end) {
            count += 1;
            cursor = addr + size_of(addr).max(2 * WORD_SIZE);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x4000;

    #[test]
    fn colors_round_trip() {
        let mut map = ColorMap::new(BASE..BASE + 4096);
        let addr = BASE + 80;
        assert!(map.is_white(addr));
        map.mark_grey(addr);
        assert!(map.is_grey(addr) && map.is_marked(addr) && !map.is_black(addr));
        map.mark_black(addr);
        assert!(map.is_black(addr) && !map.is_grey(addr));
        map.clear();
        assert!(map.is_white(addr));
    }

    #[test]
    fn grey_pair_straddling_words_is_found() {
        let mut map = ColorMap::new(BASE..BASE + 4096);
        let addr = BASE + 63 * WORD_SIZE;
        map.mark_grey(addr);
        assert_eq!(map.next_grey(BASE, BASE + 4096), Some(addr));
    }

    #[test]
    fn black_neighbours_are_not_grey() {
        let mut map = ColorMap::new(BASE..BASE + 4096);
        // three adjacent two-word objects: black, black, black
        for i in 0..3 {
            map.mark_black(BASE + i * 16);
        }
        assert_eq!(map.next_grey(BASE, BASE + 4096), None);
        // grey object followed by a black one: the grey one is leftmost
        map.mark_grey(BASE + 16);
        assert_eq!(map.next_grey(BASE, BASE + 4096), Some(BASE + 16));
        map.mark_black(BASE + 16);
        assert_eq!(map.next_grey(BASE, BASE + 4096), None);
    }

    #[test]
    fn scans_respect_bounds() {
        let mut map = ColorMap::new(BASE..BASE + 8192);
        map.mark_grey(BASE + 512);
        map.mark_black(BASE + 4000);
        assert_eq!(map.next_grey(BASE + 520, BASE + 8192), None);
        assert_eq!(map.next_grey(BASE, BASE + 512), None);
        assert_eq!(map.next_grey(BASE, BASE + 520), Some(BASE + 512));
        assert_eq!(map.next_marked(BASE + 528, BASE + 8192), Some(BASE + 4000));
        assert_eq!(map.count_grey(BASE..BASE + 8192, |_| 16), 1);
    }
}
