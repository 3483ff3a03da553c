use std::{
    ops::Range,
    sync::atomic::{AtomicU8, Ordering},
};

pub const CLEAN: u8 = 0;
pub const DIRTY: u8 = 1;

/// One byte per card: [`CLEAN`] or [`DIRTY`].
#[derive(Debug)]
pub struct CardTable {
    base: usize,
    card_size_log2: u32,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    pub fn new(covered: Range<usize>, card_size_log2: u32) -> Self {
        let count = (covered.end - covered.start) >> card_size_log2;
        Self {
            base: covered.start,
            card_size_log2,
            cards: (0..count).map(|_| AtomicU8::new(CLEAN)).collect(),
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    #[inline(always)]
    pub fn card_size(&self) -> usize {
        1 << self.card_size_log2
    }

    #[inline(always)]
    pub fn card_index(&self, addr: usize) -> usize {
        (addr - self.base) >> self.card_size_log2
    }

    #[inline(always)]
    pub fn card_start(&self, card: usize) -> usize {
        self.base + (card << self.card_size_log2)
    }

    /// Cards overlapping the address range.
    pub fn cards_covering(&self, range: &Range<usize>) -> Range<usize> {
        if range.is_empty() {
            return 0..0;
        }
        self.card_index(range.start)..self.card_index(range.end - 1) + 1
    }

    #[inline(always)]
    pub fn dirty(&self, addr: usize) {
        self.cards[self.card_index(addr)].store(DIRTY, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_dirty(&self, card: usize) -> bool {
        self.cards[card].load(Ordering::Relaxed) != CLEAN
    }

    pub fn clean(&self, cards: Range<usize>) {
        for card in &self.cards[cards] {
            card.store(CLEAN, Ordering::Relaxed);
        }
    }

    /// Maximal runs of consecutive dirty cards inside `cards`.
    pub fn dirty_runs(&self, cards: Range<usize>) -> DirtyRuns<'_> {
        DirtyRuns { table: self, next: cards.start, end: cards.end }
    }

    pub fn dirty_count(&self, cards: Range<usize>) -> usize {
        cards.filter(|&card| self.is_dirty(card)).count()
    }
}

pub struct DirtyRuns<'a> {
    table: &'a CardTable,
    next: usize,
    end: usize,
}

impl Iterator for DirtyRuns<'_> {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Range<usize>> {
        while self.next < self.end && !self.table.is_dirty(self.next) {
            self.next += 1;
        }
        if self.next == self.end {
            return None;
        }
        let start = self.next;
        while self.next < self.end && self.table.is_dirty(self.next) {
            self.next += 1;
        }
        Some(start..self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_are_maximal() {
        let table = CardTable::new(0x1000..0x1000 + 16 * 512, 9);
        for card in [1, 2, 3, 7, 9, 10, 15] {
            table.dirty(table.card_start(card) + 8);
        }
        let runs: Vec<_> = table.dirty_runs(0..16).collect();
        assert_eq!(runs, vec![1..4, 7..8, 9..11, 15..16]);
        let clipped: Vec<_> = table.dirty_runs(2..10).collect();
        assert_eq!(clipped, vec![2..4, 7..8, 9..10]);

        table.clean(0..8);
        assert_eq!(table.dirty_count(0..16), 3);
    }

    #[test]
    fn covering_cards_include_partial_ends() {
        let table = CardTable::new(0..4096, 9);
        assert_eq!(table.cards_covering(&(500..1030)), 0..3);
        assert_eq!(table.cards_covering(&(512..1024)), 1..2);
        assert_eq!(table.cards_covering(&(8..8)), 0..0);
    }
}
