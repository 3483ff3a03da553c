use std::{
    ops::Range,
    sync::atomic::{AtomicI8, Ordering},
};

use object::WORD_SIZE;

use crate::error::invariant_violation;

/// Entries up to this value are linear hop counts.
const LINEAR_HOPS: usize = 16;
/// Smallest log2 hop a biased entry encodes; shorter distances are linear.
const MIN_LOG_HOP: u32 = 4;

/// Decoded first-object-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FotEntry {
    /// The cell covering the card's first word starts this many words
    /// before it.
    Direct(usize),
    /// Look this many cards to the left.
    Hop(usize),
}

/// One signed byte per card locating the cell that covers the card's first
/// word.
///
/// For a cell starting at `s` whose first covered card is `c0`, entry
/// `c0` holds `-(card_start(c0) - s) / WORD_SIZE` (zero when `s` is the
/// card boundary) and each following covered card `c0 + d` holds `d` for
/// `d <= 16`, or `16 + k` meaning "hop `2^k` cards back" where
/// `k = floor(log2 d)`. Lookups therefore take O(log d) hops.
#[derive(Debug)]
pub struct FirstObjectTable {
    base: usize,
    card_size_log2: u32,
    entries: Box<[AtomicI8]>,
}

impl FirstObjectTable {
    pub fn new(covered: Range<usize>, card_size_log2: u32) -> Self {
        debug_assert!(card_size_log2 <= 10, "direct offsets must fit an i8");
        let cards = (covered.end - covered.start) >> card_size_log2;
        Self {
            base: covered.start,
            card_size_log2,
            entries: (0..cards).map(|_| AtomicI8::new(0)).collect(),
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline(always)]
    pub fn card_index(&self, addr: usize) -> usize {
        (addr - self.base) >> self.card_size_log2
    }

    #[inline(always)]
    pub fn card_start(&self, card: usize) -> usize {
        self.base + (card << self.card_size_log2)
    }

    /// Cards whose first word lies inside `[cell, cell + size)`.
    pub fn covered_cards(&self, cell: usize, size: usize) -> Range<usize> {
        let card_size = 1 << self.card_size_log2;
        let first = (cell - self.base).div_ceil(card_size);
        let last = (cell + size - 1 - self.base) >> self.card_size_log2;
        first..(last + 1).max(first)
    }

    #[inline(always)]
    fn encode_hop(distance: usize) -> i8 {
        debug_assert!(distance > 0);
        if distance <= LINEAR_HOPS {
            distance as i8
        } else {
            (LINEAR_HOPS as u32 + distance.ilog2()) as i8
        }
    }

    /// Records the cell `[cell, cell + size)`.
    pub fn set(&self, cell: usize, size: usize) {
        debug_assert!(size > 0 && cell.is_multiple_of(WORD_SIZE));
        let cards = self.covered_cards(cell, size);
        if cards.is_empty() {
            return;
        }
        let first = cards.start;
        let offset = (self.card_start(first) - cell) / WORD_SIZE;
        self.entries[first].store(-(offset as i8), Ordering::Relaxed);
        for card in cards.start + 1..cards.end {
            self.entries[card].store(Self::encode_hop(card - first), Ordering::Relaxed);
        }
    }

    pub fn entry(&self, card: usize) -> FotEntry {
        let raw = self.entries[card].load(Ordering::Relaxed);
        if raw <= 0 {
            return FotEntry::Direct(raw.unsigned_abs() as usize);
        }
        let raw = raw as usize;
        if raw <= LINEAR_HOPS {
            return FotEntry::Hop(raw);
        }
        let log = (raw - LINEAR_HOPS) as u32;
        if log < MIN_LOG_HOP || log >= usize::BITS {
            invariant_violation(
                format_args!("first-object entry {raw} of card {card} is not a valid hop"),
                None,
            );
        }
        FotEntry::Hop(1 << log)
    }

    /// Start of the cell covering the first word of `card`.
    pub fn cell_start(&self, card: usize) -> usize {
        let mut current = card;
        loop {
            match self.entry(current) {
                FotEntry::Direct(words) => {
                    return self.card_start(current) - words * WORD_SIZE;
                }
                FotEntry::Hop(hop) => {
                    if hop > current {
                        invariant_violation(
                            format_args!("first-object hop {hop} from card {current} underflows"),
                            None,
                        );
                    }
                    current -= hop;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x10_0000;
    const LOG2: u32 = 9;
    const CARD: usize = 1 << LOG2;

    fn table(cards: usize) -> FirstObjectTable {
        FirstObjectTable::new(BASE..BASE + cards * CARD, LOG2)
    }

    #[test]
    fn cell_inside_one_card_touches_nothing() {
        let fot = table(4);
        fot.set(BASE + 8, 64);
        assert!(fot.covered_cards(BASE + 8, 64).is_empty());
        assert_eq!(fot.entry(0), FotEntry::Direct(0));
        assert_eq!(fot.entry(1), FotEntry::Direct(0));
    }

    #[test]
    fn boundary_cell_gets_zero_offset() {
        let fot = table(4);
        fot.set(BASE + CARD, 2 * CARD);
        assert_eq!(fot.entry(1), FotEntry::Direct(0));
        assert_eq!(fot.entry(2), FotEntry::Hop(1));
        assert_eq!(fot.cell_start(2), BASE + CARD);
    }

    #[test]
    fn unaligned_cell_gets_negative_offset() {
        let fot = table(4);
        let cell = BASE + CARD - 24;
        fot.set(cell, 64);
        assert_eq!(fot.covered_cards(cell, 64), 1..2);
        assert_eq!(fot.entry(1), FotEntry::Direct(3));
        assert_eq!(fot.cell_start(1), cell);
    }

    #[test]
    fn every_covered_card_finds_the_cell() {
        let fot = table(4096);
        let cell = BASE + 5 * CARD + 40;
        let size = 3000 * CARD;
        fot.set(cell, size);
        let cards = fot.covered_cards(cell, size);
        assert_eq!(cards.start, 6);
        for card in cards {
            assert_eq!(fot.cell_start(card), cell, "card {card}");
        }
    }

    #[test]
    fn log_hops_halve_the_distance() {
        let fot = table(256);
        fot.set(BASE, 200 * CARD);
        assert_eq!(fot.entry(16), FotEntry::Hop(16));
        assert_eq!(fot.entry(17), FotEntry::Hop(16));
        assert_eq!(fot.entry(40), FotEntry::Hop(32));
        assert_eq!(fot.entry(199), FotEntry::Hop(128));
        assert_eq!(fot.cell_start(199), BASE);
    }

    #[test]
    fn later_cells_overwrite_entries() {
        let fot = table(8);
        fot.set(BASE, 8 * CARD);
        fot.set(BASE + 3 * CARD + 16, 2 * CARD);
        assert_eq!(fot.cell_start(2), BASE);
        assert_eq!(fot.cell_start(4), BASE + 3 * CARD + 16);
        assert_eq!(fot.cell_start(5), BASE + 3 * CARD + 16);
    }

    #[test]
    #[should_panic(expected = "not a valid hop")]
    fn corrupt_entry_is_an_invariant_violation() {
        let fot = table(4);
        fot.entries[2].store(18, Ordering::Relaxed);
        fot.cell_start(2);
    }
}
