//! Card-table remembered set and the first-object table used to parse
//! dirty cards.

mod card_table;
mod fot;

use std::{ops::Range, sync::Arc};

pub use card_table::{CLEAN, CardTable, DIRTY, DirtyRuns};
pub use fot::{FirstObjectTable, FotEntry};
use object::Cell;

use crate::walk::walk_cells;

/// Remembered set recording which cards may hold interesting references.
///
/// Cards are dirtied by the write barrier and cleaned only by the scans
/// below.
#[derive(Debug)]
pub struct CardTableRSet {
    cards: CardTable,
    fot: Arc<FirstObjectTable>,
}

impl CardTableRSet {
    pub fn new(covered: Range<usize>, card_size_log2: u32) -> Self {
        Self {
            cards: CardTable::new(covered.clone(), card_size_log2),
            fot: Arc::new(FirstObjectTable::new(covered, card_size_log2)),
        }
    }

    #[inline(always)]
    pub fn cards(&self) -> &CardTable {
        &self.cards
    }

    #[inline(always)]
    pub fn fot(&self) -> &Arc<FirstObjectTable> {
        &self.fot
    }

    /// Write-barrier primitive: a reference was stored at `origin + offset`.
    #[inline(always)]
    pub fn record(&self, origin: usize, offset: usize) {
        self.cards.dirty(origin + offset);
    }

    /// Cleans every card overlapping `range`.
    pub fn clean_cards(&self, range: Range<usize>) {
        self.cards.clean(self.cards.cards_covering(&range));
    }

    /// Calls `visitor` for every object overlapping a dirty run in `range`,
    /// with the run's address bounds. `range` must be parsable and must not
    /// cut through a cell other than at its start.
    ///
    /// # Safety
    ///
    /// Every cell overlapping `range` must be formatted and recorded in the
    /// first-object table.
    pub unsafe fn visit_cards(&self, range: Range<usize>, visitor: &mut dyn FnMut(usize, Range<usize>)) {
        // SAFETY: forwarded to caller
        unsafe { self.scan(range, false, visitor) }
    }

    /// Like [`visit_cards`](Self::visit_cards), cleaning each dirty run
    /// before visiting it.
    ///
    /// # Safety
    ///
    /// Same as [`visit_cards`](Self::visit_cards).
    pub unsafe fn clean_and_visit_cards(
        &self,
        range: Range<usize>,
        visitor: &mut dyn FnMut(usize, Range<usize>),
    ) {
        // SAFETY: forwarded to caller
        unsafe { self.scan(range, true, visitor) }
    }

    unsafe fn scan(
        &self,
        range: Range<usize>,
        clean: bool,
        visitor: &mut dyn FnMut(usize, Range<usize>),
    ) {
        let runs: Vec<Range<usize>> = self
            .cards
            .dirty_runs(self.cards.cards_covering(&range))
            .collect();
        for run in runs {
            if clean {
                self.cards.clean(run.clone());
            }
            let start = self.cards.card_start(run.start).max(range.start);
            let end = self.cards.card_start(run.end).min(range.end);
            let first = self.fot.cell_start(run.start).max(range.start);
            let bounds = start..end;
            // SAFETY: forwarded to caller
            unsafe {
                walk_cells(first..end, |addr, cell| {
                    if matches!(cell, Cell::Object(_)) {
                        visitor(addr, bounds.clone());
                    }
                });
            }
        }
    }
}
