//! Reclaiming dead old-space memory in place after a full trace.

use std::ops::Range;

use object::{header_at, write_filler};

use crate::{freespace::FreeChunk, mark::ColorMap, rset::FirstObjectTable};

/// Counters of one old-space sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Regions looked at, multi-region objects counted per region.
    pub regions: usize,
    /// Regions that ended with nothing live.
    pub emptied: usize,
    /// Multi-region objects found dead.
    pub large_freed: usize,
    pub live_bytes: usize,
    /// Bytes on chunk lists afterwards, emptied regions included.
    pub free_bytes: usize,
    /// Gaps too small to reclaim.
    pub dark_bytes: usize,
    /// Length of the empty list afterwards.
    pub empty_regions: usize,
}

/// What sweeping one range left behind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RangeSweep {
    pub live_bytes: usize,
    /// First chunk of the range's list in address order, or
    /// [`FreeChunk::NONE`].
    pub free_head: usize,
    pub free_count: usize,
    pub free_bytes: usize,
    pub dark_bytes: usize,
}

/// Turns the gaps between marked objects into free chunks or dark matter.
#[derive(Debug)]
pub struct Sweeper<'a> {
    map: &'a ColorMap,
    fot: &'a FirstObjectTable,
    min_reclaimable: usize,
}

impl<'a> Sweeper<'a> {
    pub fn new(map: &'a ColorMap, fot: &'a FirstObjectTable, min_reclaimable: usize) -> Self {
        Self {
            map,
            fot,
            min_reclaimable,
        }
    }

    /// Whether the object at `addr` was marked by the trace.
    #[inline(always)]
    pub fn is_live(&self, addr: usize) -> bool {
        !self.map.covers(addr) || self.map.is_marked(addr)
    }

    /// Sweeps `range` in address order. Gaps of at least the reclaimable
    /// size are linked into one list, smaller ones become dark matter, and
    /// every gap is recorded in the first-object table.
    ///
    /// # Safety
    ///
    /// The trace must be complete, `range` must be covered by the color map
    /// and every marked object in it must start a valid object that ends
    /// inside the range.
    pub unsafe fn sweep_range(&self, range: Range<usize>) -> RangeSweep {
        let mut result = RangeSweep {
            free_head: FreeChunk::NONE,
            ..Default::default()
        };
        let mut tail: Option<FreeChunk> = None;
        let mut cursor = range.start;

        while cursor < range.end {
            let next = self.map.next_marked(cursor, range.end).unwrap_or(range.end);
            if next > cursor {
                let size = next - cursor;
                if size >= self.min_reclaimable {
                    // SAFETY: nothing marked lives between cursor and next
                    let chunk = unsafe { FreeChunk::format(cursor, size, FreeChunk::NONE) };
                    match tail {
                        Some(tail) => tail.set_next(cursor),
                        None => result.free_head = cursor,
                    }
                    tail = Some(chunk);
                    result.free_count += 1;
                    result.free_bytes += size;
                } else {
                    // SAFETY: as above
                    unsafe { write_filler(cursor, size) };
                    result.dark_bytes += size;
                }
                self.fot.set(cursor, size);
            }
            if next == range.end {
                break;
            }
            // SAFETY: marks sit on object starts
            let size = unsafe { header_at(next) }.size();
            result.live_bytes += size;
            cursor = next + size;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use object::{Cell, ObjectKind, classify, init_object};

    use super::*;
    use crate::freespace::ChunkIter;

    const LOG2: u32 = 7;
    const CARD: usize = 1 << LOG2;

    struct Arena {
        _mem: Vec<u64>,
        base: usize,
        len: usize,
    }

    impl Arena {
        fn new(cards: usize) -> Self {
            let mut mem = vec![0u64; (cards + 1) * CARD / 8];
            let base = (mem.as_mut_ptr() as usize + CARD - 1) & !(CARD - 1);
            Self {
                _mem: mem,
                base,
                len: cards * CARD,
            }
        }

        fn range(&self) -> Range<usize> {
            self.base..self.base + self.len
        }

        /// Lays out objects of the given sizes back to back.
        fn objects(&self, fot: &FirstObjectTable, sizes: &[usize]) -> Vec<usize> {
            let mut addr = self.base;
            let mut out = Vec::new();
            for &size in sizes {
                unsafe { init_object(addr as *mut u8, ObjectKind::ByteArray, 0, size) };
                fot.set(addr, size);
                out.push(addr);
                addr += size;
            }
            let end = self.base + self.len;
            if addr < end {
                unsafe { write_filler(addr, end - addr) };
                fot.set(addr, end - addr);
            }
            out
        }
    }

    #[test]
    fn gaps_become_chunks_or_dark_matter() {
        let arena = Arena::new(8);
        let fot = FirstObjectTable::new(arena.range(), LOG2);
        let objs = arena.objects(&fot, &[32, 64, 32, 256, 32]);
        let mut map = ColorMap::new(arena.range());
        for &live in &[objs[0], objs[2], objs[4]] {
            map.mark_black(live);
        }

        let sweeper = Sweeper::new(&map, &fot, 128);
        let swept = unsafe { sweeper.sweep_range(arena.range()) };
        assert_eq!(swept.live_bytes, 96);
        // the 64 byte gap stays dark, the 256 byte gap and the tail are
        // linked
        assert_eq!(swept.dark_bytes, 64);
        assert_eq!(unsafe { classify(objs[1]) }, Cell::Filler(64));
        let tail = objs[4] + 32;
        let chunks: Vec<(usize, usize)> = unsafe { ChunkIter::new(swept.free_head) }
            .map(|c| (c.addr(), c.size()))
            .collect();
        assert_eq!(chunks, vec![(objs[3], 256), (tail, arena.range().end - tail)]);
        assert_eq!(swept.free_count, 2);
        assert_eq!(swept.free_bytes, 256 + arena.range().end - tail);
    }

    #[test]
    fn dead_neighbours_coalesce() {
        let arena = Arena::new(4);
        let fot = FirstObjectTable::new(arena.range(), LOG2);
        let objs = arena.objects(&fot, &[64, 64, 64, 64]);
        let mut map = ColorMap::new(arena.range());
        map.mark_black(objs[3]);

        let sweeper = Sweeper::new(&map, &fot, 128);
        let swept = unsafe { sweeper.sweep_range(arena.range()) };
        assert_eq!(swept.free_head, objs[0]);
        assert_eq!(unsafe { classify(objs[0]) }, Cell::Filler(192));
        // the chunk's first-object entries point back at its start
        assert_eq!(fot.cell_start(fot.card_index(objs[1] + 64)), objs[0]);
    }

    #[test]
    fn unmarked_range_is_one_chunk() {
        let arena = Arena::new(4);
        let fot = FirstObjectTable::new(arena.range(), LOG2);
        arena.objects(&fot, &[128, 128]);
        let map = ColorMap::new(arena.range());
        let sweeper = Sweeper::new(&map, &fot, 128);
        let swept = unsafe { sweeper.sweep_range(arena.range()) };
        assert_eq!(swept.live_bytes, 0);
        assert_eq!((swept.free_head, swept.free_bytes), (arena.base, 4 * CARD));
    }
}
