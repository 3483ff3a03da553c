use std::{
    ops::Range,
    sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering},
};

use bitflags::bitflags;

/// Index of a region in the table.
pub type RegionId = usize;
pub const NO_REGION: RegionId = usize::MAX;
/// Owner id of a region sitting in the manager's pool.
pub const NO_OWNER: u32 = u32::MAX;
/// Free-chunk head offset of a region without free chunks.
pub const NO_CHUNK: usize = usize::MAX;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// Nothing live; the whole region is free.
    Empty = 0,
    /// Currently handed to an allocator.
    Allocating,
    /// Holds live objects and a list of reclaimable chunks.
    FreeChunks,
    /// Holds live objects and nothing worth reclaiming.
    Full,
    /// First region of a multi-region object.
    LargeHead,
    /// Interior region of a multi-region object.
    LargeBody,
    /// Last region of a multi-region object.
    LargeTail,
}

impl From<u8> for RegionState {
    fn from(val: u8) -> Self {
        match val {
            1 => RegionState::Allocating,
            2 => RegionState::FreeChunks,
            3 => RegionState::Full,
            4 => RegionState::LargeHead,
            5 => RegionState::LargeBody,
            6 => RegionState::LargeTail,
            _ => RegionState::Empty,
        }
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct RegionFlags: u8 {
        /// Physical memory backs the region.
        const COMMITTED = 1 << 0;
        /// The region belongs to the nursery.
        const YOUNG = 1 << 1;
    }
}

/// Metadata of one region.
#[derive(Debug)]
pub struct RegionDescriptor {
    state: AtomicU8,
    flags: AtomicU8,
    /// Id of the owning account, `NO_OWNER` while pooled.
    owner: AtomicU32,
    /// Byte offset of the first free chunk from the region start.
    free_chunk_head: AtomicUsize,
    free_chunk_count: AtomicUsize,
    free_bytes: AtomicUsize,
    /// Bytes found live by the last trace.
    live_bytes: AtomicUsize,
}

impl RegionDescriptor {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(RegionState::Empty as u8),
            flags: AtomicU8::new(0),
            owner: AtomicU32::new(NO_OWNER),
            free_chunk_head: AtomicUsize::new(NO_CHUNK),
            free_chunk_count: AtomicUsize::new(0),
            free_bytes: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    pub fn state(&self) -> RegionState {
        self.state.load(Ordering::Acquire).into()
    }

    #[inline(always)]
    pub fn set_state(&self, state: RegionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline(always)]
    pub fn flags(&self) -> RegionFlags {
        RegionFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn insert_flags(&self, flags: RegionFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn remove_flags(&self, flags: RegionFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn is_committed(&self) -> bool {
        self.flags().contains(RegionFlags::COMMITTED)
    }

    #[inline(always)]
    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn set_owner(&self, owner: u32) {
        self.owner.store(owner, Ordering::Release);
    }

    #[inline(always)]
    pub fn free_chunk_head(&self) -> usize {
        self.free_chunk_head.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn free_chunk_count(&self) -> usize {
        self.free_chunk_count.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes.load(Ordering::Relaxed)
    }

    /// Records the region's free-chunk list as built by a sweep.
    pub fn set_free_chunks(&self, head: usize, count: usize, bytes: usize) {
        self.free_chunk_head.store(head, Ordering::Relaxed);
        self.free_chunk_count.store(count, Ordering::Relaxed);
        self.free_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn clear_free_chunks(&self) {
        self.set_free_chunks(NO_CHUNK, 0, 0);
    }

    #[inline(always)]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn add_live_bytes(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn reset_live_bytes(&self) {
        self.live_bytes.store(0, Ordering::Relaxed);
    }
}

/// Fixed catalog of equally sized, size-aligned regions covering the
/// reserved heap range.
#[derive(Debug)]
pub struct RegionTable {
    base: usize,
    region_size_log2: u32,
    regions: Box<[RegionDescriptor]>,
}

impl RegionTable {
    pub fn new(base: usize, region_size_log2: u32, count: usize) -> Self {
        debug_assert!(base.is_multiple_of(1 << region_size_log2));
        let mut regions = Vec::with_capacity(count);
        regions.resize_with(count, RegionDescriptor::new);
        Self {
            base,
            region_size_log2,
            regions: regions.into_boxed_slice(),
        }
    }

    #[inline(always)]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.base + (self.regions.len() << self.region_size_log2)
    }

    /// Address range covered by every region.
    #[inline(always)]
    pub fn covered(&self) -> Range<usize> {
        self.base..self.end()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    #[inline(always)]
    pub fn region_size(&self) -> usize {
        1 << self.region_size_log2
    }

    #[inline(always)]
    pub fn region_size_log2(&self) -> u32 {
        self.region_size_log2
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Region holding `addr`. The address must be inside the table.
    #[inline(always)]
    pub fn region_id(&self, addr: usize) -> RegionId {
        debug_assert!(self.contains(addr), "0x{addr:x} outside the heap");
        (addr - self.base) >> self.region_size_log2
    }

    #[inline(always)]
    pub fn try_region_id(&self, addr: usize) -> Option<RegionId> {
        self.contains(addr).then(|| self.region_id(addr))
    }

    #[inline(always)]
    pub fn region_start(&self, id: RegionId) -> usize {
        debug_assert!(id < self.regions.len());
        self.base + (id << self.region_size_log2)
    }

    #[inline(always)]
    pub fn region_end(&self, id: RegionId) -> usize {
        self.region_start(id) + self.region_size()
    }

    #[inline(always)]
    pub fn region_bounds(&self, id: RegionId) -> Range<usize> {
        self.region_start(id)..self.region_end(id)
    }

    #[inline(always)]
    pub fn descriptor(&self, id: RegionId) -> &RegionDescriptor {
        &self.regions[id]
    }

    #[inline(always)]
    pub fn descriptor_for(&self, addr: usize) -> &RegionDescriptor {
        self.descriptor(self.region_id(addr))
    }

    /// Descriptors of the regions in `ids`, in id order.
    pub fn range(
        &self,
        ids: Range<RegionId>,
    ) -> impl Iterator<Item = (RegionId, &RegionDescriptor)> + '_ {
        let end = ids.end.min(self.regions.len());
        (ids.start..end).map(move |id| (id, &self.regions[id]))
    }

    /// Region ids overlapping the address range.
    pub fn ids_covering(&self, range: Range<usize>) -> Range<RegionId> {
        if range.start >= range.end {
            return 0..0;
        }
        let first = self.region_id(range.start.max(self.base));
        let last = self.region_id((range.end - 1).min(self.end() - 1));
        first..last + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RegionTable {
        RegionTable::new(1 << 30, 16, 8)
    }

    #[test]
    fn address_region_round_trip() {
        let table = table();
        for id in 0..table.len() {
            let start = table.region_start(id);
            assert_eq!(table.region_id(start), id);
            assert_eq!(table.region_id(start + table.region_size() - 1), id);
        }
        assert_eq!(table.try_region_id(table.end()), None);
        assert_eq!(table.try_region_id(table.base() - 8), None);
    }

    #[test]
    fn range_iteration_is_clamped() {
        let table = table();
        let ids: Vec<_> = table.range(6..12).map(|(id, _)| id).collect();
        assert_eq!(ids, vec![6, 7]);

        let covering = table.ids_covering(table.region_start(2) + 8..table.region_start(4) + 1);
        assert_eq!(covering, 2..5);
    }

    #[test]
    fn descriptor_state_and_flags() {
        let table = table();
        let d = table.descriptor(3);
        assert_eq!(d.state(), RegionState::Empty);
        d.set_state(RegionState::LargeBody);
        assert_eq!(d.state(), RegionState::LargeBody);

        d.insert_flags(RegionFlags::COMMITTED | RegionFlags::YOUNG);
        assert!(d.is_committed());
        d.remove_flags(RegionFlags::COMMITTED);
        assert_eq!(d.flags(), RegionFlags::YOUNG);

        d.set_free_chunks(64, 2, 512);
        assert_eq!((d.free_chunk_head(), d.free_chunk_count(), d.free_bytes()), (64, 2, 512));
        d.clear_free_chunks();
        assert_eq!(d.free_chunk_head(), NO_CHUNK);
    }
}
