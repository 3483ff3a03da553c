use std::sync::Arc;

use object::write_filler;
use parking_lot::Mutex;

use super::{FreeChunk, SegregatedFreeList};
use crate::{
    alloc::{ChunkListRefill, Extent, RefillManager},
    region::{HeapAccount, NO_CHUNK, RegionId, RegionList, RegionManager, RegionState},
    rset::{CardTableRSet, FirstObjectTable},
    sweep::{SweepStats, Sweeper},
};

/// Allocator an [`OldRefill`] serves. Each client keeps its own current
/// region so two allocators never bump through the same chunk list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillClient {
    /// The shared old-space allocator used for tenured allocation.
    Mutator,
    /// The collector's promotion buffer.
    Promotion,
}

impl RefillClient {
    #[inline(always)]
    fn index(self) -> usize {
        self as usize
    }
}

/// Ownership list a leased old-space region sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OldList {
    Empty,
    Chunked,
    Full,
    Large,
    Allocating,
}

/// Snapshot of the old space's bookkeeping.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OldSpaceUsage {
    pub leased: usize,
    pub reserve: usize,
    pub empty: usize,
    pub chunked: usize,
    pub full: usize,
    pub large: usize,
    pub allocating: usize,
    /// Bytes in the segregated bins.
    pub binned_bytes: usize,
    /// Bytes on region chunk lists, empty regions excluded.
    pub chunked_bytes: usize,
    pub dark_matter: usize,
}

#[derive(Debug)]
struct OldState {
    /// Formatted as a single chunk covering the region.
    empty: RegionList,
    /// Live objects plus a chunk list in the descriptor.
    chunked: RegionList,
    full: RegionList,
    /// Every region of a multi-region object.
    large: RegionList,
    /// Current region of a [`RefillClient`].
    allocating: RegionList,
    bins: SegregatedFreeList,
    current: [Option<RegionId>; 2],
    dark_matter: usize,
}

/// Old generation: regions leased from the `old` account, organized by
/// what is left in them.
///
/// Lock order is old-space state, then account, then pool.
#[derive(Debug)]
pub struct OldSpace {
    regions: Arc<RegionManager>,
    fot: Arc<FirstObjectTable>,
    account: HeapAccount,
    min_reclaimable: usize,
    large_threshold: usize,
    state: Mutex<OldState>,
}

impl OldSpace {
    pub fn new(
        regions: Arc<RegionManager>,
        fot: Arc<FirstObjectTable>,
        account: HeapAccount,
        min_reclaimable: usize,
        large_threshold: usize,
    ) -> Self {
        let links = regions.ownership_links();
        let state = OldState {
            empty: RegionList::new(links),
            chunked: RegionList::new(links),
            full: RegionList::new(links),
            large: RegionList::new(links),
            allocating: RegionList::new(links),
            bins: SegregatedFreeList::new(min_reclaimable),
            current: [None; 2],
            dark_matter: 0,
        };
        Self {
            regions,
            fot,
            account,
            min_reclaimable,
            large_threshold,
            state: Mutex::new(state),
        }
    }

    #[inline(always)]
    pub fn account(&self) -> &HeapAccount {
        &self.account
    }

    #[inline(always)]
    pub fn min_reclaimable(&self) -> usize {
        self.min_reclaimable
    }

    #[inline(always)]
    pub fn large_threshold(&self) -> usize {
        self.large_threshold
    }

    #[inline(always)]
    fn region_size(&self) -> usize {
        self.regions.table().region_size()
    }

    /// Whether `addr` lies in a region leased by the old space.
    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        self.regions
            .table()
            .try_region_id(addr)
            .is_some_and(|region| self.account.owns(&self.regions, region))
    }

    pub fn usage(&self) -> OldSpaceUsage {
        let state = self.state.lock();
        let table = self.regions.table();
        let links = self.regions.ownership_links();
        OldSpaceUsage {
            leased: self.account.leased(),
            reserve: self.account.reserve(),
            empty: state.empty.len(),
            chunked: state.chunked.len(),
            full: state.full.len(),
            large: state.large.len(),
            allocating: state.allocating.len(),
            binned_bytes: state.bins.free_bytes(),
            chunked_bytes: state
                .chunked
                .iter(links)
                .map(|region| table.descriptor(region).free_bytes())
                .sum(),
            dark_matter: state.dark_matter,
        }
    }

    /// Which list holds `region`, if the old space leased it.
    pub fn list_of(&self, region: RegionId) -> Option<OldList> {
        let state = self.state.lock();
        let member = self.regions.ownership_links().member_of(region)?;
        [
            (state.empty.id(), OldList::Empty),
            (state.chunked.id(), OldList::Chunked),
            (state.full.id(), OldList::Full),
            (state.large.id(), OldList::Large),
            (state.allocating.id(), OldList::Allocating),
        ]
        .into_iter()
        .find_map(|(id, list)| (id == member).then_some(list))
    }

    /// Whether a chunk starting at `addr` sits in the bins.
    pub fn is_binned(&self, addr: usize) -> bool {
        self.state.lock().bins.contains(addr)
    }

    /// Regions guaranteed to take evacuated objects: empty regions plus
    /// what the account may still lease.
    pub fn evacuation_capacity(&self) -> usize {
        let state = self.state.lock();
        state.empty.len() + self.account.available()
    }

    /// Address ranges holding old objects, one per region or per
    /// multi-region object. Every range is parsable once the allocators
    /// are retired.
    pub fn occupied_ranges(&self) -> Vec<std::ops::Range<usize>> {
        let state = self.state.lock();
        let table = self.regions.table();
        let links = self.regions.ownership_links();
        let mut ranges: Vec<_> = state
            .chunked
            .iter(links)
            .chain(state.full.iter(links))
            .chain(state.allocating.iter(links))
            .map(|region| table.region_bounds(region))
            .collect();
        let mut large = state.large.iter(links).peekable();
        while let Some(head) = large.next() {
            let mut last = head;
            while let Some(&next) = large.peek() {
                if table.descriptor(next).state() == RegionState::LargeHead {
                    break;
                }
                last = next;
                large.next();
            }
            ranges.push(table.region_start(head)..table.region_end(last));
        }
        ranges.sort_by_key(|range| range.start);
        ranges
    }

    // ── Formatting ─────────────────────────────────────────────────

    /// Turns `[start, end)` into a binned chunk or dark matter.
    fn format_gap(&self, state: &mut OldState, start: usize, end: usize) {
        if end <= start {
            return;
        }
        let size = end - start;
        if size >= self.min_reclaimable {
            // SAFETY: callers only hand in dead old-space memory
            unsafe { state.bins.insert(start, size) };
        } else {
            // SAFETY: as above
            unsafe { write_filler(start, size) };
            state.dark_matter += size;
        }
        self.fot.set(start, size);
    }

    /// Formats a whole region as one chunk.
    fn format_empty(&self, region: RegionId) {
        let table = self.regions.table();
        let start = table.region_start(region);
        let size = table.region_size();
        // SAFETY: the region is committed and holds nothing live
        unsafe { FreeChunk::format(start, size, FreeChunk::NONE) };
        self.fot.set(start, size);
        let descriptor = table.descriptor(region);
        descriptor.set_state(RegionState::Empty);
        descriptor.set_free_chunks(0, 1, size);
    }

    /// Leases one more region into the empty list.
    fn lease_empty(&self, state: &mut OldState) -> Option<RegionId> {
        match self
            .account
            .allocate(&self.regions, 1, &mut state.empty, true, false)
        {
            Ok(1) => {
                let region = state.empty.tail()?;
                self.format_empty(region);
                Some(region)
            }
            Ok(_) => None,
            Err(err) => {
                log::warn!("old space could not lease a region: {err}");
                None
            }
        }
    }

    // ── Region chunk lists ─────────────────────────────────────────

    fn chunk_head(&self, region: RegionId) -> usize {
        match self.regions.table().descriptor(region).free_chunk_head() {
            NO_CHUNK => FreeChunk::NONE,
            offset => self.regions.table().region_start(region) + offset,
        }
    }

    fn has_chunk(&self, region: RegionId, size: usize) -> bool {
        let descriptor = self.regions.table().descriptor(region);
        if descriptor.free_bytes() < size {
            return false;
        }
        // SAFETY: descriptor heads point to formatted lists
        unsafe { super::ChunkIter::new(self.chunk_head(region)) }.any(|c| c.size() >= size)
    }

    /// Unlinks the first chunk of at least `size` bytes from the region's
    /// list.
    fn take_chunk(&self, region: RegionId, size: usize) -> Option<FreeChunk> {
        let table = self.regions.table();
        let descriptor = table.descriptor(region);
        let mut prev: Option<FreeChunk> = None;
        // SAFETY: descriptor heads point to formatted lists
        for chunk in unsafe { super::ChunkIter::new(self.chunk_head(region)) } {
            if chunk.size() < size {
                prev = Some(chunk);
                continue;
            }
            let next = chunk.next_addr();
            let head = match prev {
                Some(prev) => {
                    prev.set_next(next);
                    descriptor.free_chunk_head()
                }
                None if next == FreeChunk::NONE => NO_CHUNK,
                None => next - table.region_start(region),
            };
            descriptor.set_free_chunks(
                head,
                descriptor.free_chunk_count() - 1,
                descriptor.free_bytes() - chunk.size(),
            );
            return Some(chunk);
        }
        None
    }

    /// Moves `region` from `from` into the allocating list as the
    /// client's current region.
    fn start_allocating(
        &self,
        state: &mut OldState,
        region: RegionId,
        from: OldList,
        client: RefillClient,
    ) {
        let links = self.regions.ownership_links();
        match from {
            OldList::Empty => state.empty.remove(links, region),
            OldList::Chunked => state.chunked.remove(links, region),
            _ => unreachable!("regions are only taken from the empty or chunked list"),
        }
        state.allocating.append(links, region);
        self.regions
            .table()
            .descriptor(region)
            .set_state(RegionState::Allocating);
        state.current[client.index()] = Some(region);
    }

    /// Hands the client's current region back to the chunked or full list.
    fn retire_current(&self, state: &mut OldState, client: RefillClient) {
        let Some(region) = state.current[client.index()].take() else {
            return;
        };
        let links = self.regions.ownership_links();
        let descriptor = self.regions.table().descriptor(region);
        state.allocating.remove(links, region);
        if descriptor.free_chunk_count() > 0 {
            descriptor.set_state(RegionState::FreeChunks);
            state.chunked.append(links, region);
        } else {
            descriptor.clear_free_chunks();
            descriptor.set_state(RegionState::Full);
            state.full.append(links, region);
        }
    }

    /// Ends every client's current region. Allocators must be retired
    /// first.
    pub fn retire_clients(&self) {
        let mut state = self.state.lock();
        self.retire_current(&mut state, RefillClient::Mutator);
        self.retire_current(&mut state, RefillClient::Promotion);
    }

    /// An empty region, leasing one if none is left.
    fn next_empty(&self, state: &mut OldState) -> Option<RegionId> {
        match state.empty.head() {
            Some(region) => Some(region),
            None => self.lease_empty(state),
        }
    }

    // ── Refill paths ───────────────────────────────────────────────

    fn refill_extent(&self, client: RefillClient, size: usize) -> Option<Extent> {
        let mut state = self.state.lock();
        if let Some(region) = state.current[client.index()] {
            if let Some(chunk) = self.take_chunk(region, size) {
                return Some(Extent::new(chunk.addr(), chunk.end()));
            }
            self.retire_current(&mut state, client);
        }

        let links = self.regions.ownership_links();
        let candidate = state.chunked.iter(links).find(|&r| self.has_chunk(r, size));
        let (region, from) = match candidate {
            Some(region) => (region, OldList::Chunked),
            None if size <= self.region_size() => (self.next_empty(&mut state)?, OldList::Empty),
            None => return None,
        };
        self.start_allocating(&mut state, region, from, client);
        let chunk = self.take_chunk(region, size)?;
        log::trace!(
            "old space extent 0x{:x}..0x{:x} from region {region} for {client:?}",
            chunk.addr(),
            chunk.end()
        );
        Some(Extent::new(chunk.addr(), chunk.end()))
    }

    fn refill_chunk_list(&self, client: RefillClient, size: usize) -> Option<usize> {
        let mut state = self.state.lock();
        self.retire_current(&mut state, client);

        let links = self.regions.ownership_links();
        let candidate = state.chunked.iter(links).find(|&r| self.has_chunk(r, size));
        let (region, from) = match candidate {
            Some(region) => (region, OldList::Chunked),
            None if size <= self.region_size() => (self.next_empty(&mut state)?, OldList::Empty),
            None => return None,
        };
        let head = self.chunk_head(region);
        self.start_allocating(&mut state, region, from, client);
        self.regions.table().descriptor(region).clear_free_chunks();
        log::trace!("old space chunk list of region {region} for {client:?}");
        Some(head)
    }

    fn overflow(&self, size: usize) -> Option<usize> {
        let mut state = self.state.lock();
        let chunk = state.bins.take(size)?;
        self.format_gap(&mut state, chunk.addr() + size, chunk.end());
        Some(chunk.addr())
    }

    fn make_parsable(&self, start: usize, end: usize) {
        let mut state = self.state.lock();
        self.format_gap(&mut state, start, end);
    }

    /// Allocates `size` bytes in regions of their own. The caller
    /// initializes the object and records it in the first-object table.
    pub fn allocate_large(&self, size: usize) -> Option<usize> {
        let region_size = self.region_size();
        let count = size.div_ceil(region_size);
        let mut state = self.state.lock();
        let table = self.regions.table();
        let links = self.regions.ownership_links();

        if count == 1 {
            let region = self.next_empty(&mut state)?;
            state.empty.remove(links, region);
            state.full.append(links, region);
            let descriptor = table.descriptor(region);
            descriptor.clear_free_chunks();
            descriptor.set_state(RegionState::Full);
            let start = table.region_start(region);
            self.format_gap(&mut state, start + size, start + region_size);
            log::debug!("large object of {size} bytes in region {region}");
            return Some(start);
        }

        let mut first = self.lease_contiguous(&mut state, count);
        if first.is_none() && !state.empty.is_empty() {
            // empty regions may be fragmenting the pool
            let released = self.release_empty(&mut state, 0);
            log::debug!("released {released} empty regions for a {count}-region object");
            first = self.lease_contiguous(&mut state, count);
        }
        let first = first?;

        let last = first + count - 1;
        for region in first..=last {
            let state = match region {
                r if r == first => RegionState::LargeHead,
                r if r == last => RegionState::LargeTail,
                _ => RegionState::LargeBody,
            };
            table.descriptor(region).set_state(state);
        }
        let start = table.region_start(first);
        let tail = start + size;
        let end = table.region_end(last);
        if tail < end {
            // SAFETY: the tail of a freshly leased run is dead
            unsafe { write_filler(tail, end - tail) };
            self.fot.set(tail, end - tail);
            state.dark_matter += end - tail;
        }
        log::debug!("large object of {size} bytes in regions {first}..={last}");
        Some(start)
    }

    fn lease_contiguous(&self, state: &mut OldState, count: usize) -> Option<RegionId> {
        match self
            .account
            .allocate_contiguous(&self.regions, count, &mut state.large)
        {
            Ok(first) => first,
            Err(err) => {
                log::warn!("old space could not lease {count} contiguous regions: {err}");
                None
            }
        }
    }

    /// Releases empty regions back to the pool until `retain` are left.
    fn release_empty(&self, state: &mut OldState, retain: usize) -> usize {
        let mut released = 0;
        while state.empty.len() > retain {
            let Some(region) = state.empty.tail() else {
                break;
            };
            if let Err(err) = self.account.release(&self.regions, region, &mut state.empty) {
                log::warn!("could not release region {region}: {err}");
                break;
            }
            released += 1;
        }
        released
    }

    /// Uncommits and releases empty regions beyond `retain`.
    pub fn shrink(&self, retain: usize) -> usize {
        let mut state = self.state.lock();
        let released = self.release_empty(&mut state, retain);
        if released > 0 {
            log::debug!("old space released {released} empty regions");
        }
        released
    }

    // ── Sweep ──────────────────────────────────────────────────────

    /// Rebuilds every region's chunk list from the marks of a completed
    /// trace and files regions by what is left in them. Bins are emptied;
    /// their chunks are found again as gaps.
    pub fn sweep(&self, sweeper: &Sweeper<'_>, rset: &CardTableRSet) -> SweepStats {
        let mut state = self.state.lock();
        self.retire_current(&mut state, RefillClient::Mutator);
        self.retire_current(&mut state, RefillClient::Promotion);
        state.bins.clear();
        state.dark_matter = 0;

        let table = self.regions.table();
        let links = self.regions.ownership_links();
        let mut stats = SweepStats::default();

        let candidates: Vec<RegionId> = state
            .chunked
            .iter(links)
            .chain(state.full.iter(links))
            .collect();
        for region in candidates {
            let bounds = table.region_bounds(region);
            let descriptor = table.descriptor(region);
            // SAFETY: the world is stopped and every old region is parsable
            let swept = unsafe { sweeper.sweep_range(bounds.clone()) };
            stats.regions += 1;
            stats.live_bytes += swept.live_bytes;
            stats.dark_bytes += swept.dark_bytes;

            if descriptor.state() == RegionState::FreeChunks {
                state.chunked.remove(links, region);
            } else {
                state.full.remove(links, region);
            }
            if swept.live_bytes == 0 {
                self.format_empty(region);
                rset.clean_cards(bounds);
                state.empty.append(links, region);
                stats.emptied += 1;
                stats.free_bytes += table.region_size();
                continue;
            }
            state.dark_matter += swept.dark_bytes;
            stats.free_bytes += swept.free_bytes;
            if swept.free_count > 0 {
                let head = swept.free_head - bounds.start;
                descriptor.set_free_chunks(head, swept.free_count, swept.free_bytes);
                descriptor.set_state(RegionState::FreeChunks);
                state.chunked.append(links, region);
            } else {
                descriptor.clear_free_chunks();
                descriptor.set_state(RegionState::Full);
                state.full.append(links, region);
            }
        }

        let heads: Vec<RegionId> = state
            .large
            .iter(links)
            .filter(|&region| table.descriptor(region).state() == RegionState::LargeHead)
            .collect();
        for head in heads {
            let start = table.region_start(head);
            // SAFETY: a large head region starts with its object
            let size = unsafe { object::header_at(start) }.size();
            let count = size.div_ceil(table.region_size());
            stats.regions += count;
            if sweeper.is_live(start) {
                stats.live_bytes += size;
                state.dark_matter += count * table.region_size() - size;
                continue;
            }
            for region in head..head + count {
                state.large.remove(links, region);
                self.format_empty(region);
                rset.clean_cards(table.region_bounds(region));
                state.empty.append(links, region);
            }
            stats.large_freed += 1;
            stats.emptied += count;
            stats.free_bytes += count * table.region_size();
        }

        stats.empty_regions = state.empty.len();
        log::debug!(
            "swept {} old regions: {} live bytes, {} free bytes, {} dark bytes, {} emptied",
            stats.regions,
            stats.live_bytes,
            stats.free_bytes,
            stats.dark_bytes,
            stats.emptied
        );
        stats
    }
}

/// The old space seen through the refill protocol by one client.
#[derive(Debug, Clone)]
pub struct OldRefill {
    space: Arc<OldSpace>,
    client: RefillClient,
}

impl OldRefill {
    pub fn new(space: Arc<OldSpace>, client: RefillClient) -> Self {
        Self { space, client }
    }

    #[inline(always)]
    pub fn space(&self) -> &Arc<OldSpace> {
        &self.space
    }
}

impl RefillManager for OldRefill {
    #[inline(always)]
    fn should_refill(&self, _size: usize, space_left: usize) -> bool {
        space_left < self.space.min_reclaimable
    }

    fn allocate_refill(&self, size: usize) -> Option<Extent> {
        self.space.refill_extent(self.client, size)
    }

    fn allocate_overflow(&self, size: usize) -> Option<usize> {
        self.space.overflow(size)
    }

    #[inline(always)]
    fn is_large(&self, size: usize) -> bool {
        size >= self.space.large_threshold
    }

    fn allocate_large(&self, size: usize) -> Option<usize> {
        self.space.allocate_large(size)
    }

    fn make_parsable(&self, start: usize, end: usize) {
        self.space.make_parsable(start, end);
    }
}

impl ChunkListRefill for OldRefill {
    fn allocate_chunk_list(&self, size: usize) -> Option<usize> {
        self.space.refill_chunk_list(self.client, size)
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;

    use object::{Cell, ObjectKind, classify, init_object};

    use super::*;
    use crate::{
        alloc::{AtomicBumpAllocator, ChunkListAllocator, MIN_HEADROOM},
        mark::TricolorMarker,
        region::RegionTable,
        system::{reserve_memory, unmap_memory},
    };

    const LOG2: u32 = 16;
    const REGION: usize = 1 << LOG2;
    const MIN_RECLAIMABLE: usize = 128;
    const LARGE: usize = REGION / 4;

    struct Fixture {
        space: Arc<OldSpace>,
        regions: Arc<RegionManager>,
        rset: CardTableRSet,
        base: NonNull<u8>,
        size: usize,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            unmap_memory(self.base, self.size);
        }
    }

    fn fixture(count: usize, reserve: usize) -> Fixture {
        let size = count << LOG2;
        let base = reserve_memory(size, REGION).expect("reserve");
        let table = RegionTable::new(base.as_ptr() as usize, LOG2, count);
        let covered = table.covered();
        let regions = Arc::new(RegionManager::new(table));
        let rset = CardTableRSet::new(covered, 9);
        let account = regions.open_account("old", reserve).expect("open");
        let space = Arc::new(OldSpace::new(
            regions.clone(),
            rset.fot().clone(),
            account,
            MIN_RECLAIMABLE,
            LARGE,
        ));
        Fixture {
            space,
            regions,
            rset,
            base,
            size,
        }
    }

    fn object(fixture: &Fixture, addr: usize, size: usize) {
        unsafe { init_object(addr as *mut u8, ObjectKind::ByteArray, 0, size) };
        fixture.rset.fot().set(addr, size);
    }

    fn sweep_with_live(fixture: &Fixture, live: &[usize]) -> SweepStats {
        let table = fixture.regions.table();
        let mut marker = TricolorMarker::new(table.covered(), 64);
        for &addr in live {
            marker.mark_root(object::Value::from_addr(addr));
        }
        marker.trace(table);
        let sweeper = Sweeper::new(marker.color_map(), fixture.rset.fot(), MIN_RECLAIMABLE);
        fixture.space.sweep(&sweeper, &fixture.rset)
    }

    #[test]
    fn extent_refill_leases_and_formats_regions() {
        let f = fixture(4, 3);
        let refill = OldRefill::new(f.space.clone(), RefillClient::Mutator);
        let extent = refill.allocate_refill(1024).expect("extent");
        assert_eq!(extent.size(), REGION);
        let region = f.regions.table().region_id(extent.start);
        assert_eq!(f.space.list_of(region), Some(OldList::Allocating));
        assert_eq!(
            f.regions.table().descriptor(region).state(),
            RegionState::Allocating
        );

        // the current region has nothing left, so it is filed as full
        let next = refill.allocate_refill(1024).expect("extent");
        assert_ne!(f.regions.table().region_id(next.start), region);
        assert_eq!(f.space.list_of(region), Some(OldList::Full));
        assert_eq!(f.space.usage().leased, 2);
    }

    #[test]
    fn leftovers_go_to_bins_or_dark_matter() {
        let f = fixture(2, 2);
        let refill = OldRefill::new(f.space.clone(), RefillClient::Mutator);
        let extent = refill.allocate_refill(REGION).expect("extent");
        let start = extent.start;

        refill.make_parsable(start, start + 512);
        refill.make_parsable(start + 512, start + 576);
        assert!(f.space.is_binned(start));
        assert!(!f.space.is_binned(start + 512));
        assert_eq!(unsafe { classify(start + 512) }, Cell::Filler(64));
        let usage = f.space.usage();
        assert_eq!((usage.binned_bytes, usage.dark_matter), (512, 64));
        assert_eq!(f.rset.fot().cell_start(f.rset.fot().card_index(start)), start);

        // overflow splits the binned chunk, the 96 byte rest is dark
        let addr = refill.allocate_overflow(416).expect("overflow");
        assert_eq!(addr, start);
        assert_eq!(unsafe { classify(start + 416) }, Cell::Filler(96));
        assert_eq!(f.space.usage().binned_bytes, 0);
        assert!(refill.allocate_overflow(64).is_none());
    }

    #[test]
    fn bump_allocator_over_old_space() {
        let f = fixture(4, 4);
        let refill = OldRefill::new(f.space.clone(), RefillClient::Mutator);
        let alloc = AtomicBumpAllocator::new(refill, MIN_HEADROOM);
        let mut seen = Vec::new();
        for _ in 0..(3 * REGION / 4096) {
            let addr = alloc.allocate(4096 - 64).expect("allocate");
            seen.push(addr);
        }
        seen.sort_unstable();
        assert!(seen.windows(2).all(|w| w[0] + 4096 - 64 <= w[1]));
        assert!(f.space.usage().leased >= 3);
    }

    #[test]
    fn single_region_large_object_is_full_and_sweeps_back_to_empty() {
        let f = fixture(10, 10);
        let size = REGION - 64;
        let addr = f.space.allocate_large(size).expect("large");
        object(&f, addr, size);
        let region = f.regions.table().region_id(addr);
        assert_eq!(f.space.list_of(region), Some(OldList::Full));
        assert_eq!(f.regions.table().descriptor(region).state(), RegionState::Full);

        let stats = sweep_with_live(&f, &[]);
        assert_eq!(stats.emptied, 1);
        assert_eq!(f.space.list_of(region), Some(OldList::Empty));
        assert_eq!(f.regions.table().descriptor(region).state(), RegionState::Empty);
        assert_eq!(unsafe { classify(addr) }, Cell::Filler(REGION));
    }

    #[test]
    fn multi_region_objects_are_freed_as_a_whole() {
        let f = fixture(8, 8);
        let size = 2 * REGION + 1024;
        let addr = f.space.allocate_large(size).expect("large");
        object(&f, addr, size);
        let head = f.regions.table().region_id(addr);
        let table = f.regions.table();
        assert_eq!(table.descriptor(head).state(), RegionState::LargeHead);
        assert_eq!(table.descriptor(head + 1).state(), RegionState::LargeBody);
        assert_eq!(table.descriptor(head + 2).state(), RegionState::LargeTail);
        assert_eq!(
            f.space.occupied_ranges(),
            vec![table.region_start(head)..table.region_end(head + 2)]
        );

        let stats = sweep_with_live(&f, &[addr]);
        assert_eq!(stats.large_freed, 0);
        assert_eq!(f.space.list_of(head + 1), Some(OldList::Large));

        let stats = sweep_with_live(&f, &[]);
        assert_eq!(stats.large_freed, 1);
        for region in head..head + 3 {
            assert_eq!(f.space.list_of(region), Some(OldList::Empty));
        }
        assert_eq!(f.space.shrink(1), 2);
        assert_eq!(f.space.usage().empty, 1);
        assert_eq!(f.space.account().leased(), 1);
    }

    #[test]
    fn sweep_builds_chunk_lists_for_promotion() {
        let f = fixture(4, 4);
        let refill = OldRefill::new(f.space.clone(), RefillClient::Mutator);
        let alloc = AtomicBumpAllocator::new(refill, MIN_HEADROOM);
        let a = alloc.allocate(64).expect("allocate");
        let b = alloc.allocate(1024).expect("allocate");
        let c = alloc.allocate(64).expect("allocate");
        let d = alloc.allocate(64).expect("allocate");
        for (addr, size) in [(a, 64), (b, 1024), (c, 64), (d, 64)] {
            object(&f, addr, size);
        }
        alloc.retire();

        let stats = sweep_with_live(&f, &[a, c]);
        let region = f.regions.table().region_id(a);
        assert_eq!(f.space.list_of(region), Some(OldList::Chunked));
        assert_eq!(stats.live_bytes, 128);
        let descriptor = f.regions.table().descriptor(region);
        // b, and d through the end of the region
        assert_eq!(descriptor.free_chunk_count(), 2);
        assert_eq!(descriptor.free_bytes(), REGION - 128);

        let promotion = OldRefill::new(f.space.clone(), RefillClient::Promotion);
        let mut buffer = ChunkListAllocator::new(promotion);
        assert_eq!(buffer.allocate(512).expect("promote"), b);
        assert_eq!(buffer.allocate(512).expect("promote"), b + 512);
        // b is used up, the next copy lands behind c
        assert_eq!(buffer.allocate(512).expect("promote"), d);
        buffer.retire();
        f.space.retire_clients();
        assert_eq!(f.space.list_of(region), Some(OldList::Full));
    }
}
