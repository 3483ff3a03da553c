//! Generational region heap.
//!
//! A fixed, contiguous nursery is evacuated into an old space of regions
//! by a copying collector; the old space is reclaimed in place by a full
//! mark and sweep. Mutator threads allocate through a [`HeapProxy`] and
//! stop together at safepoints when a collection is requested. The
//! collection itself runs on the thread that requested it.
//!
//! This crate is decoupled from any specific VM. Consumers provide a
//! [`RootProvider`] per thread; object layouts come from the `object`
//! crate.

use std::{
    mem,
    ops::{Deref, Range},
    ptr::{self, NonNull},
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use object::{MIN_OBJECT_SIZE, Object, ObjectKind, Value, init_object, object_allocation_size};
use parking_lot::Mutex;

use crate::{
    AllocError, HeapError, SenseBarrier,
    alloc::{AtomicBumpAllocator, ChunkListAllocator, Extent, MIN_HEADROOM, RefillManager, Tlab, align_size, fill},
    error::invariant_violation,
    evacuate::{EvacuationStats, Evacuator},
    freespace::{OldRefill, OldSpace, RefillClient},
    mark::{MarkStats, TricolorMarker},
    region::{HeapAccount, RegionFlags, RegionId, RegionList, RegionManager, RegionState, RegionTable},
    rset::CardTableRSet,
    settings::{HeapSettings, TraceLevel},
    stats::{CollectionKind, CollectionReason, CollectionStats, HeapStats},
    sweep::{SweepStats, Sweeper},
    system::{reserve_memory, unmap_memory},
    walk::verify_references,
};

// ── Roots ─────────────────────────────────────────────────────────────

/// Consumers implement this to provide GC roots.
///
/// Called when a collection starts to discover live roots from VM state
/// (stacks, activations, permanent roots, etc.). The visitor receives
/// `&mut Value` so the collector can update roots in place when it moves
/// their referents. The visited slots must stay where they are until the
/// collection ends; the calling thread is parked for that whole time.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

/// Location of one root slot, valid while its thread is parked.
#[derive(Debug, Clone, Copy)]
struct RootSlot(NonNull<Value>);

// SAFETY: a slot is only touched by the coordinator while the owning
// thread waits in the rendezvous.
unsafe impl Send for RootSlot {}

/// Root slots submitted by the mutators of one collection.
#[derive(Debug, Default)]
pub struct RootSet {
    slots: Vec<RootSlot>,
}

impl RootSet {
    /// Snapshots the slot addresses `provider` visits.
    pub fn collect(provider: &mut dyn RootProvider) -> Self {
        let mut slots = Vec::new();
        provider.visit_roots(&mut |value| slots.push(RootSlot(NonNull::from(value))));
        Self { slots }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn extend(&mut self, other: RootSet) {
        self.slots.extend(other.slots);
    }

    /// # Safety
    ///
    /// The threads that submitted the slots must still be parked.
    unsafe fn values(&self) -> impl Iterator<Item = Value> + '_ {
        // SAFETY: forwarded to caller
        self.slots.iter().map(|slot| unsafe { *slot.0.as_ptr() })
    }

    /// # Safety
    ///
    /// Same as [`values`](Self::values).
    unsafe fn for_each_mut(&mut self, mut visit: impl FnMut(&mut Value)) {
        for slot in &mut self.slots {
            // SAFETY: forwarded to caller
            visit(unsafe { slot.0.as_mut() });
        }
    }
}

// ── GC status / state ─────────────────────────────────────────────────

/// Collection requested for the current cycle. Ordered by strength so a
/// pending minor can be raised to a major.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcStatus {
    None = 0,
    MinorRequested = 1,
    MajorRequested = 2,
}

impl From<CollectionKind> for GcStatus {
    fn from(kind: CollectionKind) -> Self {
        match kind {
            CollectionKind::Minor => GcStatus::MinorRequested,
            CollectionKind::Full => GcStatus::MajorRequested,
        }
    }
}

/// Decoded [`GcState`] word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcSnapshot {
    pub status: GcStatus,
    /// Bumped when a cycle starts; wraps within 30 bits.
    pub generation: u32,
    /// Registered mutators, i.e. the participants of a cycle.
    pub threads: u32,
}

impl GcSnapshot {
    const STATUS_BITS: u32 = 2;
    const GENERATION_BITS: u32 = 30;
    const GENERATION_MASK: u32 = (1 << Self::GENERATION_BITS) - 1;

    #[inline(always)]
    fn encode(self) -> u64 {
        debug_assert!(self.generation <= Self::GENERATION_MASK);
        self.status as u64
            | (self.generation as u64) << Self::STATUS_BITS
            | (self.threads as u64) << (Self::STATUS_BITS + Self::GENERATION_BITS)
    }

    #[inline(always)]
    fn decode(word: u64) -> Self {
        let status = match word & ((1 << Self::STATUS_BITS) - 1) {
            1 => GcStatus::MinorRequested,
            2 => GcStatus::MajorRequested,
            _ => GcStatus::None,
        };
        Self {
            status,
            generation: (word >> Self::STATUS_BITS) as u32 & Self::GENERATION_MASK,
            threads: (word >> (Self::STATUS_BITS + Self::GENERATION_BITS)) as u32,
        }
    }

    #[inline(always)]
    pub fn is_collecting(self) -> bool {
        self.status != GcStatus::None
    }

    #[inline(always)]
    fn next_generation(self) -> u32 {
        self.generation.wrapping_add(1) & Self::GENERATION_MASK
    }
}

/// Outcome of [`GcState::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcRequest {
    /// The caller opened a new cycle and runs the collection.
    Coordinate(GcSnapshot),
    /// A cycle was already pending; the caller joins it. The status may
    /// have been raised to the caller's request.
    Join(GcSnapshot),
}

impl GcRequest {
    #[inline(always)]
    pub fn is_coordinator(self) -> bool {
        matches!(self, GcRequest::Coordinate(_))
    }

    #[inline(always)]
    pub fn snapshot(self) -> GcSnapshot {
        match self {
            GcRequest::Coordinate(snapshot) | GcRequest::Join(snapshot) => snapshot,
        }
    }
}

/// Status, generation and registered thread count in one atomic word, so
/// every transition is a single compare-and-swap over a [`GcSnapshot`].
#[derive(Debug)]
pub struct GcState(AtomicU64);

impl GcState {
    pub fn new() -> Self {
        let idle = GcSnapshot {
            status: GcStatus::None,
            generation: 0,
            threads: 0,
        };
        Self(AtomicU64::new(idle.encode()))
    }

    #[inline(always)]
    pub fn snapshot(&self) -> GcSnapshot {
        GcSnapshot::decode(self.0.load(Ordering::Acquire))
    }

    /// Applies `change` atomically. `Ok` carries the snapshot before the
    /// change, `Err` the snapshot `change` declined.
    #[inline(always)]
    fn update(&self, mut change: impl FnMut(GcSnapshot) -> Option<GcSnapshot>) -> Result<GcSnapshot, GcSnapshot> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                change(GcSnapshot::decode(word)).map(GcSnapshot::encode)
            })
            .map(GcSnapshot::decode)
            .map_err(GcSnapshot::decode)
    }

    /// Registers a mutator thread, waiting out a running collection.
    pub fn register_thread(&self) {
        while self
            .update(|s| {
                if s.is_collecting() {
                    return None;
                }
                let Some(threads) = s.threads.checked_add(1) else {
                    invariant_violation(format_args!("mutator thread count overflow"), None);
                };
                Some(GcSnapshot { threads, ..s })
            })
            .is_err()
        {
            std::thread::yield_now();
        }
    }

    /// Deregisters a mutator thread unless a collection is running, in
    /// which case the thread still has to take part and `false` is
    /// returned.
    pub fn try_deregister_thread(&self) -> bool {
        self.update(|s| {
            if s.is_collecting() {
                return None;
            }
            let Some(threads) = s.threads.checked_sub(1) else {
                invariant_violation(format_args!("mutator thread count underflow"), None);
            };
            Some(GcSnapshot { threads, ..s })
        })
        .is_ok()
    }

    /// Asks for a collection of at least `requested`. The first caller of
    /// a cycle becomes its coordinator; later callers join and raise a
    /// pending minor to a major if they need one.
    pub fn request(&self, requested: GcStatus) -> GcRequest {
        debug_assert_ne!(requested, GcStatus::None);
        let result = self.update(|s| match s.status {
            GcStatus::None => Some(GcSnapshot {
                status: requested,
                generation: s.next_generation(),
                ..s
            }),
            pending if pending < requested => Some(GcSnapshot {
                status: requested,
                ..s
            }),
            _ => None,
        });
        match result {
            Ok(before) if before.is_collecting() => GcRequest::Join(GcSnapshot {
                status: requested,
                ..before
            }),
            Ok(before) => GcRequest::Coordinate(GcSnapshot {
                status: requested,
                generation: before.next_generation(),
                ..before
            }),
            Err(current) => GcRequest::Join(current),
        }
    }

    /// Ends the collection (coordinator only). Generation and threads are
    /// left unchanged.
    pub fn finish_gc(&self) {
        let _ = self.update(|s| {
            s.is_collecting().then_some(GcSnapshot {
                status: GcStatus::None,
                ..s
            })
        });
    }
}

impl Default for GcState {
    fn default() -> Self {
        Self::new()
    }
}

/// Synchronization state of the stop-the-world rendezvous.
#[derive(Debug)]
pub struct SyncState {
    pub state: GcState,
    /// Lets threads sleep until the last participant arrives.
    pub barrier: SenseBarrier,
    /// Root sets submitted by the participants.
    inputs: Mutex<Vec<RootSet>>,
}

impl SyncState {
    fn new() -> Self {
        Self {
            state: GcState::new(),
            barrier: SenseBarrier::new(),
            inputs: Mutex::new(Vec::new()),
        }
    }
}

// ── Nursery ───────────────────────────────────────────────────────────

/// The nursery is one fixed extent; running out of it means collecting.
#[derive(Debug, Clone, Copy)]
struct NurseryRefill;

impl RefillManager for NurseryRefill {
    fn should_refill(&self, _size: usize, _space_left: usize) -> bool {
        true
    }

    fn allocate_refill(&self, _size: usize) -> Option<Extent> {
        None
    }

    fn allocate_overflow(&self, _size: usize) -> Option<usize> {
        None
    }

    fn is_large(&self, _size: usize) -> bool {
        false
    }

    fn allocate_large(&self, _size: usize) -> Option<usize> {
        None
    }

    fn make_parsable(&self, start: usize, end: usize) {
        // SAFETY: the allocator only hands over its unused leftover
        unsafe { fill(start, end) };
    }
}

// ── HeapInner ─────────────────────────────────────────────────────────

/// Core shared heap state.
#[derive(Debug)]
pub struct HeapInner {
    settings: HeapSettings,
    base: NonNull<u8>,
    mapped: usize,
    regions: Arc<RegionManager>,
    rset: CardTableRSet,

    nursery_account: HeapAccount,
    nursery_range: Range<usize>,
    nursery_regions: RegionList,
    nursery: AtomicBumpAllocator<NurseryRefill>,

    old_space: Arc<OldSpace>,
    /// Direct old-space allocations of the mutators.
    old_alloc: AtomicBumpAllocator<OldRefill>,
    /// Destination of evacuated objects, used by the coordinator only.
    promotion: Mutex<ChunkListAllocator<OldRefill>>,
    marker: Mutex<TricolorMarker>,

    pub sync: SyncState,
    minor_since_major: AtomicU32,
    stats: Mutex<HeapStats>,
}

// SAFETY: the mapping is owned by the heap and only accessed through
// allocators and collector phases that synchronize among themselves.
unsafe impl Send for HeapInner {}
// SAFETY: see above
unsafe impl Sync for HeapInner {}

impl HeapInner {
    pub fn new(settings: HeapSettings) -> Result<Self, HeapError> {
        settings.validate()?;
        let mapped = settings.heap_size();
        let base = reserve_memory(mapped, settings.region_size()).ok_or(HeapError::MapFailed(mapped))?;

        let table = RegionTable::new(base.as_ptr() as usize, settings.region_size_log2, settings.region_count);
        let covered = table.covered();
        let regions = Arc::new(RegionManager::new(table));
        let rset = CardTableRSet::new(covered.clone(), settings.card_size_log2);

        let nursery_account = regions.open_account("nursery", settings.nursery_regions)?;
        let mut nursery_regions = RegionList::new(regions.ownership_links());
        let Some(first) =
            nursery_account.allocate_contiguous(&regions, settings.nursery_regions, &mut nursery_regions)?
        else {
            return Err(HeapError::ReserveExhausted {
                account: nursery_account.name().to_owned(),
                requested: settings.nursery_regions,
                available: regions.pooled(),
            });
        };
        let table = regions.table();
        for (_, descriptor) in table.range(first..first + settings.nursery_regions) {
            descriptor.insert_flags(RegionFlags::YOUNG);
            descriptor.set_state(RegionState::Allocating);
        }
        let nursery_range = table.region_start(first)..table.region_end(first + settings.nursery_regions - 1);
        let nursery = AtomicBumpAllocator::new(NurseryRefill, MIN_HEADROOM);
        nursery.reset(Extent::new(nursery_range.start, nursery_range.end));

        let old_account = regions.open_account("old", settings.old_regions())?;
        let old_space = Arc::new(OldSpace::new(
            regions.clone(),
            rset.fot().clone(),
            old_account,
            settings.min_reclaimable,
            settings.large_object_threshold,
        ));
        let old_alloc = AtomicBumpAllocator::new(OldRefill::new(old_space.clone(), RefillClient::Mutator), MIN_HEADROOM);
        let promotion = ChunkListAllocator::new(OldRefill::new(old_space.clone(), RefillClient::Promotion));
        let marker = TricolorMarker::new(covered, settings.mark_stack_capacity);

        log::debug!(
            "heap of {} regions x {} KB at 0x{:x}, nursery 0x{:x}..0x{:x}",
            settings.region_count,
            settings.region_size() / 1024,
            base.as_ptr() as usize,
            nursery_range.start,
            nursery_range.end
        );

        Ok(Self {
            settings,
            base,
            mapped,
            regions,
            rset,
            nursery_account,
            nursery_range,
            nursery_regions,
            nursery,
            old_space,
            old_alloc,
            promotion: Mutex::new(promotion),
            marker: Mutex::new(marker),
            sync: SyncState::new(),
            minor_since_major: AtomicU32::new(0),
            stats: Mutex::new(HeapStats::default()),
        })
    }

    #[inline(always)]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline(always)]
    pub fn table(&self) -> &RegionTable {
        self.regions.table()
    }

    #[inline(always)]
    pub fn regions(&self) -> &Arc<RegionManager> {
        &self.regions
    }

    #[inline(always)]
    pub fn old_space(&self) -> &Arc<OldSpace> {
        &self.old_space
    }

    #[inline(always)]
    pub fn rset(&self) -> &CardTableRSet {
        &self.rset
    }

    #[inline(always)]
    pub fn nursery_range(&self) -> Range<usize> {
        self.nursery_range.clone()
    }

    #[inline(always)]
    pub fn nursery_account(&self) -> &HeapAccount {
        &self.nursery_account
    }

    pub fn nursery_region_ids(&self) -> Vec<RegionId> {
        self.nursery_regions.to_vec(self.regions.ownership_links())
    }

    #[inline(always)]
    pub fn is_young(&self, addr: usize) -> bool {
        self.nursery_range.contains(&addr)
    }

    /// Nursery bytes handed out since the last evacuation. A nursery that
    /// ran dry counts as full.
    pub fn nursery_used(&self) -> usize {
        self.nursery
            .top()
            .clamp(self.nursery_range.start, self.nursery_range.end)
            - self.nursery_range.start
    }

    /// Generation counter of the latest collection.
    pub fn generation(&self) -> u32 {
        self.sync.state.snapshot().generation
    }

    pub fn stats(&self) -> HeapStats {
        self.stats.lock().clone()
    }

    /// Write-barrier primitive: a reference was stored at `origin + offset`.
    #[inline(always)]
    pub fn record(&self, origin: usize, offset: usize) {
        self.rset.record(origin, offset);
    }

    /// Checks that every reference held by an old object points at a live,
    /// unforwarded old object. Returns the number of references checked.
    /// Only meaningful with the world stopped right after an evacuation.
    pub fn verify(&self) -> usize {
        let old_space = &self.old_space;
        old_space
            .occupied_ranges()
            .into_iter()
            // SAFETY: allocators are retired while the world is stopped
            .map(|range| unsafe { verify_references(range, |target| old_space.contains(target)) })
            .sum()
    }

    // ── Rendezvous ────────────────────────────────────────────────────

    /// Stop-the-world protocol: submit roots, wait for everyone, let the
    /// coordinator collect, wait, end the collection, exit handshake.
    pub fn rendezvous(&self, is_coordinator: bool, roots: RootSet, reason: CollectionReason) {
        let cycle = self.sync.state.snapshot();
        if !cycle.is_collecting() {
            return;
        }
        let participants = cycle.threads as usize;

        self.sync.inputs.lock().push(roots);

        // everyone arrives, roots are complete
        self.sync.barrier.wait(participants);

        if is_coordinator {
            let inputs = mem::take(&mut *self.sync.inputs.lock());
            let roots = inputs.into_iter().fold(RootSet::default(), |mut acc, set| {
                acc.extend(set);
                acc
            });
            // joiners may have raised the request until the last one arrived
            let status = self.sync.state.snapshot().status;
            let stats = self.collect(status, cycle.generation, cycle.threads, reason, roots);
            self.stats.lock().record(stats);
        }

        // collection done
        self.sync.barrier.wait(participants);

        if is_coordinator {
            self.sync.state.finish_gc();
        }

        // exit handshake, nobody races into the next cycle's barrier
        self.sync.barrier.wait(participants);
    }

    // ── Collection ────────────────────────────────────────────────────

    fn choose_kind(
        &self,
        status: GcStatus,
        reason: CollectionReason,
        nursery_used: usize,
    ) -> (CollectionKind, CollectionReason) {
        if status == GcStatus::MajorRequested {
            return (CollectionKind::Full, reason);
        }
        if self.minor_since_major.load(Ordering::Relaxed) >= self.settings.max_minor_before_major {
            return (CollectionKind::Full, CollectionReason::MinorLimit);
        }
        if self.old_space.evacuation_capacity() < self.settings.evacuation_regions_for(nursery_used) {
            return (CollectionKind::Full, CollectionReason::EvacuationReserve);
        }
        (CollectionKind::Minor, reason)
    }

    fn collect(
        &self,
        status: GcStatus,
        generation: u32,
        participants: u32,
        reason: CollectionReason,
        mut roots: RootSet,
    ) -> CollectionStats {
        let started = Instant::now();
        self.old_alloc.retire();
        self.old_space.retire_clients();

        let nursery_used = self.nursery_used();
        let (kind, reason) = self.choose_kind(status, reason, nursery_used);
        let mut stats = CollectionStats {
            generation,
            kind,
            reason,
            participants,
            roots: roots.len(),
            nursery_used,
            mark: None,
            sweep: None,
            evacuation: None,
            released_regions: 0,
            old_space: Default::default(),
            duration: Duration::ZERO,
        };

        if kind == CollectionKind::Full {
            // SAFETY: every submitting thread is parked until we are done
            let (mark, sweep, released) = unsafe { self.mark_and_sweep(&roots) };
            stats.mark = Some(mark);
            stats.sweep = Some(sweep);
            stats.released_regions = released;
            self.minor_since_major.store(0, Ordering::Relaxed);
        } else {
            self.minor_since_major.fetch_add(1, Ordering::Relaxed);
        }

        let needed = self.settings.evacuation_regions_for(nursery_used);
        let capacity = self.old_space.evacuation_capacity();
        if capacity >= needed {
            // SAFETY: as above
            stats.evacuation = Some(unsafe { self.evacuate_nursery(&mut roots) });
            if cfg!(debug_assertions) {
                self.verify();
            }
        } else {
            log::warn!(
                "gc #{generation}: old space can take {capacity} of {needed} regions, nursery left in place"
            );
        }

        stats.old_space = self.old_space.usage();
        stats.duration = started.elapsed();
        match self.settings.trace_level {
            TraceLevel::Quiet => log::debug!("{stats}"),
            TraceLevel::Phases | TraceLevel::Verbose => log::info!("{stats}"),
        }
        stats
    }

    /// Full trace of the heap, then in-place reclamation of the old space.
    ///
    /// # Safety
    ///
    /// The world must be stopped and `roots` valid.
    unsafe fn mark_and_sweep(&self, roots: &RootSet) -> (MarkStats, SweepStats, usize) {
        let mut marker = self.marker.lock();
        marker.reset();
        marker.set_verbose(self.settings.trace_level == TraceLevel::Verbose);
        // SAFETY: forwarded to caller
        for root in unsafe { roots.values() } {
            marker.mark_root(root);
        }
        let mark = marker.trace(self.table());
        log::debug!("full trace: {} objects, {} bytes live", mark.objects, mark.bytes);

        let sweeper = Sweeper::new(marker.color_map(), self.rset.fot(), self.settings.min_reclaimable);
        let sweep = self.old_space.sweep(&sweeper, &self.rset);
        marker.reset();

        let released = self.old_space.shrink(self.settings.retained_empty_regions);
        if released > 0 {
            log::debug!("released {released} empty old regions");
        }
        (mark, sweep, released)
    }

    /// Copies every nursery object reachable from `roots` or a dirty card
    /// into the old space and resets the nursery.
    ///
    /// # Safety
    ///
    /// The world must be stopped and `roots` valid.
    unsafe fn evacuate_nursery(&self, roots: &mut RootSet) -> EvacuationStats {
        let nursery = self.nursery_range();
        let mut buffer = self.promotion.lock();
        // gathered before anything is promoted into these regions
        let ranges = self.old_space.occupied_ranges();

        let mut evacuator = Evacuator::new(nursery.clone(), &mut buffer, self.rset.fot());
        evacuator.set_verbose(self.settings.trace_level == TraceLevel::Verbose);
        // SAFETY: allocators are retired so old ranges are parsable; root
        // slots are valid per the caller
        unsafe {
            evacuator.evacuate_remembered(&self.rset, &ranges);
            roots.for_each_mut(|slot| evacuator.evacuate_slot(slot));
        }
        evacuator.drain();
        evacuator.process_weak();
        let stats = evacuator.finish();
        drop(buffer);

        self.old_space.retire_clients();
        self.rset.clean_cards(nursery.clone());
        self.nursery.reset(Extent::new(nursery.start, nursery.end));
        stats
    }
}

impl Drop for HeapInner {
    fn drop(&mut self) {
        unmap_memory(self.base, self.mapped);
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

/// Shared handle to the heap.
#[derive(Debug, Clone)]
pub struct Heap(Arc<HeapInner>);

impl Heap {
    pub fn new(settings: HeapSettings) -> Result<Self, HeapError> {
        Ok(Self(Arc::new(HeapInner::new(settings)?)))
    }

    /// Registers the calling thread as a mutator.
    #[must_use]
    pub fn proxy(&self) -> HeapProxy {
        HeapProxy::new(self.clone())
    }
}

impl Deref for Heap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ── HeapProxy (per-thread allocator) ──────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Young,
    Tenured,
}

/// Per-thread mutator handle: bump allocates from a private buffer and
/// takes part in collections.
///
/// Addresses returned by the allocation methods stay valid only until the
/// next safepoint of any thread unless they are reachable from a root.
///
/// A proxy joins pending collections whenever it needs fresh nursery
/// space. Loops that run long without allocating must call
/// [`safepoint`](HeapProxy::safepoint) themselves.
#[derive(Debug)]
pub struct HeapProxy {
    pub heap: Heap,
    tlab: Tlab,
    /// Bytes allocated through this proxy.
    allocated: usize,
}

impl HeapProxy {
    #[must_use]
    pub fn new(heap: Heap) -> Self {
        heap.sync.state.register_thread();
        Self {
            heap,
            tlab: Tlab::new(),
            allocated: 0,
        }
    }

    #[inline(always)]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Allocates `size` bytes of uninitialized memory, collecting as often
    /// as the settings allow when the heap is exhausted. The cell must be
    /// formatted before the next safepoint.
    #[inline(always)]
    pub fn allocate(&mut self, size: usize, roots: &mut dyn RootProvider) -> Result<NonNull<u8>, HeapError> {
        let size = align_size(size).max(MIN_OBJECT_SIZE);
        let addr = self.allocate_raw(size, Placement::Young, roots)?;
        Ok(Self::non_null(addr))
    }

    /// Like [`allocate`](Self::allocate), with the cell zeroed.
    pub fn allocate_cleared(&mut self, size: usize, roots: &mut dyn RootProvider) -> Result<NonNull<u8>, HeapError> {
        let size = align_size(size).max(MIN_OBJECT_SIZE);
        let addr = self.allocate_raw(size, Placement::Young, roots)?;
        // SAFETY: the cell was just handed to us exclusively
        unsafe { ptr::write_bytes(addr as *mut u8, 0, size) };
        Ok(Self::non_null(addr))
    }

    /// Allocates and formats an object with `value_slots` null slots
    /// followed by `raw_bytes` zeroed bytes.
    pub fn allocate_object(
        &mut self,
        kind: ObjectKind,
        value_slots: u16,
        raw_bytes: usize,
        roots: &mut dyn RootProvider,
    ) -> Result<Value, HeapError> {
        self.allocate_formatted(kind, value_slots, raw_bytes, Placement::Young, roots)
    }

    /// Like [`allocate_object`](Self::allocate_object), directly in the old
    /// space. Stores of young references into it need the write barrier.
    pub fn allocate_tenured(
        &mut self,
        kind: ObjectKind,
        value_slots: u16,
        raw_bytes: usize,
        roots: &mut dyn RootProvider,
    ) -> Result<Value, HeapError> {
        self.allocate_formatted(kind, value_slots, raw_bytes, Placement::Tenured, roots)
    }

    fn allocate_formatted(
        &mut self,
        kind: ObjectKind,
        value_slots: u16,
        raw_bytes: usize,
        placement: Placement,
        roots: &mut dyn RootProvider,
    ) -> Result<Value, HeapError> {
        debug_assert!(value_slots as usize >= kind.weak_slots());
        let size = object_allocation_size(value_slots as usize, raw_bytes);
        let addr = self.allocate_raw(size, placement, roots)?;
        // SAFETY: the cell was just handed to us exclusively
        unsafe {
            ptr::write_bytes(addr as *mut u8, 0, size);
            init_object(addr as *mut u8, kind, value_slots, size);
        }
        Ok(Value::from_addr(addr))
    }

    #[inline(always)]
    fn non_null(addr: usize) -> NonNull<u8> {
        match NonNull::new(addr as *mut u8) {
            Some(ptr) => ptr,
            None => invariant_violation(format_args!("allocator returned a null cell"), None),
        }
    }

    #[inline(always)]
    fn allocate_raw(
        &mut self,
        size: usize,
        placement: Placement,
        roots: &mut dyn RootProvider,
    ) -> Result<usize, HeapError> {
        loop {
            match self.try_allocate(size, placement) {
                Ok(addr) => return Ok(addr),
                Err(AllocError::CollectionPending) => self.safepoint(roots),
                Err(AllocError::NeedsCollection { .. }) => return self.allocate_slow(size, placement, roots),
            }
        }
    }

    #[cold]
    #[inline(never)]
    fn allocate_slow(
        &mut self,
        size: usize,
        placement: Placement,
        roots: &mut dyn RootProvider,
    ) -> Result<usize, HeapError> {
        let attempts = self.heap.settings.max_collection_attempts;
        for attempt in 0..=attempts {
            self.safepoint(roots);
            if let Ok(addr) = self.try_allocate(size, placement) {
                return Ok(addr);
            }
            if attempt == attempts {
                break;
            }
            // a nursery refill failure first tries the cheap collection
            let requested = if attempt == 0
                && placement == Placement::Young
                && size < self.heap.settings.large_object_threshold
            {
                GcStatus::MinorRequested
            } else {
                GcStatus::MajorRequested
            };
            self.execute_gc_with_reason(requested, CollectionReason::Allocation, roots);
        }
        log::warn!("out of memory allocating {size} bytes after {attempts} collections");
        Err(HeapError::OutOfMemory { requested: size })
    }

    fn try_allocate(&mut self, size: usize, placement: Placement) -> Result<usize, AllocError> {
        let settings = &self.heap.settings;
        let addr = if placement == Placement::Tenured || size >= settings.large_object_threshold {
            let addr = self.heap.old_alloc.allocate(size)?;
            self.heap.rset.fot().set(addr, size);
            addr
        } else if size > settings.tlab_size / 2 {
            self.poll_collection()?;
            self.heap.nursery.allocate(size)?
        } else {
            match self.tlab.allocate(size) {
                Some(addr) => addr,
                None => self.refill_tlab(size)?,
            }
        };
        self.allocated += size;
        Ok(addr)
    }

    fn refill_tlab(&mut self, size: usize) -> Result<usize, AllocError> {
        self.poll_collection()?;
        let tlab_size = self.heap.settings.tlab_size;
        self.tlab.retire();
        let start = self.heap.nursery.allocate(tlab_size)?;
        self.tlab.reset(start, start + tlab_size);
        self.tlab
            .allocate(size)
            .ok_or(AllocError::NeedsCollection { requested: size })
    }

    /// Nursery space is only taken while no collection is pending.
    #[inline(always)]
    fn poll_collection(&self) -> Result<(), AllocError> {
        if self.heap.sync.state.snapshot().is_collecting() {
            return Err(AllocError::CollectionPending);
        }
        Ok(())
    }

    /// Joins a collection some other thread requested, if any.
    #[inline(never)]
    pub fn safepoint(&mut self, roots: &mut dyn RootProvider) {
        if self.heap.sync.state.snapshot().is_collecting() {
            self.tlab.retire();
            let root_set = RootSet::collect(roots);
            self.heap.rendezvous(false, root_set, CollectionReason::Requested);
        }
    }

    /// Runs a collection of at least `kind` now.
    pub fn collect(&mut self, kind: CollectionKind, roots: &mut dyn RootProvider) {
        self.execute_gc_with_reason(kind.into(), CollectionReason::Requested, roots);
    }

    #[cold]
    fn execute_gc_with_reason(
        &mut self,
        requested: GcStatus,
        reason: CollectionReason,
        roots: &mut dyn RootProvider,
    ) {
        self.tlab.retire();
        let request = self.heap.sync.state.request(requested);
        let root_set = RootSet::collect(roots);
        self.heap.rendezvous(request.is_coordinator(), root_set, reason);
    }

    // ── Write barrier ─────────────────────────────────────────────────

    /// Records a reference store into slot `index` of `source`.
    #[inline(always)]
    pub fn write_barrier(&self, source: Value, index: usize) {
        debug_assert!(source.is_ref());
        self.heap.record(source.addr(), Object::slot_offset(index));
    }

    /// Stores `value` into slot `index` of `target` and records the store.
    ///
    /// # Safety
    ///
    /// `target` must refer to a live object with more than `index` slots.
    #[inline(always)]
    pub unsafe fn store(&self, target: Value, index: usize, value: Value) {
        // SAFETY: forwarded to caller
        unsafe { Object::at(target.addr()).set_slot(index, value) };
        if value.is_ref() {
            self.write_barrier(target, index);
        }
    }
}

impl Drop for HeapProxy {
    fn drop(&mut self) {
        self.tlab.retire();
        // still counted as a participant until deregistered, so running
        // collections are joined as a ghost without roots
        while !self.heap.sync.state.try_deregister_thread() {
            self.heap
                .rendezvous(false, RootSet::default(), CollectionReason::Requested);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
