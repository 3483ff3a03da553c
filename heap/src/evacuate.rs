//! Copying live nursery objects into the old space.
//!
//! Every reachable object is copied once into the collector's promotion
//! buffer and its header replaced by a forwarding value, so later
//! references resolve to the same copy. Copies are recorded as survivor
//! ranges and scanned breadth-first until no new copies appear.

use std::{collections::VecDeque, ops::Range, ptr};

use object::{
    Cell, EPHEMERON_KEY, EPHEMERON_VALUE, Object, ObjectKind, Value, WEAK_REFERENT, classify,
    install_forwarding,
};

use crate::{
    alloc::{ChunkListAllocator, ChunkListRefill},
    error::invariant_violation,
    rset::{CardTableRSet, FirstObjectTable},
    walk::{for_each_strong_slot, walk_cells},
};

/// Counters of one evacuation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvacuationStats {
    pub objects: usize,
    pub bytes: usize,
    /// Old objects visited on dirty cards.
    pub remembered: usize,
    /// Contiguous copied ranges scanned.
    pub survivor_ranges: usize,
    /// Weak referents and ephemeron keys left behind and cleared.
    pub weak_cleared: usize,
}

#[derive(Debug)]
pub struct Evacuator<'a, R: ChunkListRefill> {
    /// The space being evacuated.
    from: Range<usize>,
    buffer: &'a mut ChunkListAllocator<R>,
    fot: &'a FirstObjectTable,
    survivors: VecDeque<Range<usize>>,
    /// Weak references and ephemerons outside `from` that may refer into it.
    weak_objects: Vec<usize>,
    stats: EvacuationStats,
    verbose: bool,
}

impl<'a, R: ChunkListRefill> Evacuator<'a, R> {
    /// Starts an evacuation of `from` into `buffer`, which must not be
    /// holding a partly used chunk list.
    pub fn new(
        from: Range<usize>,
        buffer: &'a mut ChunkListAllocator<R>,
        fot: &'a FirstObjectTable,
    ) -> Self {
        buffer.retire();
        Self {
            from,
            buffer,
            fot,
            survivors: VecDeque::new(),
            weak_objects: Vec::new(),
            stats: EvacuationStats::default(),
            verbose: false,
        }
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    #[inline(always)]
    pub fn is_young(&self, addr: usize) -> bool {
        self.from.contains(&addr)
    }

    #[inline(always)]
    pub fn stats(&self) -> EvacuationStats {
        self.stats
    }

    /// Address of the copy of the object at `addr`, copying it first if
    /// this is the first reference seen.
    ///
    /// # Safety
    ///
    /// `addr` must be an object start in the evacuated space.
    pub unsafe fn forward(&mut self, addr: usize) -> usize {
        debug_assert!(self.is_young(addr));
        // SAFETY: forwarded to caller
        let size = match unsafe { classify(addr) } {
            Cell::Forwarded(to) => return to,
            Cell::Object(size) => size,
            Cell::Filler(_) => invariant_violation(
                format_args!("reference to dead space at 0x{addr:x}"),
                Some(addr..addr + 2 * object::WORD_SIZE),
            ),
        };

        let copy = match self.buffer.allocate(size) {
            Ok(copy) => copy,
            Err(err) => invariant_violation(
                format_args!("promotion buffer exhausted while evacuating 0x{addr:x}: {err}"),
                None,
            ),
        };
        // SAFETY: the buffer handed out `size` fresh bytes
        unsafe {
            ptr::copy_nonoverlapping(addr as *const u8, copy as *mut u8, size);
            install_forwarding(addr, copy);
        }
        self.fot.set(copy, size);
        if self.verbose {
            log::trace!("evacuated 0x{addr:x} -> 0x{copy:x} ({size} bytes)");
        }

        match self.survivors.back_mut() {
            Some(last) if last.end == copy => last.end = copy + size,
            _ => self.survivors.push_back(copy..copy + size),
        }
        // SAFETY: the copy carries the original header
        if unsafe { Object::at(copy) }.kind().has_weak_slots() {
            self.weak_objects.push(copy);
        }
        self.stats.objects += 1;
        self.stats.bytes += size;
        copy
    }

    /// Redirects `slot` to the copy of the young object it refers to.
    ///
    /// # Safety
    ///
    /// A reference in `slot` into the evacuated space must point at an
    /// object start.
    #[inline]
    pub unsafe fn evacuate_slot(&mut self, slot: &mut Value) {
        if slot.is_ref() && self.is_young(slot.addr()) {
            // SAFETY: forwarded to caller
            *slot = Value::from_addr(unsafe { self.forward(slot.addr()) });
        }
    }

    /// Cleans the dirty cards of `ranges` and evacuates what the objects on
    /// them refer to. Only slots on the dirty cards are examined.
    ///
    /// # Safety
    ///
    /// Every range must be parsable old-space memory recorded in the
    /// first-object table, and the buffer must not have allocated yet.
    pub unsafe fn evacuate_remembered(&mut self, rset: &CardTableRSet, ranges: &[Range<usize>]) {
        let mut work: Vec<(usize, Range<usize>)> = Vec::new();
        for range in ranges {
            // SAFETY: forwarded to caller
            unsafe {
                rset.clean_and_visit_cards(range.clone(), &mut |addr, bounds| {
                    work.push((addr, bounds));
                });
            }
        }
        self.stats.remembered += work.len();
        for (addr, bounds) in work {
            // SAFETY: collected as an object start
            let object = unsafe { Object::at(addr) };
            if object.kind().has_weak_slots() && !self.weak_objects.contains(&addr) {
                self.weak_objects.push(addr);
            }
            let mut slots = Vec::new();
            // SAFETY: as above
            unsafe { for_each_strong_slot(addr, &bounds, |slot| slots.push(slot as *mut Value)) };
            for slot in slots {
                // SAFETY: slot points into a live old object
                unsafe { self.evacuate_slot(&mut *slot) };
            }
        }
    }

    /// Scans survivor ranges until no copy is left unscanned.
    pub fn drain(&mut self) {
        while let Some(range) = self.survivors.pop_front() {
            self.stats.survivor_ranges += 1;
            let mut objects = Vec::new();
            // SAFETY: survivor ranges hold contiguous copies
            unsafe { walk_cells(range.clone(), |addr, _| objects.push(addr)) };
            for addr in objects {
                // SAFETY: as above
                let object = unsafe { Object::at(addr) };
                // SAFETY: the header describes the slots
                for slot in unsafe { object.strong_slots_mut() } {
                    // SAFETY: copies only refer to object starts
                    unsafe { self.evacuate_slot(slot) };
                }
            }
        }
    }

    /// Whether `value` still refers to something after the evacuation.
    #[inline(always)]
    fn survives(&self, value: Value) -> bool {
        if !value.is_ref() || !self.is_young(value.addr()) {
            return true;
        }
        // SAFETY: references into the evacuated space are object starts
        matches!(unsafe { classify(value.addr()) }, Cell::Forwarded(_))
    }

    /// Keeps ephemeron values whose keys survived until nothing changes,
    /// then clears what died and redirects what moved.
    pub fn process_weak(&mut self) {
        let mut resolved = vec![false; self.weak_objects.len()];
        loop {
            let mut changed = false;
            for (index, &addr) in self.weak_objects.iter().enumerate() {
                // SAFETY: weak objects are live, unforwarded objects
                let object = unsafe { Object::at(addr) };
                if resolved[index] || object.kind() != ObjectKind::Ephemeron {
                    continue;
                }
                // SAFETY: ephemerons hold a key and a value slot
                let key = unsafe { object.slot(EPHEMERON_KEY) };
                if self.survives(key) {
                    resolved[index] = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            for (index, &addr) in self.weak_objects.clone().iter().enumerate() {
                if !resolved[index] {
                    continue;
                }
                // SAFETY: as above
                let object = unsafe { Object::at(addr) };
                // SAFETY: as above
                let mut value = unsafe { object.slot(EPHEMERON_VALUE) };
                // SAFETY: slot values are object references
                unsafe { self.evacuate_slot(&mut value) };
                // SAFETY: as above
                unsafe { object.set_slot(EPHEMERON_VALUE, value) };
            }
            self.drain();
            resolved.resize(self.weak_objects.len(), false);
        }

        for addr in std::mem::take(&mut self.weak_objects) {
            // SAFETY: as above
            let object = unsafe { Object::at(addr) };
            let slot = match object.kind() {
                ObjectKind::WeakRef => WEAK_REFERENT,
                _ => EPHEMERON_KEY,
            };
            // SAFETY: weak objects have their weak slots
            let referent = unsafe { object.slot(slot) };
            if !referent.is_ref() || !self.is_young(referent.addr()) {
                continue;
            }
            // SAFETY: references into the evacuated space are object starts
            match unsafe { classify(referent.addr()) } {
                // SAFETY: as above
                Cell::Forwarded(to) => unsafe { object.set_slot(slot, Value::from_addr(to)) },
                _ => {
                    // SAFETY: as above
                    unsafe { object.set_slot(slot, Value::NULL) };
                    if object.kind() == ObjectKind::Ephemeron {
                        // SAFETY: as above
                        unsafe { object.set_slot(EPHEMERON_VALUE, Value::NULL) };
                    }
                    self.stats.weak_cleared += 1;
                }
            }
        }
    }

    /// Makes the buffer's unused tail parsable and returns the counters.
    pub fn finish(self) -> EvacuationStats {
        debug_assert!(self.survivors.is_empty(), "finished with unscanned survivors");
        self.buffer.retire();
        self.stats
    }
}
