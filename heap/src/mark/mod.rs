//! Tricolor marking over a color map.
//!
//! Roots are greyed first. A forward scan then moves a finger from the
//! leftmost to the rightmost grey object, blackening each and greying its
//! white referents: referents ahead of the finger are only greyed in the
//! map, referents behind it are also pushed on a bounded stack that is
//! drained before the finger moves on. A full stack is flushed and the map
//! is rescanned from the leftmost flushed object up to the finger.

mod color_map;
mod stack;

use std::ops::Range;

pub use color_map::ColorMap;
use object::{EPHEMERON_KEY, EPHEMERON_VALUE, Object, ObjectKind, Value, WEAK_REFERENT, header_at};
pub use stack::MarkingStack;

use crate::{
    error::invariant_violation,
    region::{RegionId, RegionTable},
};

/// Counters of one trace.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MarkStats {
    pub objects: usize,
    pub bytes: usize,
    /// Times the marking stack filled up.
    pub overflows: usize,
    /// Overflow rescans of the color map.
    pub rescans: usize,
    /// Weak referents and ephemeron keys found dead and cleared.
    pub weak_cleared: usize,
}

#[derive(Debug)]
pub struct TricolorMarker {
    map: ColorMap,
    stack: MarkingStack,
    /// Start of the object the forward scan is visiting.
    finger: usize,
    /// Rightmost object ever greyed.
    rightmost: Option<usize>,
    /// Leftmost object flushed from the stack since the last rescan.
    overflow_from: Option<usize>,
    /// Black weak references and ephemerons.
    weak_objects: Vec<usize>,
    stats: MarkStats,
    verbose: bool,
}

impl TricolorMarker {
    pub fn new(covered: Range<usize>, stack_capacity: usize) -> Self {
        Self {
            finger: covered.start,
            map: ColorMap::new(covered),
            stack: MarkingStack::new(stack_capacity),
            rightmost: None,
            overflow_from: None,
            weak_objects: Vec::new(),
            stats: MarkStats::default(),
            verbose: false,
        }
    }

    /// Logs every blackened object at `trace` level.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    #[inline(always)]
    pub fn covered(&self) -> Range<usize> {
        self.map.covered()
    }

    #[inline(always)]
    pub fn color_map(&self) -> &ColorMap {
        &self.map
    }

    /// Forgets the previous trace.
    pub fn reset(&mut self) {
        self.map.clear();
        self.finger = self.map.covered().start;
        self.rightmost = None;
        self.overflow_from = None;
        self.weak_objects.clear();
        self.stats = MarkStats::default();
    }

    /// Whether the object at `addr` survived the last trace. Objects outside
    /// the covered range are not judged and count as live.
    #[inline(always)]
    pub fn is_live(&self, addr: usize) -> bool {
        !self.map.covers(addr) || self.map.is_marked(addr)
    }

    /// Greys the object `root` refers to.
    pub fn mark_root(&mut self, root: Value) {
        if !root.is_ref() || !self.map.covers(root.addr()) {
            return;
        }
        let addr = root.addr();
        if self.map.is_white(addr) {
            self.map.mark_grey(addr);
            self.note_grey(addr);
        }
    }

    #[inline(always)]
    fn note_grey(&mut self, addr: usize) {
        self.rightmost = Some(self.rightmost.map_or(addr, |r| r.max(addr)));
    }

    #[inline(always)]
    fn size_of(addr: usize) -> usize {
        // SAFETY: only marked objects are asked for, and they are objects
        unsafe { header_at(addr) }.size()
    }

    fn grey_reference(&mut self, target: usize) {
        if !self.map.covers(target) || !self.map.is_white(target) {
            return;
        }
        self.map.mark_grey(target);
        self.note_grey(target);
        if target > self.finger {
            return;
        }
        if !self.stack.push(target) {
            let leftmost = self.stack.flush().map_or(target, |l| l.min(target));
            self.overflow_from = Some(self.overflow_from.map_or(leftmost, |o| o.min(leftmost)));
            self.stats.overflows += 1;
            log::debug!("marking stack overflow, rescan from 0x{leftmost:x}");
        }
    }

    fn blacken(&mut self, table: &RegionTable, addr: usize) -> usize {
        // SAFETY: grey marks are only set on object starts
        let object = unsafe { Object::at(addr) };
        let size = object.size();
        self.map.mark_black(addr);
        self.stats.objects += 1;
        self.stats.bytes += size;
        if table.contains(addr) {
            table.descriptor_for(addr).add_live_bytes(size);
        }
        if self.verbose {
            log::trace!("blacken 0x{addr:x} {:?} ({size} bytes)", object.kind());
        }
        if object.kind().has_weak_slots() {
            self.weak_objects.push(addr);
        }
        // SAFETY: the header describes the slots
        for value in unsafe { object.strong_slots_mut() }.iter() {
            if value.is_ref() {
                self.grey_reference(value.addr());
            }
        }
        size
    }

    /// Empties the stack, then rescans below the finger after every
    /// overflow until nothing grey is left there.
    fn drain(&mut self, table: &RegionTable) {
        loop {
            while let Some(addr) = self.stack.pop() {
                if self.map.is_grey(addr) {
                    self.blacken(table, addr);
                }
            }
            let Some(from) = self.overflow_from.take() else {
                return;
            };
            self.stats.rescans += 1;
            let mut cursor = from;
            while let Some(addr) = self.map.next_grey(cursor, self.finger) {
                cursor = addr + self.blacken(table, addr);
                while let Some(pending) = self.stack.pop() {
                    if self.map.is_grey(pending) {
                        self.blacken(table, pending);
                    }
                }
            }
        }
    }

    fn forward_scan(&mut self, table: &RegionTable) {
        let mut cursor = self.map.covered().start;
        while let Some(rightmost) = self.rightmost {
            let Some(addr) = self.map.next_grey(cursor, rightmost + 1) else {
                break;
            };
            self.finger = addr;
            cursor = addr + self.blacken(table, addr);
            self.drain(table);
        }
    }

    fn key_is_live(&self, key: Value) -> bool {
        !key.is_ref() || self.is_live(key.addr())
    }

    /// Ephemeron fixed point, then clears dead weak referents and keys.
    fn process_weak(&mut self, table: &RegionTable) {
        // everything greyed from here on goes through the stack
        self.finger = self.map.covered().end;
        loop {
            let mut progressed = false;
            let mut index = 0;
            while index < self.weak_objects.len() {
                let addr = self.weak_objects[index];
                index += 1;
                // SAFETY: recorded when blackened
                let object = unsafe { Object::at(addr) };
                if object.kind() != ObjectKind::Ephemeron {
                    continue;
                }
                // SAFETY: ephemerons have key and value slots
                let (key, value) =
                    unsafe { (object.slot(EPHEMERON_KEY), object.slot(EPHEMERON_VALUE)) };
                if self.key_is_live(key)
                    && value.is_ref()
                    && self.map.covers(value.addr())
                    && self.map.is_white(value.addr())
                {
                    self.grey_reference(value.addr());
                    progressed = true;
                }
            }
            self.drain(table);
            if !progressed {
                break;
            }
        }

        for index in 0..self.weak_objects.len() {
            let addr = self.weak_objects[index];
            // SAFETY: recorded when blackened
            let object = unsafe { Object::at(addr) };
            match object.kind() {
                ObjectKind::WeakRef => {
                    // SAFETY: weak references have a referent slot
                    let referent = unsafe { object.slot(WEAK_REFERENT) };
                    if !self.key_is_live(referent) {
                        // SAFETY: as above
                        unsafe { object.set_slot(WEAK_REFERENT, Value::NULL) };
                        self.stats.weak_cleared += 1;
                    }
                }
                ObjectKind::Ephemeron => {
                    // SAFETY: ephemerons have key and value slots
                    let key = unsafe { object.slot(EPHEMERON_KEY) };
                    if !self.key_is_live(key) {
                        // SAFETY: as above
                        unsafe {
                            object.set_slot(EPHEMERON_KEY, Value::NULL);
                            object.set_slot(EPHEMERON_VALUE, Value::NULL);
                        }
                        self.stats.weak_cleared += 1;
                    }
                }
                ObjectKind::Slots | ObjectKind::ByteArray => {}
            }
        }
    }

    /// Traces everything reachable from the greyed roots, resolves weak
    /// references and reports what was found. Live-byte estimates of the
    /// covered regions are recomputed.
    pub fn trace(&mut self, table: &RegionTable) -> MarkStats {
        let covered = self.map.covered();
        for (_, descriptor) in table.range(table.ids_covering(covered.clone())) {
            descriptor.reset_live_bytes();
        }

        self.forward_scan(table);
        self.process_weak(table);

        if cfg!(debug_assertions) {
            self.verify();
        }
        log::debug!(
            "marked {} objects ({} bytes), {} overflows, {} weak cleared",
            self.stats.objects,
            self.stats.bytes,
            self.stats.overflows,
            self.stats.weak_cleared
        );
        self.stats
    }

    /// Checks that no grey mark survived and the rightmost object is black.
    pub fn verify(&self) {
        let covered = self.map.covered();
        let grey = self.map.count_grey(covered.clone(), Self::size_of);
        if grey != 0 {
            invariant_violation(
                format_args!("{grey} grey objects remain after tracing"),
                None,
            );
        }
        if let Some(rightmost) = self.rightmost
            && !self.map.is_black(rightmost)
        {
            invariant_violation(
                format_args!("rightmost object 0x{rightmost:x} is not black"),
                Some(rightmost..rightmost + Self::size_of(rightmost)),
            );
        }
    }

    /// Regions among `ids` in which the last trace found live objects.
    pub fn live_regions(&self, table: &RegionTable, ids: Range<RegionId>) -> Vec<RegionId> {
        table
            .range(ids)
            .filter(|(_, descriptor)| descriptor.live_bytes() > 0)
            .map(|(id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use object::{WORD_SIZE, init_object};

    use super::*;

    /// Objects laid out back to back in a word arena covered by one region.
    struct Graph {
        _mem: Vec<u64>,
        table: RegionTable,
        objects: Vec<usize>,
    }

    impl Graph {
        /// `slots[i]` lists the referents of object `i`.
        fn new(slots: &[Vec<usize>]) -> Self {
            let words: usize = slots.iter().map(|s| s.len().max(1) + 1).sum();
            let mut mem = vec![0u64; words + 8];
            let base = (mem.as_mut_ptr() as usize + 63) & !63;
            let mut objects = Vec::with_capacity(slots.len());
            let mut addr = base;
            for s in slots {
                let size = (s.len().max(1) + 1) * WORD_SIZE;
                unsafe { init_object(addr as *mut u8, ObjectKind::Slots, s.len() as u16, size) };
                objects.push(addr);
                addr += size;
            }
            for (i, s) in slots.iter().enumerate() {
                for (slot, &target) in s.iter().enumerate() {
                    unsafe { Object::at(objects[i]).set_slot(slot, Value::from_addr(objects[target])) };
                }
            }
            let table = RegionTable::new(base & !((1 << 20) - 1), 20, 2);
            Self { _mem: mem, table, objects }
        }

        fn end(&self) -> usize {
            let last = *self.objects.last().expect("objects");
            last + unsafe { header_at(last) }.size()
        }

        fn marker(&self, capacity: usize) -> TricolorMarker {
            TricolorMarker::new(self.objects[0]..self.end(), capacity)
        }
    }

    fn reachable(slots: &[Vec<usize>], roots: &[usize]) -> HashSet<usize> {
        let mut seen: HashSet<usize> = roots.iter().copied().collect();
        let mut work: Vec<usize> = roots.to_vec();
        while let Some(i) = work.pop() {
            for &t in &slots[i] {
                if seen.insert(t) {
                    work.push(t);
                }
            }
        }
        seen
    }

    fn check(graph: &Graph, marker: &TricolorMarker, live: &HashSet<usize>) {
        let map = marker.color_map();
        for (i, &addr) in graph.objects.iter().enumerate() {
            if live.contains(&i) {
                assert!(map.is_black(addr), "object {i} should be black");
            } else {
                assert!(map.is_white(addr), "object {i} should be white");
            }
        }
    }

    #[test]
    fn marks_reachable_and_leaves_garbage_white() {
        let slots = vec![vec![2], vec![0], vec![], vec![3, 1], vec![2]];
        let graph = Graph::new(&slots);
        let mut marker = graph.marker(16);
        marker.mark_root(Value::from_addr(graph.objects[4]));
        let stats = marker.trace(&graph.table);
        check(&graph, &marker, &reachable(&slots, &[4]));
        assert_eq!(stats.objects, 2);
        assert_eq!(stats.overflows, 0);
    }

    #[test]
    fn backward_chain_overflows_tiny_stack() {
        // each object points at the previous one, the root is the last
        let n = 64;
        let slots: Vec<Vec<usize>> = (0..n)
            .map(|i| if i == 0 { vec![] } else { vec![i - 1, i / 2] })
            .collect();
        let graph = Graph::new(&slots);
        let mut marker = graph.marker(1);
        marker.mark_root(Value::from_addr(graph.objects[n - 1]));
        let stats = marker.trace(&graph.table);
        check(&graph, &marker, &reachable(&slots, &[n - 1]));
        assert!(stats.overflows > 0);
        assert!(stats.rescans > 0);
        assert_eq!(stats.objects, n);
    }

    #[test]
    fn random_graphs_agree_with_reachability() {
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };
        for round in 0..20 {
            let n = 50 + (next() % 150) as usize;
            let slots: Vec<Vec<usize>> = (0..n)
                .map(|_| {
                    (0..(next() % 4) as usize)
                        .map(|_| (next() % n as u64) as usize)
                        .collect()
                })
                .collect();
            let roots: Vec<usize> = (0..3).map(|_| (next() % n as u64) as usize).collect();
            let graph = Graph::new(&slots);
            let capacity = [1, 2, 8, 1024][round % 4];
            let mut marker = graph.marker(capacity);
            for &r in &roots {
                marker.mark_root(Value::from_addr(graph.objects[r]));
            }
            marker.trace(&graph.table);
            check(&graph, &marker, &reachable(&slots, &roots));
        }
    }

    #[test]
    fn live_bytes_are_recorded_per_region() {
        let graph = Graph::new(&[vec![], vec![]]);
        let mut marker = graph.marker(4);
        marker.mark_root(Value::from_addr(graph.objects[1]));
        marker.trace(&graph.table);
        let region = graph.table.region_id(graph.objects[1]);
        assert_eq!(graph.table.descriptor(region).live_bytes(), 16);
        assert_eq!(marker.live_regions(&graph.table, 0..2), vec![region]);
    }

    fn weak_fixture(kind: ObjectKind, slots: u16) -> (Vec<u64>, RegionTable, usize, usize, usize) {
        let mut mem = vec![0u64; 16];
        let base = mem.as_mut_ptr() as usize;
        let weak = base;
        let key = base + 32;
        let value = base + 48;
        unsafe {
            init_object(weak as *mut u8, kind, slots, 32);
            init_object(key as *mut u8, ObjectKind::Slots, 1, 16);
            init_object(value as *mut u8, ObjectKind::Slots, 1, 16);
            Object::at(weak).set_slot(0, Value::from_addr(key));
            if kind == ObjectKind::Ephemeron {
                Object::at(weak).set_slot(1, Value::from_addr(value));
            }
        }
        let table = RegionTable::new(base & !((1 << 20) - 1), 20, 2);
        (mem, table, weak, key, value)
    }

    #[test]
    fn dead_weak_referent_is_cleared() {
        let (mem, table, weak, key, _) = weak_fixture(ObjectKind::WeakRef, 1);
        let mut marker = TricolorMarker::new(weak..weak + 64, 4);
        marker.mark_root(Value::from_addr(weak));
        let stats = marker.trace(&table);
        assert_eq!(stats.weak_cleared, 1);
        assert!(marker.color_map().is_white(key));
        assert!(unsafe { Object::at(weak).slot(0) }.is_null());
        drop(mem);
    }

    #[test]
    fn ephemeron_value_lives_only_with_its_key() {
        let (mem, table, eph, key, value) = weak_fixture(ObjectKind::Ephemeron, 2);
        let mut marker = TricolorMarker::new(eph..eph + 64, 4);
        marker.mark_root(Value::from_addr(eph));
        marker.mark_root(Value::from_addr(key));
        marker.trace(&table);
        assert!(marker.color_map().is_black(value));
        assert_eq!(unsafe { Object::at(eph).slot(1) }, Value::from_addr(value));

        marker.reset();
        marker.mark_root(Value::from_addr(eph));
        let stats = marker.trace(&table);
        assert!(marker.color_map().is_white(value));
        assert_eq!(stats.weak_cleared, 1);
        assert!(unsafe { Object::at(eph).slot(0) }.is_null());
        assert!(unsafe { Object::at(eph).slot(1) }.is_null());
        drop(mem);
    }
}
