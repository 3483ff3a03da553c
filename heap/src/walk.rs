//! Cell-by-cell heap walks and the verification built on them.

use std::ops::Range;

use object::{Cell, Object, Value, WORD_SIZE, classify, header_at};

use crate::error::invariant_violation;

/// Calls `visit` for every cell starting in `range`, in address order.
///
/// # Safety
///
/// `range.start` must be a cell start and every cell up to `range.end`
/// must be formatted (object, forwarded object or filler).
pub unsafe fn walk_cells(range: Range<usize>, mut visit: impl FnMut(usize, Cell)) {
    let mut addr = range.start;
    while addr < range.end {
        // SAFETY: forwarded to caller
        let cell = unsafe { classify(addr) };
        let size = match cell {
            Cell::Object(size) | Cell::Filler(size) => size,
            // SAFETY: a forwarded cell's copy carries the original header
            Cell::Forwarded(to) => unsafe { header_at(to) }.size(),
        };
        if size == 0 || !size.is_multiple_of(WORD_SIZE) {
            invariant_violation(
                format_args!("unparsable cell {cell:?} at 0x{addr:x}"),
                Some(addr..addr + 4 * WORD_SIZE),
            );
        }
        visit(addr, cell);
        addr += size;
    }
}

/// Calls `visit` for every strong value slot of the object at `addr` whose
/// address lies in `bounds`.
///
/// # Safety
///
/// `addr` must be an initialized, unforwarded object.
pub unsafe fn for_each_strong_slot(
    addr: usize,
    bounds: &Range<usize>,
    mut visit: impl FnMut(&mut Value),
) {
    // SAFETY: forwarded to caller
    let object = unsafe { Object::at(addr) };
    // SAFETY: the header describes the slots
    for slot in unsafe { object.strong_slots_mut() } {
        let slot_addr = slot as *mut Value as usize;
        if bounds.contains(&slot_addr) {
            visit(slot);
        }
    }
}

/// What a walk over some range found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Census {
    pub objects: usize,
    pub object_bytes: usize,
    pub forwarded: usize,
    pub filler_bytes: usize,
}

/// Counts the cells in `range`.
///
/// # Safety
///
/// Same as [`walk_cells`].
pub unsafe fn census(range: Range<usize>) -> Census {
    let mut census = Census::default();
    // SAFETY: forwarded to caller
    unsafe {
        walk_cells(range, |_, cell| match cell {
            Cell::Object(size) => {
                census.objects += 1;
                census.object_bytes += size;
            }
            Cell::Forwarded(_) => census.forwarded += 1,
            Cell::Filler(size) => census.filler_bytes += size,
        });
    }
    census
}

/// Walks `range` and checks that every reference held by an object points
/// at an unforwarded object for which `is_object` holds.
///
/// # Safety
///
/// Same as [`walk_cells`].
pub unsafe fn verify_references(range: Range<usize>, is_object: impl Fn(usize) -> bool) -> usize {
    let mut checked = 0;
    let mut cells = Vec::new();
    // SAFETY: forwarded to caller
    unsafe {
        walk_cells(range, |addr, cell| {
            if matches!(cell, Cell::Object(_)) {
                cells.push(addr);
            }
        });
    }
    for addr in cells {
        // SAFETY: collected as an object above
        let object = unsafe { Object::at(addr) };
        // SAFETY: weak slots are checked too, they must not dangle either
        for (index, value) in unsafe { object.slots() }.iter().enumerate() {
            if !value.is_ref() {
                continue;
            }
            let target = value.addr();
            // SAFETY: only dereferenced after the predicate accepted it
            let valid = is_object(target) && matches!(unsafe { classify(target) }, Cell::Object(_));
            if !valid {
                invariant_violation(
                    format_args!("slot {index} of 0x{addr:x} dangles to 0x{target:x}"),
                    Some(addr..addr + object.size()),
                );
            }
            checked += 1;
        }
    }
    checked
}

#[cfg(test)]
mod tests {
    use object::{ObjectKind, init_object, install_forwarding, write_filler};

    use super::*;

    #[test]
    fn walk_steps_over_every_cell_kind() {
        let mut mem = [0u64; 16];
        let mut copy = [0u64; 4];
        let base = mem.as_mut_ptr() as usize;
        let to = copy.as_mut_ptr() as usize;
        unsafe {
            init_object(base as *mut u8, ObjectKind::Slots, 2, 32);
            write_filler(base + 32, 24);
            init_object((base + 56) as *mut u8, ObjectKind::ByteArray, 0, 32);
            std::ptr::copy_nonoverlapping((base + 56) as *const u8, to as *mut u8, 32);
            install_forwarding(base + 56, to);
            write_filler(base + 88, 40);

            let census = census(base..base + 128);
            assert_eq!(
                census,
                Census {
                    objects: 1,
                    object_bytes: 32,
                    forwarded: 1,
                    filler_bytes: 64,
                }
            );
        }
    }

    #[test]
    fn strong_slots_are_clipped_to_bounds() {
        let mut mem = [0u64; 8];
        let base = mem.as_mut_ptr() as usize;
        unsafe {
            init_object(base as *mut u8, ObjectKind::Ephemeron, 5, 48);
            let mut seen = Vec::new();
            // slots 2..5 are strong; bounds keep slots 3 and 4 only
            let bounds = base + Object::slot_offset(3)..base + 48;
            for_each_strong_slot(base, &bounds, |slot| seen.push(slot as *mut Value as usize));
            assert_eq!(
                seen,
                vec![base + Object::slot_offset(3), base + Object::slot_offset(4)]
            );
        }
    }

    #[test]
    fn references_to_objects_verify() {
        let mut mem = [0u64; 8];
        let base = mem.as_mut_ptr() as usize;
        unsafe {
            init_object(base as *mut u8, ObjectKind::Slots, 1, 16);
            init_object((base + 16) as *mut u8, ObjectKind::Slots, 1, 16);
            Object::at(base).set_slot(0, Value::from_addr(base + 16));
            Object::at(base + 16).set_slot(0, Value::from_i64(3));
            write_filler(base + 32, 32);
            let range = base..base + 64;
            assert_eq!(verify_references(range.clone(), |a| range.contains(&a)), 1);
        }
    }

    #[test]
    #[should_panic(expected = "dangles")]
    fn reference_into_filler_is_caught() {
        let mut mem = [0u64; 8];
        let base = mem.as_mut_ptr() as usize;
        unsafe {
            init_object(base as *mut u8, ObjectKind::Slots, 1, 16);
            write_filler(base + 16, 48);
            Object::at(base).set_slot(0, Value::from_addr(base + 16));
            let range = base..base + 64;
            verify_references(range.clone(), |a| range.contains(&a));
        }
    }
}
