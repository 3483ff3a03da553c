mod cell;
mod header;
mod objects;
mod value;

pub use cell::{
    Cell, cell_size, classify, forwarding_address, header_at, install_forwarding,
    write_filler,
};
pub use header::{Header, ObjectKind};
pub use objects::{
    EPHEMERON_KEY, EPHEMERON_VALUE, Object, WEAK_REFERENT, init_object,
    object_allocation_size,
};
pub use value::Value;

/// Size of a heap word. Every cell is word aligned and a whole number of
/// words long.
pub const WORD_SIZE: usize = 8;

/// Smallest object: a header plus one word, so that an object's color bit
/// pair never overlaps the next object's.
pub const MIN_OBJECT_SIZE: usize = 2 * WORD_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    // ── Value tagging ──────────────────────────────────────────────

    #[test]
    fn fixnum_round_trip() {
        for &n in &[0i64, 1, -1, 42, -42, i64::MAX >> 1, i64::MIN >> 1] {
            let v = Value::from_i64(n);
            assert!(v.is_fixnum());
            assert!(!v.is_ref());
            assert!(!v.is_header());
            assert_eq!(unsafe { v.to_i64() }, n);
        }
    }

    #[test]
    fn null_is_zero_bits() {
        assert_eq!(Value::NULL.raw(), 0);
        assert!(Value::NULL.is_null());
        assert!(!Value::NULL.is_ref());
    }

    #[test]
    fn ref_tagging() {
        let dummy: u64 = 0;
        let ptr = &dummy as *const u64;
        let v = Value::from_ptr(ptr);
        assert!(v.is_ref());
        assert!(!v.is_fixnum());
        assert!(!v.is_header());
        assert_eq!(v.addr(), ptr as usize);
    }

    #[test]
    fn header_tag_detected() {
        let hdr = Header::new(ObjectKind::Slots, 1, 16);
        let v = Value::from_raw(hdr.word());
        assert!(v.is_header());
        assert!(!v.is_fixnum());
        assert!(!v.is_ref());
    }

    // ── Header ─────────────────────────────────────────────────────

    #[test]
    fn header_fields() {
        for (i, &kind) in [
            ObjectKind::Slots,
            ObjectKind::ByteArray,
            ObjectKind::WeakRef,
            ObjectKind::Ephemeron,
        ]
        .iter()
        .enumerate()
        {
            let h = Header::new(kind, 2, 64);
            assert_eq!(h.kind(), kind, "kind mismatch at index {i}");
            assert_eq!(h.value_slots(), 2);
            assert_eq!(h.size(), 64);
            assert_eq!(h.size_words(), 8);
        }
    }

    // ── Cells ──────────────────────────────────────────────────────

    #[test]
    fn classify_object_filler_and_forwarded() {
        let mut from = [0u64; 4];
        let mut to = [0u64; 4];
        let from_addr = from.as_mut_ptr() as usize;
        let to_addr = to.as_mut_ptr() as usize;

        unsafe {
            init_object(from_addr as *mut u8, ObjectKind::Slots, 2, 32);
            assert_eq!(classify(from_addr), Cell::Object(32));

            core::ptr::copy_nonoverlapping(from_addr as *const u8, to_addr as *mut u8, 32);
            install_forwarding(from_addr, to_addr);
            assert_eq!(classify(from_addr), Cell::Forwarded(to_addr));
            assert_eq!(forwarding_address(from_addr), Some(to_addr));
            assert_eq!(cell_size(from_addr), 32);

            write_filler(from_addr, 24);
            assert_eq!(classify(from_addr), Cell::Filler(24));
            assert_eq!(cell_size(from_addr), 24);
        }
    }

    // ── Objects ────────────────────────────────────────────────────

    #[test]
    fn allocation_sizes() {
        assert_eq!(object_allocation_size(0, 0), MIN_OBJECT_SIZE);
        assert_eq!(object_allocation_size(1, 0), 16);
        assert_eq!(object_allocation_size(3, 0), 32);
        assert_eq!(object_allocation_size(1, 3), 24);
    }

    #[test]
    fn weak_prefix_is_not_strong() {
        let mut mem = [0u64; 4];
        let addr = mem.as_mut_ptr() as usize;
        unsafe {
            init_object(addr as *mut u8, ObjectKind::Ephemeron, 3, 32);
            assert_eq!(Object::at(addr).strong_slots_mut().len(), 1);
            init_object(addr as *mut u8, ObjectKind::WeakRef, 1, 16);
            assert!(Object::at(addr).strong_slots_mut().is_empty());
            init_object(addr as *mut u8, ObjectKind::Slots, 3, 32);
            assert_eq!(Object::at(addr).strong_slots_mut().len(), 3);
        }
    }

    #[test]
    fn slots_read_write() {
        let mut mem = [0xFFu64; 6];
        let addr = mem.as_mut_ptr() as usize;
        unsafe {
            init_object(addr as *mut u8, ObjectKind::Slots, 3, 48);
            let obj = Object::at(addr);
            assert!(obj.slots().iter().all(|v| v.is_null()));
            obj.set_slot(1, Value::from_i64(7));
            assert_eq!(obj.slot(1).to_i64(), 7);
            assert_eq!(obj.raw_bytes().len(), 16);
            assert_eq!(Object::slot_offset(1), 16);
        }
    }
}
