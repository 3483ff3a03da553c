use crate::{Header, Value, WORD_SIZE};

/// What occupies a heap cell, decoded from its first word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
    /// A live-format object; the value is its size in bytes.
    Object(usize),
    /// An evacuated object; the value is the address of its copy.
    Forwarded(usize),
    /// Dead space (free chunk or dark matter); the value is its size in
    /// bytes.
    Filler(usize),
}

/// Decodes the first word of the cell at `addr`.
///
/// # Safety
///
/// `addr` must be the start of an object, a forwarded object or a filler.
#[inline(always)]
pub unsafe fn classify(addr: usize) -> Cell {
    // SAFETY: caller guarantees addr is a cell start
    let word = Value::from_raw(unsafe { *(addr as *const u64) });
    if word.is_header() {
        // SAFETY: header tag checked
        Cell::Object(unsafe { header_at(addr) }.size())
    } else if word.is_ref() {
        Cell::Forwarded(word.addr())
    } else {
        Cell::Filler(word.raw() as usize)
    }
}

/// Number of bytes the cell at `addr` occupies. Forwarded cells report the
/// size of their copy, which is identical to the original.
///
/// # Safety
///
/// Same as [`classify`]; a forwarded cell's copy must be initialized.
#[inline(always)]
pub unsafe fn cell_size(addr: usize) -> usize {
    // SAFETY: forwarded to caller
    match unsafe { classify(addr) } {
        Cell::Object(size) | Cell::Filler(size) => size,
        // SAFETY: the copy carries the original header
        Cell::Forwarded(to) => unsafe { header_at(to) }.size(),
    }
}

/// # Safety
///
/// `addr` must point to an initialized object header.
#[inline(always)]
pub unsafe fn header_at<'a>(addr: usize) -> &'a Header {
    // SAFETY: forwarded to caller
    unsafe { &*(addr as *const Header) }
}

/// Writes the size word of a filler spanning `size` bytes at `addr`.
///
/// Only the first word is touched: this is the dark-matter format, and the
/// first word of the free-chunk format.
///
/// # Safety
///
/// `[addr, addr + size)` must be writable dead space.
#[inline(always)]
pub unsafe fn write_filler(addr: usize, size: usize) {
    debug_assert!(size >= WORD_SIZE && size.is_multiple_of(WORD_SIZE));
    // SAFETY: forwarded to caller
    unsafe { (addr as *mut u64).write(size as u64) };
}

/// Returns the forwarding address if the object at `addr` was evacuated.
///
/// # Safety
///
/// `addr` must be an object start.
#[inline(always)]
pub unsafe fn forwarding_address(addr: usize) -> Option<usize> {
    // SAFETY: forwarded to caller
    match unsafe { classify(addr) } {
        Cell::Forwarded(to) => Some(to),
        _ => None,
    }
}

/// Replaces the header of the object at `addr` with a forwarding value to
/// `to`. A forwarding value is installed at most once.
///
/// # Safety
///
/// `addr` must be an unforwarded object start; `to` must hold its copy.
#[inline(always)]
pub unsafe fn install_forwarding(addr: usize, to: usize) {
    // SAFETY: forwarded to caller
    debug_assert!(
        unsafe { forwarding_address(addr) }.is_none(),
        "object at 0x{addr:x} forwarded twice"
    );
    // SAFETY: forwarded to caller
    unsafe { (addr as *mut u64).write(Value::from_addr(to).raw()) };
}
