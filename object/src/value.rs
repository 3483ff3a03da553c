/// Tag constants.
const FIXNUM_MASK: u64 = 0b1;
const TAG_MASK: u64 = 0b11;
const REF_TAG: u64 = 0b01;
const HEADER_TAG: u64 = 0b11;

/// A tagged 64-bit value.
///
/// | low bits | meaning                                           |
/// |----------|---------------------------------------------------|
/// | `x0`     | 63-bit signed fixnum                              |
/// | `01`     | object address, word aligned                      |
/// | `11`     | header word, first word of an object only         |
///
/// The all-zero word is fixnum `0` and doubles as the null reference.
/// In header position the same tags mean something else: a reference is a
/// forwarding value and a fixnum-tagged word is the size word of a filler
/// (see [`crate::Cell`]).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    pub const NULL: Self = Self(0);

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    // ── Fixnum ─────────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_fixnum(self) -> bool {
        self.0 & FIXNUM_MASK == 0
    }

    #[inline(always)]
    pub fn from_i64(n: i64) -> Self {
        debug_assert!(
            (-(1i64 << 62)..(1i64 << 62)).contains(&n),
            "fixnum overflow: {n}"
        );
        Self((n << 1) as u64)
    }

    /// # Safety
    ///
    /// The value must be a fixnum.
    #[inline(always)]
    pub unsafe fn to_i64(self) -> i64 {
        debug_assert!(self.is_fixnum());
        (self.0 as i64) >> 1
    }

    // ── Reference ──────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_ref(self) -> bool {
        self.0 & TAG_MASK == REF_TAG
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::from_addr(ptr as usize)
    }

    #[inline(always)]
    pub fn from_addr(addr: usize) -> Self {
        let addr = addr as u64;
        debug_assert!(addr & TAG_MASK == 0, "pointer not aligned");
        Self(addr | REF_TAG)
    }

    #[inline(always)]
    pub const fn ref_bits(self) -> u64 {
        self.0 & !TAG_MASK
    }

    /// Address of the referenced object.
    #[inline(always)]
    pub const fn addr(self) -> usize {
        self.ref_bits() as usize
    }

    #[inline(always)]
    pub const fn is_header(self) -> bool {
        self.0 & TAG_MASK == HEADER_TAG
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::NULL
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_fixnum() {
            // SAFETY: checked above
            write!(f, "Fixnum({})", unsafe { self.to_i64() })
        } else if self.is_ref() {
            write!(f, "Ref(0x{:x})", self.ref_bits())
        } else {
            write!(f, "Header(0x{:016x})", self.0)
        }
    }
}
