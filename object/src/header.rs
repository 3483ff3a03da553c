/// Object kind stored in bits 2..7 of the header's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    /// Ordinary object: every value slot is a strong edge.
    Slots = 0,
    /// Raw bytes only, no value slots.
    ByteArray,
    /// Slot 0 is a weak referent, remaining slots are strong.
    WeakRef,
    /// Slot 0 is the key (weak), slot 1 the value, kept alive only while
    /// the key is reachable. Remaining slots are strong.
    Ephemeron,
}

impl ObjectKind {
    pub const COUNT: usize = Self::Ephemeron as usize + 1;

    #[inline(always)]
    pub const fn has_weak_slots(self) -> bool {
        matches!(self, ObjectKind::WeakRef | ObjectKind::Ephemeron)
    }

    /// Number of leading value slots the collector must not trace strongly.
    #[inline(always)]
    pub const fn weak_slots(self) -> usize {
        match self {
            ObjectKind::WeakRef => 1,
            ObjectKind::Ephemeron => 2,
            ObjectKind::Slots | ObjectKind::ByteArray => 0,
        }
    }
}

const HEADER_TAG: u8 = 0b11;

/// The 8-byte header at the start of every heap object.
///
/// ```text
/// byte 0:    [tag:2 = 0b11] [kind:6]
/// byte 1:    reserved (zero)
/// bytes 2‥3: number of value slots following the header (u16)
/// bytes 4‥7: total object size in words, header included (u32)
/// ```
///
/// On little-endian systems, reading these 8 bytes as a `u64` yields a
/// value whose low 2 bits are `0b11`, which [`Value::is_header`](crate::Value::is_header)
/// detects.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Header {
    tag_and_kind: u8,
    _reserved: u8,
    value_slots: u16,
    size_words: u32,
}

const _: () = assert!(size_of::<Header>() == 8);

impl Header {
    /// Builds a header for an object of `size` bytes whose first
    /// `value_slots` words after the header hold [`Value`](crate::Value)s.
    pub fn new(kind: ObjectKind, value_slots: u16, size: usize) -> Self {
        debug_assert!(size.is_multiple_of(crate::WORD_SIZE), "unaligned size {size}");
        debug_assert!(size >= crate::MIN_OBJECT_SIZE, "object too small: {size}");
        debug_assert!(
            (value_slots as usize + 1) * crate::WORD_SIZE <= size,
            "value slots exceed object size"
        );
        debug_assert!(
            kind != ObjectKind::WeakRef || value_slots >= 1,
            "weak reference needs a referent slot"
        );
        debug_assert!(
            kind != ObjectKind::Ephemeron || value_slots >= 2,
            "ephemeron needs key and value slots"
        );
        Self {
            tag_and_kind: ((kind as u8) << 2) | HEADER_TAG,
            _reserved: 0,
            value_slots,
            size_words: (size / crate::WORD_SIZE) as u32,
        }
    }

    #[inline(always)]
    pub fn kind(&self) -> ObjectKind {
        let raw = self.tag_and_kind >> 2;
        debug_assert!((raw as usize) < ObjectKind::COUNT);
        // SAFETY: only `Header::new` writes this byte
        unsafe { core::mem::transmute::<u8, ObjectKind>(raw) }
    }

    #[inline(always)]
    pub fn value_slots(&self) -> usize {
        self.value_slots as usize
    }

    #[inline(always)]
    pub fn size_words(&self) -> usize {
        self.size_words as usize
    }

    /// Object size in bytes, header included.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size_words as usize * crate::WORD_SIZE
    }

    #[inline(always)]
    pub fn word(&self) -> u64 {
        // SAFETY: Header is repr(C), 8 bytes, no padding
        unsafe { core::mem::transmute::<Header, u64>(*self) }
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("kind", &self.kind())
            .field("value_slots", &self.value_slots())
            .field("size", &self.size())
            .finish()
    }
}
