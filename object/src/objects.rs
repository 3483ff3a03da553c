use crate::header::{Header, ObjectKind};
use crate::{MIN_OBJECT_SIZE, Value, WORD_SIZE};

/// A heap object viewed through its header.
///
/// ```text
/// [Header 8B] [value_0 8B] ... [value_{n-1} 8B] [raw bytes ...]
/// ```
///
/// The header says how many value slots follow it; everything after them
/// up to `header.size()` is opaque to the collector.
#[repr(C)]
pub struct Object {
    pub header: Header,
}

const _: () = assert!(size_of::<Object>() == 8);

impl Object {
    /// Byte offset of value slot `index` from the object start.
    #[inline(always)]
    pub const fn slot_offset(index: usize) -> usize {
        (index + 1) * WORD_SIZE
    }

    /// # Safety
    ///
    /// `addr` must be the start of an initialized, unforwarded object.
    #[inline(always)]
    pub unsafe fn at<'a>(addr: usize) -> &'a mut Object {
        // SAFETY: forwarded to caller
        unsafe { &mut *(addr as *mut Object) }
    }

    #[inline(always)]
    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }

    #[inline(always)]
    pub fn kind(&self) -> ObjectKind {
        self.header.kind()
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.header.size()
    }

    /// # Safety
    ///
    /// The inline memory must hold `header.value_slots()` values.
    #[inline(always)]
    pub unsafe fn slots(&self) -> &[Value] {
        let ptr = (self as *const Object).wrapping_add(1) as *const Value;
        // SAFETY: forwarded to caller
        unsafe { core::slice::from_raw_parts(ptr, self.header.value_slots()) }
    }

    /// # Safety
    ///
    /// The inline memory must hold `header.value_slots()` values.
    #[inline(always)]
    pub unsafe fn slots_mut(&mut self) -> &mut [Value] {
        let ptr = (self as *mut Object).wrapping_add(1) as *mut Value;
        // SAFETY: forwarded to caller
        unsafe { core::slice::from_raw_parts_mut(ptr, self.header.value_slots()) }
    }

    /// The value slots traced as strong edges: every slot except the weak
    /// prefix of weak references and ephemerons.
    ///
    /// # Safety
    ///
    /// Same as [`Object::slots_mut`].
    #[inline(always)]
    pub unsafe fn strong_slots_mut(&mut self) -> &mut [Value] {
        let weak = self.kind().weak_slots();
        // SAFETY: forwarded to caller
        let slots = unsafe { self.slots_mut() };
        let weak = weak.min(slots.len());
        &mut slots[weak..]
    }

    /// # Safety
    ///
    /// `index < header.value_slots()`.
    #[inline(always)]
    pub unsafe fn slot(&self, index: usize) -> Value {
        debug_assert!(index < self.header.value_slots());
        // SAFETY: forwarded to caller
        unsafe { *self.slots().as_ptr().add(index) }
    }

    /// # Safety
    ///
    /// `index < header.value_slots()`.
    #[inline(always)]
    pub unsafe fn set_slot(&mut self, index: usize, value: Value) {
        debug_assert!(index < self.header.value_slots());
        // SAFETY: forwarded to caller
        unsafe { *self.slots_mut().as_mut_ptr().add(index) = value };
    }

    /// The raw payload after the value slots.
    ///
    /// # Safety
    ///
    /// The object must be fully allocated.
    #[inline(always)]
    pub unsafe fn raw_bytes(&mut self) -> &mut [u8] {
        let start = Self::slot_offset(self.header.value_slots());
        let len = self.header.size() - start;
        // SAFETY: forwarded to caller
        unsafe {
            core::slice::from_raw_parts_mut((self as *mut Object as *mut u8).add(start), len)
        }
    }
}

impl core::fmt::Debug for Object {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Object")
            .field("addr", &format_args!("0x{:x}", self.addr()))
            .field("header", &self.header)
            .finish()
    }
}

/// Slot holding a weak reference's referent.
pub const WEAK_REFERENT: usize = 0;
/// Slot holding an ephemeron's key.
pub const EPHEMERON_KEY: usize = 0;
/// Slot holding an ephemeron's value.
pub const EPHEMERON_VALUE: usize = 1;

/// Total allocation size of an object with `value_slots` values and
/// `raw_bytes` opaque bytes, rounded to words and to the minimum object
/// size.
pub const fn object_allocation_size(value_slots: usize, raw_bytes: usize) -> usize {
    let size = WORD_SIZE + value_slots * WORD_SIZE + raw_bytes;
    let size = (size + WORD_SIZE - 1) & !(WORD_SIZE - 1);
    if size < MIN_OBJECT_SIZE { MIN_OBJECT_SIZE } else { size }
}

/// Writes a header at `ptr` and nulls every value slot.
///
/// # Safety
///
/// `ptr` must point to at least `size` writable bytes.
pub unsafe fn init_object(ptr: *mut u8, kind: ObjectKind, value_slots: u16, size: usize) {
    // SAFETY: forwarded to caller
    unsafe {
        (ptr as *mut Header).write(Header::new(kind, value_slots, size));
        let slots = ptr.add(WORD_SIZE) as *mut Value;
        for i in 0..value_slots as usize {
            slots.add(i).write(Value::NULL);
        }
    }
}
