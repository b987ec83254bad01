use std::fmt;
use std::ptr::NonNull;

use bitflags::bitflags;

use crate::arena::{ARENA_MASK, CELL_SHIFT};

/// The category of a managed object.
///
/// The set of categories is closed: the collector needs to know which
/// objects can hold references, which ones are containers that re-grey on
/// mutation, and which ones are interned strings.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum ObjKind {
    /// An interned string. Leaf.
    Str = 0,
    /// A captured variable with a single outgoing slot.
    Upval,
    /// A coroutine or execution stack.
    Thread,
    /// A function prototype.
    Proto,
    /// A closure.
    Func,
    /// A compiled trace.
    Trace,
    /// Foreign data without managed references. Leaf.
    Cdata,
    /// A hash/array table, possibly weak.
    Table,
    /// Host userdata.
    Udata,
}

impl ObjKind {
    /// Returns true for kinds that never reference other objects. Leaves are
    /// marked without being queued for traversal.
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        matches!(self, Self::Str | Self::Cdata)
    }

    /// Returns true for containers with many slots that use the back
    /// barrier instead of the forward barrier.
    #[must_use]
    pub const fn is_aggregate(self) -> bool {
        matches!(self, Self::Table | Self::Thread)
    }
}

/// Size in bytes of the header that starts every object.
pub const HEADER_SIZE: usize = std::mem::size_of::<ObjHeader>();

bitflags! {
    /// Registrations recorded in an object's header.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct ObjFlags: u8 {
        /// The object is in its arena's (or the huge) finalizer registry.
        const FINALIZER = 1 << 0;
        /// The object is in its arena's (or the huge) fixed list.
        const FIXED = 1 << 1;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct ObjHeader {
    pub kind: ObjKind,
    pub flags: ObjFlags,
    reserved: u16,
    pub len: u32,
}

impl ObjHeader {
    pub const fn new(kind: ObjKind, len: u32) -> Self {
        Self {
            kind,
            flags: ObjFlags::empty(),
            reserved: 0,
            len,
        }
    }
}

/// A reference to an object allocated by a [`Heap`](crate::Heap).
///
/// A `GcRef` is a plain address. It does not keep the object alive: the
/// host must report every reference it holds through
/// [`Host::enumerate_roots`](crate::Host::enumerate_roots) or
/// [`Host::traverse`](crate::Host::traverse).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GcRef(NonNull<u8>);

impl GcRef {
    pub(crate) const fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Returns the address of the object's header.
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Returns the address as an integer.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Returns a pointer to the first byte after the object header.
    #[must_use]
    pub fn payload(self) -> NonNull<u8> {
        // SAFETY: every object is at least as large as its header, so the
        // payload pointer stays within (or one past) the allocation.
        unsafe { NonNull::new_unchecked(self.0.as_ptr().add(HEADER_SIZE)) }
    }

    /// Huge blocks are aligned to the arena size; arena objects never start
    /// at offset 0 of their arena because cell 0 is metadata.
    pub(crate) fn is_huge(self) -> bool {
        self.addr() & ARENA_MASK == 0
    }

    pub(crate) fn arena_base(self) -> usize {
        self.addr() & !ARENA_MASK
    }

    pub(crate) fn cell(self) -> u32 {
        ((self.addr() & ARENA_MASK) >> CELL_SHIFT) as u32
    }

    /// # Safety
    ///
    /// `self` must reference an allocated object.
    pub(crate) unsafe fn header(self) -> ObjHeader {
        self.0.as_ptr().cast::<ObjHeader>().read()
    }

    /// # Safety
    ///
    /// `self` must reference an allocated object.
    pub(crate) unsafe fn write_header(self, header: ObjHeader) {
        self.0.as_ptr().cast::<ObjHeader>().write(header);
    }

    /// # Safety
    ///
    /// `self` must reference an allocated object.
    pub(crate) unsafe fn kind(self) -> ObjKind {
        self.header().kind
    }

    /// # Safety
    ///
    /// `self` must reference an allocated object.
    pub(crate) unsafe fn flags(self) -> ObjFlags {
        self.header().flags
    }

    /// # Safety
    ///
    /// `self` must reference an allocated object.
    pub(crate) unsafe fn set_flags(self, flags: ObjFlags, value: bool) {
        let mut header = self.header();
        header.flags.set(flags, value);
        self.write_header(header);
    }

    /// # Safety
    ///
    /// `self` must reference an allocated object whose payload length is
    /// up to date, and the returned slice must not outlive it.
    pub(crate) unsafe fn payload_bytes<'a>(self) -> &'a [u8] {
        std::slice::from_raw_parts(self.payload().as_ptr(), self.header().len as usize)
    }
}

impl fmt::Debug for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcRef({:p})", self.0)
    }
}

/// Rounds `size` up to a multiple of the cell size.
pub(crate) const fn round_to_cells(size: usize) -> usize {
    (size + (1 << CELL_SHIFT) - 1) >> CELL_SHIFT
}

#[test]
fn header_fits_in_one_cell() {
    assert_eq!(HEADER_SIZE, 8);
    assert_eq!(round_to_cells(1), 1);
    assert_eq!(round_to_cells(16), 1);
    assert_eq!(round_to_cells(17), 2);
}
