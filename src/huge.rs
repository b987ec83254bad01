//! Bookkeeping for allocations too large for an arena.
//!
//! Huge blocks come straight from the global allocator, aligned to
//! [`ARENA_SIZE`] so that they can never be mistaken for arena objects. The
//! table maps each block address to its size, with the mark and grey bits
//! packed into the low bits of the size (sizes are multiples of the cell
//! size).

use std::alloc::{alloc_zeroed, dealloc, realloc, Layout};
use std::ptr::NonNull;

use crate::arena::{ARENA_SHIFT, ARENA_SIZE};

pub(crate) const HUGE_MARK: usize = 1;
pub(crate) const HUGE_GREY: usize = 2;
const FLAG_MASK: usize = 0xF;

const INITIAL_BITS: u32 = 4;
const FIBONACCI: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Clone, Copy, Default)]
struct Slot {
    /// Zero marks an empty slot.
    addr: usize,
    size_flags: usize,
}

/// Open-addressed table of huge blocks with linear probing.
pub(crate) struct HugeTable {
    slots: Box<[Slot]>,
    bits: u32,
    len: usize,
    bytes: usize,
}

impl HugeTable {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot::default(); 1 << INITIAL_BITS].into_boxed_slice(),
            bits: INITIAL_BITS,
            len: 0,
            bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total bytes of all registered blocks.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn bucket(&self, addr: usize) -> usize {
        let key = (addr >> ARENA_SHIFT) as u64;
        (key.wrapping_mul(FIBONACCI) >> (64 - self.bits)) as usize
    }

    fn find(&self, addr: usize) -> Option<usize> {
        debug_assert_ne!(addr, 0);
        let mut index = self.bucket(addr);
        loop {
            match self.slots[index].addr {
                0 => return None,
                found if found == addr => return Some(index),
                _ => index = (index + 1) & self.mask(),
            }
        }
    }

    pub fn insert(&mut self, addr: usize, size: usize) {
        debug_assert_eq!(addr & (ARENA_SIZE - 1), 0);
        debug_assert_eq!(size & FLAG_MASK, 0);
        if (self.len + 1) * 4 > self.slots.len() * 3 {
            self.grow();
        }
        self.place(Slot {
            addr,
            size_flags: size,
        });
        self.len += 1;
        self.bytes += size;
    }

    fn place(&mut self, slot: Slot) {
        let mut index = self.bucket(slot.addr);
        while self.slots[index].addr != 0 {
            debug_assert_ne!(self.slots[index].addr, slot.addr);
            index = (index + 1) & self.mask();
        }
        self.slots[index] = slot;
    }

    fn grow(&mut self) {
        self.bits += 1;
        let old = std::mem::replace(
            &mut self.slots,
            vec![Slot::default(); 1 << self.bits].into_boxed_slice(),
        );
        for slot in old.iter().filter(|slot| slot.addr != 0) {
            self.place(*slot);
        }
    }

    /// Unregisters `addr`, returning its size.
    pub fn remove(&mut self, addr: usize) -> Option<usize> {
        let mut hole = self.find(addr)?;
        let size = self.slots[hole].size_flags & !FLAG_MASK;
        let mask = self.mask();
        let mut next = (hole + 1) & mask;
        while self.slots[next].addr != 0 {
            let ideal = self.bucket(self.slots[next].addr);
            if next.wrapping_sub(ideal) & mask >= next.wrapping_sub(hole) & mask {
                self.slots[hole] = self.slots[next];
                hole = next;
            }
            next = (next + 1) & mask;
        }
        self.slots[hole] = Slot::default();
        self.len -= 1;
        self.bytes -= size;
        Some(size)
    }

    /// Re-keys a block that moved or changed size.
    pub fn replace(&mut self, old: usize, addr: usize, size: usize) {
        let flags = self.flags(old);
        self.remove(old);
        self.insert(addr, size);
        self.set_flags(addr, flags);
    }

    pub fn size(&self, addr: usize) -> Option<usize> {
        self.find(addr)
            .map(|index| self.slots[index].size_flags & !FLAG_MASK)
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.find(addr).is_some()
    }

    pub fn flags(&self, addr: usize) -> usize {
        self.find(addr)
            .map_or(0, |index| self.slots[index].size_flags & FLAG_MASK)
    }

    pub fn set_flags(&mut self, addr: usize, flags: usize) {
        if let Some(index) = self.find(addr) {
            self.slots[index].size_flags |= flags & FLAG_MASK;
        }
    }

    pub fn clear_flags(&mut self, addr: usize, flags: usize) {
        if let Some(index) = self.find(addr) {
            self.slots[index].size_flags &= !(flags & FLAG_MASK);
        }
    }

    /// Unregisters every block without a mark and clears the flags of the
    /// survivors. Returns the dead blocks as `(addr, size)` pairs; releasing
    /// their memory is up to the caller.
    pub fn sweep(&mut self) -> Vec<(usize, usize)> {
        let mut dead = Vec::new();
        for slot in self.slots.iter_mut().filter(|slot| slot.addr != 0) {
            if slot.size_flags & HUGE_MARK == 0 {
                dead.push((slot.addr, slot.size_flags & !FLAG_MASK));
            }
            slot.size_flags &= !FLAG_MASK;
        }
        for &(addr, _) in &dead {
            self.remove(addr);
        }
        dead
    }

    pub fn blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.slots
            .iter()
            .filter(|slot| slot.addr != 0)
            .map(|slot| (slot.addr, slot.size_flags & !FLAG_MASK))
    }
}

fn block_layout(size: usize) -> Option<Layout> {
    Layout::from_size_align(size, ARENA_SIZE).ok()
}

/// Allocates zeroed memory for a huge block.
pub(crate) fn alloc_block(size: usize) -> Option<NonNull<u8>> {
    let layout = block_layout(size)?;
    // SAFETY: huge blocks are never zero-sized.
    NonNull::new(unsafe { alloc_zeroed(layout) })
}

/// # Safety
///
/// `ptr` must have been returned by [`alloc_block`] or [`realloc_block`]
/// with `size`, and not freed since.
pub(crate) unsafe fn free_block(ptr: NonNull<u8>, size: usize) {
    if let Some(layout) = block_layout(size) {
        dealloc(ptr.as_ptr(), layout);
    }
}

/// Resizes a huge block, zeroing any new tail. The block may move.
///
/// # Safety
///
/// Same as [`free_block`] for `ptr` and `old`.
pub(crate) unsafe fn realloc_block(ptr: NonNull<u8>, old: usize, new: usize) -> Option<NonNull<u8>> {
    let layout = block_layout(old)?;
    block_layout(new)?;
    let moved = NonNull::new(realloc(ptr.as_ptr(), layout, new))?;
    if new > old {
        moved.as_ptr().add(old).write_bytes(0, new - old);
    }
    Some(moved)
}
