//! Fixed-size arenas of 16-byte cells with bitmap liveness.
//!
//! Every arena is `ARENA_SIZE` bytes and aligned to its size, so the arena
//! owning any interior address is found by masking. The first
//! [`FIRST_CELL`] cells hold two bitmaps with one bit per cell:
//!
//! | block | mark | state  |
//! |-------|------|--------|
//! | 0     | 0    | Extent |
//! | 0     | 1    | Free   |
//! | 1     | 0    | White  |
//! | 1     | 1    | Black  |
//!
//! An object's head cell has its block bit set. The cells following it up
//! to the next set bit in either bitmap are its extent, so the length of an
//! object is recovered from the bitmaps rather than stored.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::slice;

use bitflags::bitflags;
use intentional::Cast;

use crate::error::AllocError;
use crate::finalize::{FinalizerList, Selection};
use crate::freelist::FreeList;
use crate::grey::GreyStack;
use crate::object::{GcRef, ObjFlags};

/// Size in bytes of every arena.
pub const ARENA_SIZE: usize = 1 << ARENA_SHIFT;
pub(crate) const ARENA_SHIFT: u32 = 20;
/// Mask selecting an address's offset within its arena.
pub const ARENA_MASK: usize = ARENA_SIZE - 1;
/// Size in bytes of the allocation granule.
pub const CELL_SIZE: usize = 1 << CELL_SHIFT;
pub(crate) const CELL_SHIFT: u32 = 4;
/// Number of cells in an arena, metadata included.
pub const ARENA_CELLS: u32 = (ARENA_SIZE / CELL_SIZE) as u32;
const BITMAP_WORDS: usize = ARENA_CELLS as usize / 64;
const BITMAP_BYTES: usize = BITMAP_WORDS * 8;
/// First cell id usable for objects. Lower cells hold the bitmaps.
pub const FIRST_CELL: u32 = (2 * BITMAP_BYTES / CELL_SIZE) as u32;
/// Cells available for objects in one arena.
pub const USABLE_CELLS: u32 = ARENA_CELLS - FIRST_CELL;
const FIRST_WORD: usize = FIRST_CELL as usize / 64;

pub(crate) type CellId = u32;

/// The state of a cell as encoded by its block and mark bits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CellState {
    /// Continuation of the preceding allocation.
    Extent,
    /// Head of a free run.
    Free,
    /// Head of an allocated object not (yet) reached in this cycle.
    White,
    /// Head of an allocated object reached in this cycle.
    Black,
}

impl CellState {
    const fn from_bits(block: bool, mark: bool) -> Self {
        match (block, mark) {
            (false, false) => Self::Extent,
            (false, true) => Self::Free,
            (true, false) => Self::White,
            (true, true) => Self::Black,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct ArenaFlags: u8 {
        /// No objects remain; the arena can be reused or released.
        const EMPTY = 1 << 0;
        /// The arena has not been swept yet in the current cycle.
        const NEEDS_SWEEP = 1 << 1;
    }
}

/// A copyable handle to an arena's memory.
///
/// Single-bit operations go through raw pointers so they can be used while
/// other parts of the owning [`Arena`] are borrowed.
#[derive(Clone, Copy)]
pub(crate) struct CellMemory(NonNull<u8>);

impl CellMemory {
    fn block_word(self, cell: CellId) -> *mut u64 {
        debug_assert!(cell < ARENA_CELLS);
        // SAFETY: the block bitmap occupies the first BITMAP_BYTES of the
        // arena and `cell >> 6` is below BITMAP_WORDS.
        unsafe { self.0.as_ptr().cast::<u64>().add((cell >> 6) as usize) }
    }

    fn mark_word(self, cell: CellId) -> *mut u64 {
        debug_assert!(cell < ARENA_CELLS);
        // SAFETY: the mark bitmap follows the block bitmap.
        unsafe {
            self.0
                .as_ptr()
                .cast::<u64>()
                .add(BITMAP_WORDS + (cell >> 6) as usize)
        }
    }

    pub fn block_bit(self, cell: CellId) -> bool {
        // SAFETY: see `block_word`.
        unsafe { *self.block_word(cell) >> (cell & 63) & 1 != 0 }
    }

    pub fn mark_bit(self, cell: CellId) -> bool {
        // SAFETY: see `mark_word`.
        unsafe { *self.mark_word(cell) >> (cell & 63) & 1 != 0 }
    }

    fn update(word: *mut u64, cell: CellId, set: bool) {
        // SAFETY: callers pass pointers from `block_word`/`mark_word`.
        unsafe {
            if set {
                *word |= 1 << (cell & 63);
            } else {
                *word &= !(1 << (cell & 63));
            }
        }
    }

    pub fn set_block(self, cell: CellId, set: bool) {
        Self::update(self.block_word(cell), cell, set);
    }

    pub fn set_mark(self, cell: CellId, set: bool) {
        Self::update(self.mark_word(cell), cell, set);
    }

    pub fn cell_ptr(self, cell: CellId) -> NonNull<u8> {
        debug_assert!((FIRST_CELL..ARENA_CELLS).contains(&cell));
        // SAFETY: `cell` is within the arena.
        unsafe { NonNull::new_unchecked(self.0.as_ptr().add((cell as usize) << CELL_SHIFT)) }
    }

    pub fn object(self, cell: CellId) -> GcRef {
        GcRef::new(self.cell_ptr(cell))
    }

    /// Reads the free-list link stored in a free run's head cell. The link
    /// lives past the object header so a stale header stays readable.
    pub fn read_link(self, cell: CellId) -> CellId {
        // SAFETY: free runs are at least one cell (16 bytes) long.
        unsafe { self.cell_ptr(cell).as_ptr().add(8).cast::<u32>().read() }
    }

    pub fn write_link(self, cell: CellId, next: CellId) {
        // SAFETY: free runs are at least one cell (16 bytes) long.
        unsafe {
            self.cell_ptr(cell).as_ptr().add(8).cast::<u32>().write(next);
        }
    }
}

/// Tests the mark bit of an arena object through address arithmetic only.
///
/// # Safety
///
/// `object` must be an arena object of a live arena.
pub(crate) unsafe fn mark_bit_of(object: GcRef) -> bool {
    let cell = object.cell();
    let word = (object.arena_base() + BITMAP_BYTES) as *const u64;
    *word.add((cell >> 6) as usize) >> (cell & 63) & 1 != 0
}

/// Reads the owning index stored in an arena's metadata.
///
/// # Safety
///
/// `object` must be an arena object of a live arena.
pub(crate) unsafe fn arena_index_of(object: GcRef) -> usize {
    (object.arena_base() as *const u64).read().cast::<usize>()
}

pub(crate) struct Arena {
    mem: CellMemory,
    celltop: CellId,
    used: u32,
    pub free_list: FreeList,
    pub grey: GreyStack,
    pub finalizers: FinalizerList,
    pub fixed: Vec<CellId>,
    pub flags: ArenaFlags,
}

impl Arena {
    fn layout() -> Layout {
        // SAFETY: ARENA_SIZE is a non-zero power of two.
        unsafe { Layout::from_size_align_unchecked(ARENA_SIZE, ARENA_SIZE) }
    }

    pub fn new(index: u32) -> Result<Box<Self>, AllocError> {
        // SAFETY: the layout has a non-zero size.
        let base = NonNull::new(unsafe { alloc_zeroed(Self::layout()) })
            .ok_or(AllocError::OutOfMemory { size: ARENA_SIZE })?;
        let mut arena = Box::new(Self {
            mem: CellMemory(base),
            celltop: FIRST_CELL,
            used: 0,
            free_list: FreeList::new(FIRST_CELL),
            grey: GreyStack::new(),
            finalizers: FinalizerList::default(),
            fixed: Vec::new(),
            flags: ArenaFlags::EMPTY,
        });
        arena.set_index(index);
        Ok(arena)
    }

    /// The first bitmap word only covers metadata cells, so it stores the
    /// arena's index in the heap instead.
    pub fn set_index(&mut self, index: u32) {
        self.block_words_mut()[0] = u64::from(index);
    }

    #[cfg(test)]
    pub fn index(&self) -> u32 {
        self.block_words()[0].cast::<u32>()
    }

    pub fn base(&self) -> usize {
        self.mem.0.as_ptr() as usize
    }

    #[cfg(test)]
    pub fn memory(&self) -> CellMemory {
        self.mem
    }

    pub fn object(&self, cell: CellId) -> GcRef {
        self.mem.object(cell)
    }

    #[cfg(test)]
    pub fn celltop(&self) -> CellId {
        self.celltop
    }

    pub fn used_bytes(&self) -> usize {
        (self.used as usize) << CELL_SHIFT
    }

    fn block_words(&self) -> &[u64] {
        // SAFETY: the block bitmap is the first BITMAP_BYTES of the arena,
        // which is u64 aligned and owned by `self`.
        unsafe { slice::from_raw_parts(self.mem.0.as_ptr().cast::<u64>(), BITMAP_WORDS) }
    }

    fn block_words_mut(&mut self) -> &mut [u64] {
        // SAFETY: see `block_words`.
        unsafe { slice::from_raw_parts_mut(self.mem.0.as_ptr().cast::<u64>(), BITMAP_WORDS) }
    }

    fn words(&self) -> (&[u64], &[u64]) {
        let base = self.mem.0.as_ptr().cast::<u64>();
        // SAFETY: the bitmaps are adjacent and disjoint.
        unsafe {
            (
                slice::from_raw_parts(base, BITMAP_WORDS),
                slice::from_raw_parts(base.add(BITMAP_WORDS), BITMAP_WORDS),
            )
        }
    }

    fn words_mut(&mut self) -> (&mut [u64], &mut [u64]) {
        let base = self.mem.0.as_ptr().cast::<u64>();
        // SAFETY: the bitmaps are adjacent and disjoint.
        unsafe {
            (
                slice::from_raw_parts_mut(base, BITMAP_WORDS),
                slice::from_raw_parts_mut(base.add(BITMAP_WORDS), BITMAP_WORDS),
            )
        }
    }

    /// Number of bitmap words covering the cells below `celltop`.
    fn live_words(&self) -> usize {
        (self.celltop as usize).div_ceil(64)
    }

    pub fn cell_state(&self, cell: CellId) -> CellState {
        CellState::from_bits(self.mem.block_bit(cell), self.mem.mark_bit(cell))
    }

    pub fn is_marked(&self, cell: CellId) -> bool {
        self.mem.mark_bit(cell)
    }

    pub fn is_allocated(&self, cell: CellId) -> bool {
        cell >= FIRST_CELL && cell < self.celltop && self.mem.block_bit(cell)
    }

    pub fn set_mark(&mut self, cell: CellId) {
        self.mem.set_mark(cell, true);
    }

    pub fn clear_mark(&mut self, cell: CellId) {
        self.mem.set_mark(cell, false);
    }

    /// Finds the first cell in `from..limit` for which `select(block, mark)`
    /// has its bit set.
    fn scan(&self, from: CellId, limit: CellId, select: impl Fn(u64, u64) -> u64) -> Option<CellId> {
        let (block, mark) = self.words();
        let mut cell = from;
        while cell < limit {
            let word = (cell >> 6) as usize;
            let bits = select(block[word], mark[word]) >> (cell & 63);
            if bits != 0 {
                let found = cell + bits.trailing_zeros();
                return (found < limit).then_some(found);
            }
            cell = (cell | 63) + 1;
        }
        None
    }

    fn next_boundary(&self, from: CellId) -> CellId {
        self.scan(from, self.celltop, |block, mark| block | mark)
            .unwrap_or(self.celltop)
    }

    /// Recovers the length in cells of the allocation headed by `head`.
    pub fn object_cells(&self, head: CellId) -> u32 {
        debug_assert!(self.is_allocated(head));
        self.next_boundary(head + 1) - head
    }

    /// Allocates `cells` contiguous cells, bumping first and falling back to
    /// the free list. `black` allocates the object already marked.
    pub fn alloc(&mut self, cells: u32, black: bool) -> Option<CellId> {
        let head = if self.celltop + cells <= ARENA_CELLS {
            let head = self.celltop;
            self.celltop += cells;
            head
        } else {
            let (head, run) = self.free_list.take(self.mem, cells)?;
            if run > cells {
                let tail = head + cells;
                self.mem.set_mark(tail, true);
                self.free_list.push(self.mem, tail, run - cells);
            }
            head
        };
        self.mem.set_block(head, true);
        self.mem.set_mark(head, black);
        self.used += cells;
        self.flags.remove(ArenaFlags::EMPTY);
        Some(head)
    }

    /// Returns the object headed by `head` to the free list and answers the
    /// number of cells released.
    pub fn free(&mut self, head: CellId) -> u32 {
        let cells = self.object_cells(head);
        self.mem.set_block(head, false);
        if head + cells == self.celltop {
            self.mem.set_mark(head, false);
            self.celltop = head;
        } else {
            self.mem.set_mark(head, true);
            self.free_list.push(self.mem, head, cells);
        }
        self.used -= cells;
        cells
    }

    /// Bulk sweep: survivors become white and dead heads become free, one
    /// bitmap word at a time. Returns true if any object survived.
    pub fn major_sweep(&mut self) -> bool {
        let end = self.live_words();
        let (block, mark) = self.words_mut();
        let mut live = 0;
        for (block, mark) in block[FIRST_WORD..end]
            .iter_mut()
            .zip(&mut mark[FIRST_WORD..end])
        {
            let (b, m) = (*block, *mark);
            *block = b & m;
            *mark = b ^ m;
            live |= *block;
        }
        self.flags.remove(ArenaFlags::NEEDS_SWEEP);
        self.free_list.lower_hint(FIRST_CELL);
        live != 0
    }

    /// Generational variant of [`Self::major_sweep`] that keeps survivors
    /// black.
    #[allow(dead_code)] // generational promotion is experimental and not wired in
    pub fn minor_sweep(&mut self) -> bool {
        let end = self.live_words();
        let (block, mark) = self.words_mut();
        let mut live = 0;
        for (block, mark) in block[FIRST_WORD..end]
            .iter_mut()
            .zip(&mut mark[FIRST_WORD..end])
        {
            let (b, m) = (*block, *mark);
            *block = b & m;
            *mark = b | m;
            live |= *block;
        }
        self.flags.remove(ArenaFlags::NEEDS_SWEEP);
        self.free_list.lower_hint(FIRST_CELL);
        live != 0
    }

    /// Turns every black object white. Only valid while no white objects
    /// exist, e.g. right after a minor sweep.
    #[allow(dead_code)] // generational promotion is experimental and not wired in
    pub fn flip_to_white(&mut self) {
        let end = self.live_words();
        let (block, mark) = self.words_mut();
        for (block, mark) in block[FIRST_WORD..end].iter().zip(&mut mark[FIRST_WORD..end]) {
            *mark ^= *block;
        }
    }

    /// Rebuilds the free list from the bitmaps after a sweep. Adjacent free
    /// runs are coalesced and a run reaching `celltop` is handed back to the
    /// bump region. Returns the number of free cells found.
    pub fn harvest(&mut self) -> u32 {
        let mut cursor = self.free_list.hint().max(FIRST_CELL);
        self.free_list.clear(self.celltop);
        let mut free_cells = 0;
        let mut top = self.celltop;
        while let Some(head) = self.scan(cursor, top, |block, mark| mark & !block) {
            let mut end = self.next_boundary(head + 1);
            while end < top && !self.mem.block_bit(end) {
                self.mem.set_mark(end, false);
                end = self.next_boundary(end + 1);
            }
            if end >= top {
                self.mem.set_mark(head, false);
                top = head;
                break;
            }
            self.free_list.push(self.mem, head, end - head);
            free_cells += end - head;
            cursor = end;
        }
        self.celltop = top;
        self.used = top - FIRST_CELL - free_cells;
        free_cells
    }

    /// Forgets every object, returning the arena to its freshly allocated
    /// state.
    pub fn reset(&mut self) {
        debug_assert!(self.grey.is_empty());
        debug_assert!(self.finalizers.is_empty());
        let end = self.live_words();
        let (block, mark) = self.words_mut();
        block[FIRST_WORD..end].fill(0);
        mark[FIRST_WORD..end].fill(0);
        self.celltop = FIRST_CELL;
        self.used = 0;
        self.free_list.clear(FIRST_CELL);
        self.fixed.clear();
        self.flags = ArenaFlags::EMPTY;
    }

    /// Splits finalizer registrations after marking: marked objects stay
    /// registered, unmarked finalizable ones become pending and are reported
    /// through `doomed`, the rest are forgotten.
    pub fn select_finalizers(
        &mut self,
        mut finalizable: impl FnMut(GcRef) -> bool,
        doomed: &mut Vec<GcRef>,
    ) {
        let mem = self.mem;
        self.finalizers.select(|cell| {
            if mem.mark_bit(cell) {
                Selection::Keep
            } else if finalizable(mem.object(cell)) {
                doomed.push(mem.object(cell));
                Selection::Pending
            } else {
                // SAFETY: registered cells head allocated objects.
                unsafe { mem.object(cell).set_flags(ObjFlags::FINALIZER, false) };
                Selection::Forget
            }
        });
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: the memory was allocated in `Arena::new` with this layout.
        unsafe { dealloc(self.mem.0.as_ptr(), Self::layout()) };
    }
}
