//! All memory owned by a heap: the arenas and the huge blocks.

use std::ptr::NonNull;

use intentional::Cast;
use kempt::Map;
use log::{debug, trace};

use crate::arena::{
    arena_index_of, mark_bit_of, Arena, ArenaFlags, CellState, ARENA_MASK, CELL_SIZE,
};
use crate::error::AllocError;
use crate::huge::{self, HugeTable, HUGE_GREY, HUGE_MARK};
use crate::object::{GcRef, ObjFlags};

/// A queue of objects awaiting traversal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum GreySource {
    Arena(usize),
    Huge,
}

pub(crate) struct Space {
    arenas: Vec<Box<Arena>>,
    by_base: Map<usize, usize>,
    /// The arena new objects are bumped into first.
    current: Option<usize>,
    huge: HugeTable,
    huge_grey: Vec<GcRef>,
    huge_fixed: Vec<GcRef>,
    huge_finalizers: Vec<GcRef>,
    huge_pending: Vec<GcRef>,
    huge_needs_sweep: bool,
    total: usize,
}

impl Space {
    pub fn new() -> Self {
        Self {
            arenas: Vec::new(),
            by_base: Map::new(),
            current: None,
            huge: HugeTable::new(),
            huge_grey: Vec::new(),
            huge_fixed: Vec::new(),
            huge_finalizers: Vec::new(),
            huge_pending: Vec::new(),
            huge_needs_sweep: false,
            total: 0,
        }
    }

    /// Bytes held by allocated objects, dead but unswept ones included.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn arena_count(&self) -> usize {
        self.arenas.len()
    }

    pub fn empty_arenas(&self) -> usize {
        self.arenas
            .iter()
            .filter(|arena| arena.flags.contains(ArenaFlags::EMPTY))
            .count()
    }

    pub fn huge_blocks(&self) -> usize {
        self.huge.len()
    }

    pub fn huge_bytes(&self) -> usize {
        self.huge.bytes()
    }

    pub fn current_arena(&self) -> Option<usize> {
        self.current
    }

    /// Returns true if `addr` is an arena address of this space or the
    /// head of one of its huge blocks. Interior addresses of huge blocks
    /// are not recognized.
    pub fn owns(&self, addr: usize) -> bool {
        if addr & ARENA_MASK == 0 {
            addr != 0 && self.huge.contains(addr)
        } else {
            self.by_base.get(&(addr & !ARENA_MASK)).is_some()
        }
    }

    /// Returns true if `obj` is the head of an allocated object.
    pub fn is_allocated(&self, obj: GcRef) -> bool {
        if obj.is_huge() {
            self.huge.contains(obj.addr())
        } else {
            self.by_base
                .get(&obj.arena_base())
                .map_or(false, |&index| self.arenas[index].is_allocated(obj.cell()))
        }
    }

    fn arena_index(&self, obj: GcRef) -> usize {
        // SAFETY: only arena objects reach this point.
        let index = unsafe { arena_index_of(obj) };
        debug_assert_eq!(
            self.by_base.get(&obj.arena_base()),
            Some(&index),
            "{obj:?} is not in an arena of this heap"
        );
        index
    }

    fn arena(&self, obj: GcRef) -> &Arena {
        &self.arenas[self.arena_index(obj)]
    }

    fn arena_mut(&mut self, obj: GcRef) -> &mut Arena {
        let index = self.arena_index(obj);
        &mut self.arenas[index]
    }

    fn add_arena(&mut self) -> Result<usize, AllocError> {
        let index = self.arenas.len();
        let arena = Arena::new(index.cast::<u32>())?;
        debug!("allocated arena {index} at {:#x}", arena.base());
        self.by_base.insert(arena.base(), index);
        self.arenas.push(arena);
        Ok(index)
    }

    fn alloc_in(&mut self, index: usize, cells: u32) -> Option<GcRef> {
        let arena = &mut self.arenas[index];
        let black = arena.flags.contains(ArenaFlags::NEEDS_SWEEP);
        let cell = arena.alloc(cells, black)?;
        self.total += cells as usize * CELL_SIZE;
        Some(arena.object(cell))
    }

    /// Allocates `cells` cells: from the current arena, then from any arena
    /// with a fitting free run, then from a spare empty arena, and finally
    /// from a new arena.
    pub fn alloc_cells(&mut self, cells: u32) -> Result<GcRef, AllocError> {
        if let Some(index) = self.current {
            if let Some(obj) = self.alloc_in(index, cells) {
                return Ok(obj);
            }
        }
        for spare in [false, true] {
            for index in 0..self.arenas.len() {
                if Some(index) == self.current
                    || self.arenas[index].flags.contains(ArenaFlags::EMPTY) != spare
                {
                    continue;
                }
                if let Some(obj) = self.alloc_in(index, cells) {
                    self.current = Some(index);
                    return Ok(obj);
                }
            }
        }
        let index = self.add_arena()?;
        self.current = Some(index);
        self.alloc_in(index, cells).ok_or(AllocError::TooLarge {
            size: cells as usize * CELL_SIZE,
        })
    }

    pub fn alloc_huge(&mut self, size: usize) -> Result<GcRef, AllocError> {
        let block = huge::alloc_block(size).ok_or(AllocError::OutOfMemory { size })?;
        let addr = block.as_ptr() as usize;
        self.huge.insert(addr, size);
        if self.huge_needs_sweep {
            self.huge.set_flags(addr, HUGE_MARK);
        }
        self.total += size;
        debug!("allocated huge block of {size} bytes at {addr:#x}");
        Ok(GcRef::new(block))
    }

    /// Resizes a huge block to `size` bytes. The block may move; its mark
    /// and registrations move with it.
    pub fn realloc_huge(&mut self, obj: GcRef, size: usize) -> Result<GcRef, AllocError> {
        let old = self.huge.size(obj.addr()).unwrap_or_default();
        debug_assert_ne!(old, 0, "{obj:?} is not a huge block");
        // SAFETY: `obj` is a registered huge block of `old` bytes.
        let block = unsafe { huge::realloc_block(NonNull::new_unchecked(obj.as_ptr()), old, size) }
            .ok_or(AllocError::OutOfMemory { size })?;
        let moved = GcRef::new(block);
        self.huge.replace(obj.addr(), moved.addr(), size);
        for list in [
            &mut self.huge_grey,
            &mut self.huge_fixed,
            &mut self.huge_finalizers,
            &mut self.huge_pending,
        ] {
            for entry in list.iter_mut().filter(|entry| **entry == obj) {
                *entry = moved;
            }
        }
        self.total = self.total - old + size;
        Ok(moved)
    }

    /// Releases `obj` immediately and drops its registrations. Returns the
    /// number of bytes released.
    pub fn free(&mut self, obj: GcRef) -> usize {
        // SAFETY: `obj` is allocated until the end of this function.
        let flags = unsafe { obj.flags() };
        if obj.is_huge() {
            let size = self.huge.remove(obj.addr()).unwrap_or_default();
            debug_assert_ne!(size, 0, "{obj:?} is not a huge block");
            self.huge_grey.retain(|&entry| entry != obj);
            if flags.contains(ObjFlags::FIXED) {
                self.huge_fixed.retain(|&entry| entry != obj);
            }
            if flags.contains(ObjFlags::FINALIZER) {
                self.huge_finalizers.retain(|&entry| entry != obj);
                self.huge_pending.retain(|&entry| entry != obj);
            }
            if size > 0 {
                // SAFETY: the block was registered with this size.
                unsafe { huge::free_block(NonNull::new_unchecked(obj.as_ptr()), size) };
            }
            self.total -= size;
            size
        } else {
            let cell = obj.cell();
            let arena = self.arena_mut(obj);
            if flags.contains(ObjFlags::FIXED) {
                arena.fixed.retain(|&entry| entry != cell);
            }
            if flags.contains(ObjFlags::FINALIZER) {
                arena.finalizers.remove(cell);
            }
            let size = arena.free(cell) as usize * CELL_SIZE;
            self.total -= size;
            size
        }
    }

    /// Bytes occupied by `obj`, recovered from the bitmaps or the huge
    /// table.
    pub fn object_size(&self, obj: GcRef) -> usize {
        if obj.is_huge() {
            self.huge.size(obj.addr()).unwrap_or_default()
        } else {
            self.arena(obj).object_cells(obj.cell()) as usize * CELL_SIZE
        }
    }

    pub fn cell_state(&self, obj: GcRef) -> CellState {
        if obj.is_huge() {
            if self.huge.flags(obj.addr()) & HUGE_MARK == 0 {
                CellState::White
            } else {
                CellState::Black
            }
        } else {
            self.arena(obj).cell_state(obj.cell())
        }
    }

    pub fn is_marked(&self, obj: GcRef) -> bool {
        if obj.is_huge() {
            self.huge.flags(obj.addr()) & HUGE_MARK != 0
        } else {
            debug_assert!(self.arena(obj).is_allocated(obj.cell()));
            // SAFETY: `obj` is an arena object of this space.
            unsafe { mark_bit_of(obj) }
        }
    }

    /// Returns true if the arena (or the huge table) holding `obj` has not
    /// been swept yet in the current cycle.
    pub fn needs_sweep(&self, obj: GcRef) -> bool {
        if obj.is_huge() {
            self.huge_needs_sweep
        } else {
            self.arena(obj).flags.contains(ArenaFlags::NEEDS_SWEEP)
        }
    }

    /// Returns true unless `obj` is going to be reclaimed by the pending
    /// sweep.
    pub fn survives(&self, obj: GcRef) -> bool {
        self.is_marked(obj) || !self.needs_sweep(obj)
    }

    /// Marks `obj` reachable and queues it for traversal unless it is a
    /// leaf.
    pub fn mark(&mut self, obj: GcRef) {
        // SAFETY: marked references point at allocated objects.
        let leaf = unsafe { obj.kind() }.is_leaf();
        if obj.is_huge() {
            let addr = obj.addr();
            debug_assert!(self.huge.contains(addr), "{obj:?} is not a huge block");
            let flags = self.huge.flags(addr);
            if flags & HUGE_MARK == 0 {
                if leaf || flags & HUGE_GREY != 0 {
                    // Still queued from before a back barrier unmarked it.
                    self.huge.set_flags(addr, HUGE_MARK);
                } else {
                    self.huge.set_flags(addr, HUGE_MARK | HUGE_GREY);
                    self.huge_grey.push(obj);
                }
            }
        } else {
            let cell = obj.cell();
            let arena = self.arena_mut(obj);
            debug_assert!(arena.is_allocated(cell), "{obj:?} is not allocated");
            if !arena.is_marked(cell) {
                arena.set_mark(cell);
                if !leaf {
                    arena.grey.push(cell);
                }
            }
        }
    }

    /// Sets the mark of `obj` without queueing it.
    pub fn set_mark_bit(&mut self, obj: GcRef) {
        if obj.is_huge() {
            self.huge.set_flags(obj.addr(), HUGE_MARK);
        } else {
            let cell = obj.cell();
            self.arena_mut(obj).set_mark(cell);
        }
    }

    /// Turns a marked object grey again.
    pub fn unmark(&mut self, obj: GcRef) {
        if obj.is_huge() {
            self.huge.clear_flags(obj.addr(), HUGE_MARK);
        } else {
            let cell = obj.cell();
            self.arena_mut(obj).clear_mark(cell);
        }
    }

    /// Picks the queue with the most objects waiting.
    pub fn deepest_grey(&self) -> Option<GreySource> {
        let deepest = self
            .arenas
            .iter()
            .enumerate()
            .map(|(index, arena)| (arena.grey.len(), GreySource::Arena(index)))
            .chain([(self.huge_grey.len(), GreySource::Huge)])
            .filter(|&(depth, _)| depth > 0)
            .max_by_key(|&(depth, _)| depth)?;
        Some(deepest.1)
    }

    /// Pops the next object to traverse from `source`, skipping entries
    /// freed since they were queued.
    pub fn pop_grey(&mut self, source: GreySource) -> Option<GcRef> {
        match source {
            GreySource::Arena(index) => {
                let arena = &mut self.arenas[index];
                while let Some(cell) = arena.grey.pop() {
                    if arena.is_allocated(cell) {
                        return Some(arena.object(cell));
                    }
                }
                None
            }
            GreySource::Huge => {
                while let Some(obj) = self.huge_grey.pop() {
                    if self.huge.contains(obj.addr()) {
                        self.huge.clear_flags(obj.addr(), HUGE_GREY);
                        return Some(obj);
                    }
                }
                None
            }
        }
    }

    /// Keeps `obj` alive across every future cycle.
    pub fn fix(&mut self, obj: GcRef) {
        // SAFETY: `obj` is allocated.
        unsafe {
            if obj.flags().contains(ObjFlags::FIXED) {
                return;
            }
            obj.set_flags(ObjFlags::FIXED, true);
        }
        if obj.is_huge() {
            self.huge_fixed.push(obj);
        } else {
            let cell = obj.cell();
            self.arena_mut(obj).fixed.push(cell);
        }
    }

    /// Marks every fixed object and every object whose finalizer has not
    /// run yet.
    pub fn mark_fixed(&mut self) {
        let mut roots = Vec::new();
        for arena in &self.arenas {
            roots.extend(
                arena
                    .fixed
                    .iter()
                    .copied()
                    .chain(arena.finalizers.pending_cells())
                    .map(|cell| arena.object(cell)),
            );
        }
        roots.extend(self.huge_fixed.iter().chain(&self.huge_pending));
        for obj in roots {
            self.mark(obj);
        }
    }

    pub fn register_finalizer(&mut self, obj: GcRef) {
        // SAFETY: `obj` is allocated.
        unsafe {
            if obj.flags().contains(ObjFlags::FINALIZER) {
                return;
            }
            obj.set_flags(ObjFlags::FINALIZER, true);
        }
        if obj.is_huge() {
            self.huge_finalizers.push(obj);
        } else {
            let cell = obj.cell();
            self.arena_mut(obj).finalizers.push(cell);
        }
    }

    /// Moves every unmarked registered object into the pending state if
    /// `finalizable` says its finalizer still has to run, and forgets the
    /// others. Returns the newly pending objects.
    pub fn select_finalizers(&mut self, mut finalizable: impl FnMut(GcRef) -> bool) -> Vec<GcRef> {
        let mut doomed = Vec::new();
        for arena in &mut self.arenas {
            arena.select_finalizers(&mut finalizable, &mut doomed);
        }
        let huge = &self.huge;
        let pending = &mut self.huge_pending;
        self.huge_finalizers.retain(|&obj| {
            if huge.flags(obj.addr()) & HUGE_MARK != 0 {
                return true;
            }
            if finalizable(obj) {
                doomed.push(obj);
                pending.push(obj);
            } else {
                // SAFETY: registered blocks are allocated.
                unsafe { obj.set_flags(ObjFlags::FINALIZER, false) };
            }
            false
        });
        doomed
    }

    pub fn has_pending_finalizers(&self) -> bool {
        !self.huge_pending.is_empty()
            || self
                .arenas
                .iter()
                .any(|arena| arena.finalizers.has_pending())
    }

    /// Unregisters and returns one object whose finalizer is due.
    pub fn take_pending_finalizer(&mut self) -> Option<GcRef> {
        let obj = self
            .arenas
            .iter_mut()
            .find_map(|arena| {
                let cell = arena.finalizers.take_pending()?;
                Some(arena.object(cell))
            })
            .or_else(|| self.huge_pending.pop())?;
        // SAFETY: pending objects were kept alive by the last cycle.
        unsafe { obj.set_flags(ObjFlags::FINALIZER, false) };
        Some(obj)
    }

    /// Flags every arena holding objects, and the huge table, as awaiting
    /// sweep. From here on, objects allocated into them start marked.
    pub fn begin_sweep(&mut self) {
        for arena in &mut self.arenas {
            if !arena.flags.contains(ArenaFlags::EMPTY) {
                arena.flags.insert(ArenaFlags::NEEDS_SWEEP);
            }
        }
        self.huge_needs_sweep = true;
    }

    /// The first arena at or after `from` that still awaits sweep.
    pub fn next_unswept(&self, from: usize) -> Option<usize> {
        (from..self.arenas.len())
            .find(|&index| self.arenas[index].flags.contains(ArenaFlags::NEEDS_SWEEP))
    }

    /// Sweeps one arena and returns the number of bytes reclaimed.
    pub fn sweep_arena(&mut self, index: usize) -> usize {
        let arena = &mut self.arenas[index];
        if !arena.flags.contains(ArenaFlags::NEEDS_SWEEP) {
            return 0;
        }
        let before = arena.used_bytes();
        if arena.major_sweep() {
            arena.harvest();
        } else {
            arena.reset();
        }
        let freed = before - arena.used_bytes();
        trace!(
            "swept arena {index}: {freed} bytes freed, {} bytes live",
            arena.used_bytes()
        );
        self.total -= freed;
        freed
    }

    /// Frees every unmarked huge block and returns the number of bytes
    /// reclaimed.
    pub fn sweep_huge(&mut self) -> usize {
        debug_assert!(self.huge_grey.is_empty());
        self.huge_needs_sweep = false;
        let mut freed = 0;
        for (addr, size) in self.huge.sweep() {
            if let Some(block) = NonNull::new(addr as *mut u8) {
                // SAFETY: the table held this block with this size.
                unsafe { huge::free_block(block, size) };
            }
            freed += size;
        }
        if freed > 0 {
            trace!("swept huge blocks: {freed} bytes freed");
        }
        self.total -= freed;
        freed
    }

    /// Releases empty arenas beyond the first `keep` back to the global
    /// allocator. Returns the number released.
    pub fn release_spare_arenas(&mut self, keep: usize) -> usize {
        let mut kept = 0;
        let mut released = 0;
        let mut index = 0;
        while index < self.arenas.len() {
            let empty = self.arenas[index].flags.contains(ArenaFlags::EMPTY);
            if empty && Some(index) != self.current {
                if kept < keep {
                    kept += 1;
                } else {
                    self.remove_arena(index);
                    released += 1;
                    continue;
                }
            }
            index += 1;
        }
        released
    }

    fn remove_arena(&mut self, index: usize) {
        let arena = self.arenas.swap_remove(index);
        self.by_base.remove(&arena.base());
        let last = self.arenas.len();
        if index < last {
            let moved = &mut self.arenas[index];
            moved.set_index(index.cast::<u32>());
            self.by_base.insert(moved.base(), index);
            if self.current == Some(last) {
                self.current = Some(index);
            }
        }
        debug!("released arena at {:#x}", arena.base());
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        for (addr, size) in self.huge.blocks() {
            if let Some(block) = NonNull::new(addr as *mut u8) {
                // SAFETY: every registered block is still allocated.
                unsafe { huge::free_block(block, size) };
            }
        }
    }
}
