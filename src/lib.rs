//! An arena-based allocator with an incremental, bitmap-marking garbage
//! collector for dynamic-language runtimes.
//!
//! Objects live in 1 MiB arenas of 16-byte cells. Liveness is kept in two
//! bitmaps per arena rather than in object headers, so sweeping an arena is
//! a handful of word operations per 64 cells. Allocations too large for an
//! arena are tracked in a separate huge-block table.
//!
//! Collection is incremental: [`Heap::step`] performs a bounded amount of
//! work and returns to the mutator. The object model stays with the host,
//! which answers the collector's questions through the [`Host`] trait and
//! calls the write barriers ([`Heap::barrier_forward`],
//! [`Heap::barrier_back`], [`Heap::barrier_slot`]) after storing references.
//!
//! ```rust
//! use cellgc::{GcRef, Heap, Host, ObjKind, Tracer};
//!
//! struct Roots(Vec<GcRef>);
//!
//! impl Host for Roots {
//!     fn enumerate_roots(&mut self, tracer: &mut Tracer) {
//!         tracer.trace(&self.0);
//!     }
//!
//!     fn traverse(&mut self, _obj: GcRef, _kind: ObjKind, _tracer: &mut Tracer) {}
//!
//!     fn size_of(&self, _obj: GcRef, _kind: ObjKind) -> usize {
//!         16
//!     }
//! }
//!
//! let mut heap = Heap::new();
//! let mut roots = Roots(Vec::new());
//! let kept = heap.intern(b"kept")?;
//! let dropped = heap.intern(b"dropped")?;
//! roots.0.push(kept);
//!
//! heap.full_collect(&mut roots)?;
//! assert!(heap.is_live(kept));
//! assert_eq!(heap.str_bytes(kept), b"kept");
//! assert!(!heap.is_live(dropped));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

extern crate self as cellgc;

mod arena;
mod barrier;
mod collector;
mod config;
mod error;
mod finalize;
mod freelist;
mod grey;
mod host;
mod huge;
mod object;
mod space;
mod strings;
mod trace;

#[cfg(test)]
mod tests;

use std::{ptr, slice};

pub use cellgc_macros::Trace;
use intentional::Cast;

pub use crate::arena::{
    CellState, ARENA_CELLS, ARENA_MASK, ARENA_SIZE, CELL_SIZE, FIRST_CELL, USABLE_CELLS,
};
use crate::barrier::StoreBuffer;
use crate::collector::Collector;
pub use crate::collector::{GcState, STEP_BLOCKED};
pub use crate::config::GcConfig;
pub use crate::error::{AllocError, ConfigError, FinalizerError, GcError};
pub use crate::host::Host;
use crate::object::{round_to_cells, ObjFlags, ObjHeader};
pub use crate::object::{GcRef, ObjKind, HEADER_SIZE};
use crate::space::Space;
use crate::strings::StringTable;
pub use crate::trace::{NoReferences, Trace, Tracer, WeakMode};

/// Allocation total that triggers the first cycle.
const INITIAL_THRESHOLD: usize = 1 << 16;

/// Bytes occupied by an object with a `size` byte payload.
const fn object_bytes(size: usize) -> usize {
    round_to_cells(HEADER_SIZE + size) * CELL_SIZE
}

/// A snapshot of a heap's bookkeeping.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HeapStats {
    /// Bytes held by allocated objects, including unreachable objects that
    /// have not been swept yet.
    pub total_bytes: usize,
    /// Allocation total at which the next step is due.
    pub threshold: usize,
    /// Live bytes measured at the end of the last cycle.
    pub estimate: usize,
    /// Arenas currently allocated.
    pub arenas: usize,
    /// Arenas holding no objects.
    pub empty_arenas: usize,
    /// Huge blocks currently allocated.
    pub huge_blocks: usize,
    /// Bytes held by huge blocks.
    pub huge_bytes: usize,
    /// Interned strings.
    pub strings: usize,
    /// Completed collection cycles.
    pub cycles: u64,
}

/// A garbage collected heap.
///
/// A heap is a self-contained instance: several heaps can coexist, and
/// references from one heap must never be handed to another.
pub struct Heap {
    space: Space,
    strings: StringTable,
    collector: Collector,
    ssb: StoreBuffer,
    config: GcConfig,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Returns a heap using the default [`GcConfig`].
    #[must_use]
    pub fn new() -> Self {
        Self::build(GcConfig::default())
    }

    /// Returns a heap using `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` does not validate.
    pub fn with_config(config: GcConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: GcConfig) -> Self {
        Self {
            space: Space::new(),
            strings: StringTable::new(),
            collector: Collector::new(INITIAL_THRESHOLD),
            ssb: StoreBuffer::new(config.store_buffer_len),
            config,
        }
    }

    /// Returns the configuration of this heap.
    #[must_use]
    pub const fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Allocates an object of `kind` with a zeroed payload of `size` bytes.
    ///
    /// Allocation never runs the collector. Hosts call [`Heap::check_gc`] at
    /// points where collecting is safe.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the memory cannot be obtained.
    pub fn alloc(&mut self, kind: ObjKind, size: usize) -> Result<GcRef, AllocError> {
        let len = u32::try_from(size).map_err(|_| AllocError::TooLarge { size })?;
        let total = object_bytes(size);
        let obj = if total > self.config.huge_threshold {
            self.space.alloc_huge(total)?
        } else {
            let obj = self.space.alloc_cells((total / CELL_SIZE).cast::<u32>())?;
            // SAFETY: the object owns `total` bytes.
            unsafe { obj.as_ptr().write_bytes(0, total) };
            obj
        };
        // SAFETY: the object was just allocated.
        unsafe { obj.write_header(ObjHeader::new(kind, len)) };
        Ok(obj)
    }

    /// Releases `obj` immediately. `size` is the payload size it was
    /// allocated (or last resized) with.
    ///
    /// The host must not hold any reference to `obj` afterwards.
    pub fn free(&mut self, obj: GcRef, size: usize) {
        debug_assert!(self.is_live(obj), "{obj:?} is not allocated");
        debug_assert_eq!(self.space.object_size(obj), object_bytes(size));
        self.release(obj);
    }

    fn release(&mut self, obj: GcRef) {
        // SAFETY: `obj` is allocated.
        if unsafe { obj.kind() } == ObjKind::Str {
            // SAFETY: as above.
            let hash = self.strings.hash(unsafe { obj.payload_bytes() });
            self.strings.remove(hash, obj);
        }
        self.ssb.remove(obj);
        self.collector.forget(obj);
        self.space.free(obj);
    }

    /// Resizes the payload of `obj` from `old` to `new` bytes.
    ///
    /// The object is resized in place when it keeps the same number of
    /// cells. Otherwise a new object of the same kind is allocated, the
    /// payload copied and `obj` freed; the host must then replace every
    /// reference to `obj` with the returned one.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the memory cannot be obtained. `obj` is
    /// left untouched in that case.
    pub fn realloc(&mut self, obj: GcRef, old: usize, new: usize) -> Result<GcRef, AllocError> {
        debug_assert!(self.is_live(obj), "{obj:?} is not allocated");
        let len = u32::try_from(new).map_err(|_| AllocError::TooLarge { size: new })?;
        let total = object_bytes(new);
        // SAFETY: `obj` is allocated.
        let mut header = unsafe { obj.header() };
        debug_assert_eq!(header.len as usize, old);
        debug_assert_ne!(header.kind, ObjKind::Str, "interned strings are immutable");

        let resized = if obj.is_huge() && total > self.config.huge_threshold {
            self.space.realloc_huge(obj, total)?
        } else if !obj.is_huge() && total == self.space.object_size(obj) {
            obj
        } else {
            return self.move_object(obj, header, new);
        };
        // SAFETY: `resized` owns at least `HEADER_SIZE + new` bytes.
        unsafe {
            if new > old {
                resized.payload().as_ptr().add(old).write_bytes(0, new - old);
            }
            header.len = len;
            resized.write_header(header);
        }
        Ok(resized)
    }

    fn move_object(
        &mut self,
        obj: GcRef,
        header: ObjHeader,
        new: usize,
    ) -> Result<GcRef, AllocError> {
        let moved = self.alloc(header.kind, new)?;
        let keep = (header.len as usize).min(new);
        // SAFETY: both objects are allocated and distinct, and both
        // payloads hold at least `keep` bytes.
        unsafe {
            ptr::copy_nonoverlapping(obj.payload().as_ptr(), moved.payload().as_ptr(), keep);
        }
        if header.flags.contains(ObjFlags::FIXED) {
            self.space.fix(moved);
        }
        if header.flags.contains(ObjFlags::FINALIZER) {
            self.space.register_finalizer(moved);
        }
        if matches!(self.collector.state, GcState::Propagate | GcState::Atomic)
            && self.space.is_marked(obj)
        {
            self.space.mark(moved);
        }
        self.release(obj);
        Ok(moved)
    }

    /// Returns the interned string with the contents `bytes`, allocating it
    /// if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if a new string cannot be allocated.
    pub fn intern(&mut self, bytes: &[u8]) -> Result<GcRef, AllocError> {
        let hash = self.strings.hash(bytes);
        // SAFETY: strings stay allocated while they are linked in the table.
        if let Some(found) = self
            .strings
            .find(hash, |obj| unsafe { obj.payload_bytes() } == bytes)
        {
            // A dead string that has not been unlinked yet is revived.
            if !self.space.survives(found) {
                self.space.set_mark_bit(found);
            }
            return Ok(found);
        }
        let obj = self.alloc(ObjKind::Str, bytes.len())?;
        // SAFETY: the payload of `obj` is `bytes.len()` bytes long.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), obj.payload().as_ptr(), bytes.len());
        }
        let allow_resize = self.collector.state != GcState::SweepStrings;
        self.strings.insert(hash, obj, allow_resize);
        Ok(obj)
    }

    /// Returns the contents of the interned string `obj`.
    #[must_use]
    pub fn str_bytes(&self, obj: GcRef) -> &[u8] {
        debug_assert_eq!(self.kind(obj), ObjKind::Str);
        self.payload(obj)
    }

    /// Returns the payload of `obj`.
    #[must_use]
    pub fn payload(&self, obj: GcRef) -> &[u8] {
        debug_assert!(self.is_live(obj), "{obj:?} is not allocated");
        // SAFETY: `obj` is allocated and the borrow of `self` keeps it so.
        unsafe { obj.payload_bytes() }
    }

    /// Returns the payload of `obj` for writing. References stored in the
    /// payload must be followed by the matching write barrier.
    #[must_use]
    pub fn payload_mut(&mut self, obj: GcRef) -> &mut [u8] {
        debug_assert!(self.is_live(obj), "{obj:?} is not allocated");
        debug_assert_ne!(self.kind(obj), ObjKind::Str, "interned strings are immutable");
        let len = self.payload_len(obj);
        // SAFETY: `obj` is allocated, and the exclusive borrow of `self`
        // prevents any other access to it.
        unsafe { slice::from_raw_parts_mut(obj.payload().as_ptr(), len) }
    }

    /// Keeps `obj` alive across every future cycle.
    pub fn fix(&mut self, obj: GcRef) {
        debug_assert!(self.is_live(obj), "{obj:?} is not allocated");
        self.space.fix(obj);
    }

    /// Registers `obj` for finalization. Once `obj` is found unreachable,
    /// [`Host::run_finalizer`] is called for it exactly once, unless
    /// [`Host::is_finalizable`] declines at that time.
    pub fn register_finalizer(&mut self, obj: GcRef) {
        debug_assert!(self.is_live(obj), "{obj:?} is not allocated");
        self.space.register_finalizer(obj);
    }

    /// Returns the kind `obj` was allocated with.
    #[must_use]
    pub fn kind(&self, obj: GcRef) -> ObjKind {
        debug_assert!(self.is_live(obj), "{obj:?} is not allocated");
        // SAFETY: `obj` is allocated.
        unsafe { obj.kind() }
    }

    /// Returns the payload size of `obj` in bytes.
    #[must_use]
    pub fn payload_len(&self, obj: GcRef) -> usize {
        debug_assert!(self.is_live(obj), "{obj:?} is not allocated");
        // SAFETY: `obj` is allocated.
        unsafe { obj.header().len as usize }
    }

    /// Returns true if `obj` heads an allocated object.
    ///
    /// An unreachable object stays allocated until its arena is swept.
    #[must_use]
    pub fn is_live(&self, obj: GcRef) -> bool {
        self.space.is_allocated(obj)
    }

    /// Returns the cell state of the head of `obj`. Huge blocks report
    /// [`CellState::White`] or [`CellState::Black`].
    #[must_use]
    pub fn cell_state(&self, obj: GcRef) -> CellState {
        self.space.cell_state(obj)
    }

    /// Returns the bytes occupied by `obj`, header included, as recovered
    /// from the arena bitmaps or the huge table.
    #[must_use]
    pub fn object_size(&self, obj: GcRef) -> usize {
        debug_assert!(self.is_live(obj), "{obj:?} is not allocated");
        self.space.object_size(obj)
    }

    /// Returns true if `addr` lies in one of this heap's arenas or is the
    /// head of one of its huge objects.
    #[must_use]
    pub fn owns(&self, addr: usize) -> bool {
        self.space.owns(addr)
    }

    /// Returns the phase of the current cycle.
    #[must_use]
    pub const fn state(&self) -> GcState {
        self.collector.state
    }

    /// Returns a snapshot of this heap's bookkeeping.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            total_bytes: self.space.total(),
            threshold: self.collector.threshold,
            estimate: self.collector.estimate,
            arenas: self.space.arena_count(),
            empty_arenas: self.space.empty_arenas(),
            huge_blocks: self.space.huge_blocks(),
            huge_bytes: self.space.huge_bytes(),
            strings: self.strings.len(),
            cycles: self.collector.cycles,
        }
    }

    /// Returns true if the allocation threshold has been reached.
    #[must_use]
    pub fn should_step(&self) -> bool {
        self.space.total() >= self.collector.threshold
    }

    /// Returns true if finalizers are waiting to run in this cycle.
    #[must_use]
    pub fn has_pending_finalizers(&self) -> bool {
        self.space.has_pending_finalizers()
    }

    /// Declares that a compiled trace is (or is no longer) executing. While
    /// it is, steps that would run the atomic phase or a finalizer return
    /// [`STEP_BLOCKED`].
    pub fn set_trace_active(&mut self, active: bool) {
        self.collector.trace_active = active;
    }

    /// Sets how far the heap grows past the live size before the next
    /// cycle, in percent.
    pub fn set_pause_percent(&mut self, pause: usize) {
        self.config.pause = pause;
    }

    /// Sets the work done per step, in percent of the step size.
    pub fn set_step_multiplier(&mut self, multiplier: usize) {
        self.config.step_multiplier = multiplier;
    }
}
