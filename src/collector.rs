//! The incremental collector.
//!
//! A cycle moves through [`GcState`] one bounded step at a time:
//!
//! 1. `Pause`: the first step marks the roots and fixed objects.
//! 2. `Propagate`: grey objects are traversed in batches, deepest queue
//!    first.
//! 3. `Atomic`: one indivisible step re-marks the roots, drains the store
//!    buffer, selects finalizers and clears weak tables.
//! 4. `SweepStrings`: the intern table drops unmarked strings.
//! 5. `Sweep`: the current bump arena, the huge table, then one arena per
//!    step.
//! 6. `Finalize`: one pending finalizer per step.

use kempt::Set;
use log::{debug, trace};

use crate::error::GcError;
use crate::host::Host;
use crate::object::{GcRef, ObjKind};
use crate::trace::{Tracer, WeakMode};
use crate::Heap;

/// The cost reported by a step that cannot run while a compiled trace is
/// active. The caller must leave the trace before stepping again.
pub const STEP_BLOCKED: usize = usize::MAX;

const SWEEP_ARENA_COST: usize = 1024;
const SWEEP_STRING_COST: usize = 10;
const FINALIZE_COST: usize = 100;

/// The phase of the current collection cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum GcState {
    /// No cycle is in progress.
    Pause,
    /// Grey objects are being traversed incrementally.
    Propagate,
    /// Marking is about to be finished in one indivisible step.
    Atomic,
    /// Unreachable interned strings are being unlinked.
    SweepStrings,
    /// Unreachable objects are being reclaimed, one arena per step.
    Sweep,
    /// Finalizers of unreachable objects are being run.
    Finalize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SweepCursor {
    Current,
    Huge,
    Arena(usize),
}

pub(crate) struct Collector {
    pub state: GcState,
    /// Allocation total at which the next step is due.
    pub threshold: usize,
    /// Live bytes after the last completed cycle.
    pub estimate: usize,
    pub trace_active: bool,
    pub cycles: u64,
    strings_cursor: usize,
    sweep: SweepCursor,
    weak_tables: Vec<GcRef>,
    /// Unreachable objects kept alive for their finalizers this cycle.
    doomed: Set<GcRef>,
}

impl Collector {
    pub fn new(threshold: usize) -> Self {
        Self {
            state: GcState::Pause,
            threshold,
            estimate: 0,
            trace_active: false,
            cycles: 0,
            strings_cursor: 0,
            sweep: SweepCursor::Current,
            weak_tables: Vec::new(),
            doomed: Set::new(),
        }
    }

    /// Drops any reference the collector holds to `obj`.
    pub fn forget(&mut self, obj: GcRef) {
        self.weak_tables.retain(|&table| table != obj);
        self.doomed.remove(&obj);
    }
}

impl Heap {
    /// Performs one bounded unit of collection work and returns its cost.
    ///
    /// Returns [`STEP_BLOCKED`] instead of running the atomic phase or a
    /// finalizer while a compiled trace is active.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Finalizer`] if a finalizer failed. The collector
    /// remains consistent and the next step continues with the next
    /// finalizer.
    pub fn single_step<H>(&mut self, host: &mut H) -> Result<usize, GcError>
    where
        H: Host + ?Sized,
    {
        match self.collector.state {
            GcState::Pause => {
                self.start_cycle(host);
                Ok(0)
            }
            GcState::Propagate => Ok(self.propagate_step(host)),
            GcState::Atomic if self.collector.trace_active => Ok(STEP_BLOCKED),
            GcState::Atomic => Ok(self.atomic(host)),
            GcState::SweepStrings => Ok(self.sweep_strings_step()),
            GcState::Sweep => Ok(self.sweep_step()),
            GcState::Finalize if self.collector.trace_active => Ok(STEP_BLOCKED),
            GcState::Finalize => self.finalize_step(host),
        }
    }

    /// Runs single steps until the step budget is spent or the cycle
    /// completes, and returns the work done.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Finalizer`] if a finalizer failed.
    pub fn step<H>(&mut self, host: &mut H) -> Result<usize, GcError>
    where
        H: Host + ?Sized,
    {
        let budget = self.config.step_budget();
        let mut done = 0_usize;
        loop {
            let cost = self.single_step(host)?;
            if cost == STEP_BLOCKED {
                self.collector.threshold = self.space.total().saturating_add(self.config.step_size);
                return Ok(STEP_BLOCKED);
            }
            done = done.saturating_add(cost);
            if self.collector.state == GcState::Pause {
                return Ok(done);
            }
            if done >= budget {
                self.collector.threshold = self.space.total().saturating_add(self.config.step_size);
                return Ok(done);
            }
        }
    }

    /// Runs [`Heap::step`] if the allocation threshold has been reached.
    /// Returns whether a step ran.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Finalizer`] if a finalizer failed.
    pub fn check_gc<H>(&mut self, host: &mut H) -> Result<bool, GcError>
    where
        H: Host + ?Sized,
    {
        if self.should_step() {
            self.step(host)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Finishes the cycle in progress, then runs one complete cycle.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::TraceActive`] while a compiled trace is active and
    /// [`GcError::Finalizer`] if a finalizer failed. A failed finalizer
    /// leaves the heap mid-cycle; calling this function again resumes.
    pub fn full_collect<H>(&mut self, host: &mut H) -> Result<(), GcError>
    where
        H: Host + ?Sized,
    {
        if self.collector.trace_active {
            return Err(GcError::TraceActive);
        }
        debug!("full collection requested in {:?}", self.collector.state);
        self.finish_cycle(host)?;
        self.single_step(host)?;
        self.finish_cycle(host)
    }

    fn finish_cycle<H>(&mut self, host: &mut H) -> Result<(), GcError>
    where
        H: Host + ?Sized,
    {
        while self.collector.state != GcState::Pause {
            self.single_step(host)?;
        }
        Ok(())
    }

    fn start_cycle<H>(&mut self, host: &mut H)
    where
        H: Host + ?Sized,
    {
        debug!(
            "starting cycle {} with {} bytes allocated",
            self.collector.cycles + 1,
            self.space.total()
        );
        self.collector.weak_tables.clear();
        self.collector.doomed = Set::new();
        self.mark_roots(host);
        self.collector.state = GcState::Propagate;
    }

    fn mark_roots<H>(&mut self, host: &mut H)
    where
        H: Host + ?Sized,
    {
        host.enumerate_roots(&mut Tracer::new(&mut self.space, WeakMode::None));
        self.space.mark_fixed();
    }

    fn traverse<H>(&mut self, host: &mut H, obj: GcRef) -> usize
    where
        H: Host + ?Sized,
    {
        // SAFETY: grey objects are allocated.
        let kind = unsafe { obj.kind() };
        let mode = if kind == ObjKind::Table {
            host.weak_mode(obj)
        } else {
            WeakMode::None
        };
        if mode != WeakMode::None {
            self.collector.weak_tables.push(obj);
        }
        host.traverse(obj, kind, &mut Tracer::new(&mut self.space, mode));
        host.size_of(obj, kind)
    }

    fn propagate_step<H>(&mut self, host: &mut H) -> usize
    where
        H: Host + ?Sized,
    {
        if !self.ssb.is_empty() {
            self.drain_store_buffer();
        }
        let Some(source) = self.space.deepest_grey() else {
            debug!("propagation complete");
            self.collector.state = GcState::Atomic;
            return 0;
        };
        let mut cost = 0_usize;
        let mut traversed = 0;
        while traversed < self.config.grey_batch {
            let Some(obj) = self.space.pop_grey(source) else {
                break;
            };
            cost = cost.saturating_add(self.traverse(host, obj));
            traversed += 1;
        }
        trace!("traversed {traversed} objects from {source:?} at a cost of {cost}");
        cost
    }

    fn propagate_all<H>(&mut self, host: &mut H) -> usize
    where
        H: Host + ?Sized,
    {
        let mut cost = 0_usize;
        loop {
            if !self.ssb.is_empty() {
                self.drain_store_buffer();
            }
            let Some(source) = self.space.deepest_grey() else {
                return cost;
            };
            while let Some(obj) = self.space.pop_grey(source) {
                cost = cost.saturating_add(self.traverse(host, obj));
            }
        }
    }

    fn atomic<H>(&mut self, host: &mut H) -> usize
    where
        H: Host + ?Sized,
    {
        debug!("atomic phase");
        self.drain_store_buffer();
        self.mark_roots(host);
        let mut cost = self.propagate_all(host);

        let doomed = self.space.select_finalizers(|obj| host.is_finalizable(obj));
        let mut doomed_set = Set::with_capacity(doomed.len());
        for &obj in &doomed {
            doomed_set.insert(obj);
        }
        self.collector.doomed = doomed_set;
        self.clear_weak_tables(host);
        if !doomed.is_empty() {
            debug!("{} objects awaiting finalization", doomed.len());
            for obj in doomed {
                self.space.mark(obj);
            }
            cost = cost.saturating_add(self.propagate_all(host));
            self.clear_weak_tables(host);
        }
        debug_assert!(self.ssb.is_empty());

        self.space.begin_sweep();
        self.collector.strings_cursor = 0;
        self.collector.state = GcState::SweepStrings;
        cost
    }

    /// Lets the host drop weak entries referencing objects that are
    /// unmarked or only alive for their finalizer. Strings are never
    /// considered dead.
    fn clear_weak_tables<H>(&mut self, host: &mut H)
    where
        H: Host + ?Sized,
    {
        let tables = &mut self.collector.weak_tables;
        tables.sort_unstable();
        tables.dedup();
        let space = &self.space;
        let doomed = &self.collector.doomed;
        let mut is_dead = |obj: GcRef| {
            // SAFETY: table entries reference allocated objects.
            let string = unsafe { obj.kind() } == ObjKind::Str;
            !string && (!space.is_marked(obj) || doomed.contains(&obj))
        };
        for &table in self.collector.weak_tables.iter() {
            host.clear_weak(table, &mut is_dead);
        }
    }

    fn sweep_strings_step(&mut self) -> usize {
        let space = &self.space;
        let (next, removed) = self.strings.sweep(
            self.collector.strings_cursor,
            self.config.strings_per_step,
            |obj| space.survives(obj),
        );
        if removed > 0 {
            trace!("unlinked {removed} strings");
        }
        self.collector.strings_cursor = next;
        if next >= self.strings.bucket_count() {
            debug!("string sweep complete, {} strings remain", self.strings.len());
            self.collector.sweep = SweepCursor::Current;
            self.collector.state = GcState::Sweep;
        }
        self.config.strings_per_step * SWEEP_STRING_COST
    }

    fn sweep_step(&mut self) -> usize {
        match self.collector.sweep {
            SweepCursor::Current => {
                if let Some(index) = self.space.current_arena() {
                    self.space.sweep_arena(index);
                }
                self.collector.sweep = SweepCursor::Huge;
                SWEEP_ARENA_COST
            }
            SweepCursor::Huge => {
                self.space.sweep_huge();
                self.collector.sweep = SweepCursor::Arena(0);
                SWEEP_ARENA_COST
            }
            SweepCursor::Arena(from) => {
                if let Some(index) = self.space.next_unswept(from) {
                    self.space.sweep_arena(index);
                    self.collector.sweep = SweepCursor::Arena(index + 1);
                    SWEEP_ARENA_COST
                } else {
                    debug!(
                        "sweep complete, {} bytes in {} arenas and {} huge blocks",
                        self.space.total(),
                        self.space.arena_count(),
                        self.space.huge_blocks()
                    );
                    self.collector.state = GcState::Finalize;
                    0
                }
            }
        }
    }

    fn finalize_step<H>(&mut self, host: &mut H) -> Result<usize, GcError>
    where
        H: Host + ?Sized,
    {
        let Some(obj) = self.space.take_pending_finalizer() else {
            self.enter_pause();
            return Ok(0);
        };
        trace!("finalizing {obj:?}");
        let threshold = self.collector.threshold;
        self.collector.threshold = usize::MAX;
        host.suspend_hooks(true);
        let result = host.run_finalizer(self, obj);
        host.suspend_hooks(false);
        self.collector.threshold = threshold;
        result.map_err(GcError::Finalizer)?;
        Ok(FINALIZE_COST)
    }

    fn enter_pause(&mut self) {
        self.collector.weak_tables.clear();
        self.collector.doomed = Set::new();
        let released = self.space.release_spare_arenas(self.config.spare_arenas);
        self.collector.estimate = self.space.total();
        self.collector.threshold = (self.collector.estimate / 100).saturating_mul(self.config.pause);
        self.collector.cycles += 1;
        self.collector.state = GcState::Pause;
        debug!(
            "cycle {} complete: {} bytes live, {released} arenas released, next threshold {}",
            self.collector.cycles, self.collector.estimate, self.collector.threshold
        );
    }
}
