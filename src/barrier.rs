//! Write barriers.
//!
//! While the collector is marking, a store of a white reference into a
//! black object would hide the referent from the collector. The barriers
//! below restore the invariant, either by recording the referent in a small
//! store buffer or by turning the writer grey again.

use log::trace;

use crate::collector::GcState;
use crate::object::GcRef;
use crate::Heap;

/// A bounded log of objects hit by write barriers, marked in batches.
pub(crate) struct StoreBuffer {
    entries: Vec<GcRef>,
    capacity: usize,
}

impl StoreBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records `obj` and answers whether the buffer is now full.
    pub fn push(&mut self, obj: GcRef) -> bool {
        self.entries.push(obj);
        self.entries.len() >= self.capacity
    }

    pub fn remove(&mut self, obj: GcRef) {
        self.entries.retain(|&entry| entry != obj);
    }

    pub fn take(&mut self) -> Vec<GcRef> {
        std::mem::replace(&mut self.entries, Vec::with_capacity(self.capacity))
    }
}

impl Heap {
    fn is_marking(&self) -> bool {
        matches!(self.collector.state, GcState::Propagate | GcState::Atomic)
    }

    fn is_sweeping(&self) -> bool {
        matches!(
            self.collector.state,
            GcState::SweepStrings | GcState::Sweep
        )
    }

    fn record(&mut self, obj: GcRef) {
        if self.ssb.push(obj) {
            self.drain_store_buffer();
        }
    }

    /// Must be called after storing `referent` into a slot of `writer`.
    ///
    /// The common case, a white writer, costs a single mark bit test.
    pub fn barrier_forward(&mut self, writer: GcRef, referent: GcRef) {
        if !self.space.is_marked(writer) || self.space.is_marked(referent) {
            return;
        }
        if self.is_marking() {
            self.record(referent);
        } else if self.is_sweeping() && self.space.needs_sweep(referent) {
            self.space.set_mark_bit(referent);
        }
    }

    /// Must be called after storing any reference into an aggregate
    /// `container` (a table or a thread).
    ///
    /// A black container is turned grey again and queued once, so repeated
    /// stores into it cost nothing until it has been traversed again.
    pub fn barrier_back(&mut self, container: GcRef) {
        if self.is_marking() && self.space.is_marked(container) {
            self.space.unmark(container);
            self.record(container);
        }
    }

    /// Must be called after storing `referent` into the single slot of
    /// `writer`, e.g. a closed upvalue. The referent is marked immediately.
    pub fn barrier_slot(&mut self, writer: GcRef, referent: GcRef) {
        if !self.space.is_marked(writer) || self.space.is_marked(referent) {
            return;
        }
        if self.is_marking() {
            self.space.mark(referent);
        } else if self.is_sweeping() && self.space.needs_sweep(referent) {
            self.space.set_mark_bit(referent);
        }
    }

    /// Marks every object recorded by the barriers.
    pub(crate) fn drain_store_buffer(&mut self) {
        let entries = self.ssb.take();
        trace!("draining {} store buffer entries", entries.len());
        for obj in entries {
            if !self.space.is_marked(obj) {
                self.space.mark(obj);
            }
        }
    }
}

#[test]
fn store_buffer_reports_full() {
    use std::ptr::NonNull;

    let obj = GcRef::new(NonNull::<u64>::dangling().cast());
    let mut buffer = StoreBuffer::new(2);
    assert!(!buffer.push(obj));
    assert!(buffer.push(obj));
    assert_eq!(buffer.len(), 2);
    buffer.remove(obj);
    assert!(buffer.is_empty());
    buffer.push(obj);
    assert_eq!(buffer.take(), [obj]);
    assert!(buffer.is_empty());
}
