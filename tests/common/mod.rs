#![allow(dead_code)]

use ahash::AHashMap;
use cellgc::{FinalizerError, GcRef, GcState, Heap, Host, ObjKind, Trace, Tracer, WeakMode};

/// Outgoing references of a non-table object.
#[derive(Trace, Default, Debug)]
pub struct Slots {
    pub refs: Vec<GcRef>,
}

#[derive(Debug)]
pub struct Table {
    pub mode: WeakMode,
    pub entries: Vec<(GcRef, GcRef)>,
}

/// A toy object model: every object's references live in side tables keyed
/// by the object.
#[derive(Default)]
pub struct World {
    pub roots: Vec<GcRef>,
    pub slots: AHashMap<GcRef, Slots>,
    pub tables: AHashMap<GcRef, Table>,
    /// Objects for which `is_finalizable` answers false.
    pub declined: Vec<GcRef>,
    /// Finalizers run, in order.
    pub finalized: Vec<GcRef>,
    /// Finalizers that report an error.
    pub failing: Vec<GcRef>,
    /// Finalized objects are rooted again.
    pub resurrect: bool,
    /// Arguments of every `suspend_hooks` call.
    pub hooks: Vec<bool>,
    /// Thresholds observed from inside finalizers.
    pub thresholds: Vec<usize>,
    /// The serial written at the start of each stamped payload.
    pub serials: AHashMap<GcRef, u64>,
    next_serial: u64,
}

pub const OBJECT_SIZE: usize = 24;

impl World {
    pub fn new() -> Self {
        drop(env_logger::builder().is_test(true).try_init());
        Self::default()
    }

    pub fn alloc(&mut self, heap: &mut Heap, kind: ObjKind) -> GcRef {
        let obj = heap.alloc(kind, OBJECT_SIZE).unwrap();
        self.stamp(heap, obj);
        obj
    }

    pub fn table(&mut self, heap: &mut Heap, mode: WeakMode) -> GcRef {
        let table = heap.alloc(ObjKind::Table, OBJECT_SIZE).unwrap();
        self.stamp(heap, table);
        self.tables.insert(
            table,
            Table {
                mode,
                entries: Vec::new(),
            },
        );
        table
    }

    /// Writes a fresh serial into the payload of a new object, so that a
    /// later object reusing its cells cannot pass for it.
    pub fn stamp(&mut self, heap: &mut Heap, obj: GcRef) {
        self.serials.remove(&obj);
        if heap.kind(obj) == ObjKind::Str || heap.payload_len(obj) < 8 {
            return;
        }
        self.next_serial += 1;
        heap.payload_mut(obj)[..8].copy_from_slice(&self.next_serial.to_le_bytes());
        self.serials.insert(obj, self.next_serial);
    }

    /// Asserts that `obj` is still the object that was stamped there.
    pub fn assert_intact(&self, heap: &Heap, obj: GcRef) {
        assert!(heap.is_live(obj), "{obj:?} was swept");
        if let Some(serial) = self.serials.get(&obj) {
            assert_eq!(
                heap.payload(obj)[..8],
                serial.to_le_bytes(),
                "{obj:?} was overwritten"
            );
        }
    }

    /// Stores `to` in `from` and runs the write barrier a host would.
    pub fn link(&mut self, heap: &mut Heap, from: GcRef, to: GcRef) {
        self.slots.entry(from).or_default().refs.push(to);
        match heap.kind(from) {
            kind if kind.is_aggregate() => heap.barrier_back(from),
            ObjKind::Upval => heap.barrier_slot(from, to),
            _ => heap.barrier_forward(from, to),
        }
    }

    /// Clears every reference held by `from`.
    pub fn unlink_all(&mut self, from: GcRef) {
        self.slots.remove(&from);
    }

    pub fn insert(&mut self, heap: &mut Heap, table: GcRef, key: GcRef, value: GcRef) {
        self.tables
            .get_mut(&table)
            .expect("not a table")
            .entries
            .push((key, value));
        heap.barrier_back(table);
    }

    pub fn entries(&self, table: GcRef) -> &[(GcRef, GcRef)] {
        &self.tables[&table].entries
    }

    /// Drops the side tables of swept objects before their addresses can be
    /// reused.
    pub fn prune(&mut self, heap: &Heap) {
        self.slots.retain(|obj, _| heap.is_live(*obj));
        self.tables.retain(|obj, _| heap.is_live(*obj));
        self.serials.retain(|obj, _| heap.is_live(*obj));
    }

    /// Single-steps until the heap reaches `state`.
    pub fn run_until(&mut self, heap: &mut Heap, state: GcState) {
        while heap.state() != state {
            heap.single_step(self).unwrap();
        }
    }

    pub fn collect(&mut self, heap: &mut Heap) {
        heap.full_collect(self).unwrap();
        self.prune(heap);
    }
}

impl Host for World {
    fn enumerate_roots(&mut self, tracer: &mut Tracer) {
        tracer.trace(&self.roots);
    }

    fn traverse(&mut self, obj: GcRef, kind: ObjKind, tracer: &mut Tracer) {
        if let Some(slots) = self.slots.get(&obj) {
            tracer.trace(slots);
        }
        if kind == ObjKind::Table {
            if let Some(table) = self.tables.get(&obj) {
                for &(key, value) in &table.entries {
                    tracer.mark_key(key);
                    tracer.mark_value(value);
                }
            }
        }
    }

    fn size_of(&self, _obj: GcRef, _kind: ObjKind) -> usize {
        OBJECT_SIZE
    }

    fn is_finalizable(&self, obj: GcRef) -> bool {
        !self.declined.contains(&obj)
    }

    fn run_finalizer(&mut self, heap: &mut Heap, obj: GcRef) -> Result<(), FinalizerError> {
        self.finalized.push(obj);
        self.thresholds.push(heap.stats().threshold);
        if self.resurrect {
            self.roots.push(obj);
        }
        if self.failing.contains(&obj) {
            return Err(format!("finalizer of {obj:?} failed").into());
        }
        Ok(())
    }

    fn weak_mode(&self, table: GcRef) -> WeakMode {
        self.tables
            .get(&table)
            .map_or(WeakMode::None, |table| table.mode)
    }

    fn clear_weak(&mut self, table: GcRef, is_dead: &mut dyn FnMut(GcRef) -> bool) {
        if let Some(table) = self.tables.get_mut(&table) {
            let mode = table.mode;
            table.entries.retain(|&(key, value)| {
                !(mode.weak_keys() && is_dead(key)) && !(mode.weak_values() && is_dead(value))
            });
        }
    }

    fn suspend_hooks(&mut self, suspended: bool) {
        self.hooks.push(suspended);
    }
}
