//! Unit tests that need to look at the heap's internals. Scenario tests
//! driving whole cycles through a host live in the tests/ directory.

use kempt::Map;

use crate::{
    CellState, GcConfig, GcRef, GcState, Heap, Host, ObjKind, Trace, Tracer, WeakMode, CELL_SIZE,
};

/// A host where every object's references are listed in a side table.
#[derive(Default)]
struct Graph {
    roots: Vec<GcRef>,
    edges: Map<GcRef, Vec<GcRef>>,
    visits: Map<GcRef, usize>,
}

impl Graph {
    fn link(&mut self, from: GcRef, to: GcRef) {
        if let Some(edges) = self.edges.get_mut(&from) {
            edges.push(to);
        } else {
            self.edges.insert(from, vec![to]);
        }
    }
}

impl Host for Graph {
    fn enumerate_roots(&mut self, tracer: &mut Tracer) {
        tracer.trace(&self.roots);
    }

    fn traverse(&mut self, obj: GcRef, _kind: ObjKind, tracer: &mut Tracer) {
        if let Some(visits) = self.visits.get_mut(&obj) {
            *visits += 1;
        } else {
            self.visits.insert(obj, 1);
        }
        if let Some(edges) = self.edges.get(&obj) {
            tracer.trace(edges);
        }
    }

    fn size_of(&self, _obj: GcRef, _kind: ObjKind) -> usize {
        32
    }
}

#[derive(Trace)]
struct Frame {
    locals: Vec<GcRef>,
    callee: Option<GcRef>,
    #[trace(ignore)]
    depth: usize,
}

#[derive(Trace)]
struct Counters {
    hits: u64,
    misses: u64,
}

#[test]
fn derived_trace_skips_reference_free_types() {
    assert!(<Frame as Trace>::MAY_CONTAIN_REFERENCES);
    assert!(!<Counters as Trace>::MAY_CONTAIN_REFERENCES);
    let counters = Counters { hits: 1, misses: 2 };
    assert_eq!(counters.hits + counters.misses, 3);
}

#[test]
fn derived_trace_marks_fields() {
    let mut heap = Heap::new();
    let local = heap.alloc(ObjKind::Udata, 8).unwrap();
    let callee = heap.alloc(ObjKind::Func, 8).unwrap();
    let frame = Frame {
        locals: vec![local],
        callee: Some(callee),
        depth: 3,
    };
    assert_eq!(frame.depth, 3);

    let mut tracer = Tracer::new(&mut heap.space, WeakMode::None);
    tracer.trace(&frame);
    assert!(heap.space.is_marked(local));
    assert!(heap.space.is_marked(callee));
}

#[test]
fn freeing_the_top_object_lowers_celltop() {
    let mut heap = Heap::new();
    let first = heap.alloc(ObjKind::Udata, 40).unwrap();
    let second = heap.alloc(ObjKind::Udata, 40).unwrap();
    assert_eq!(second.addr() - first.addr(), 3 * CELL_SIZE);
    assert_eq!(heap.stats().total_bytes, 6 * CELL_SIZE);

    heap.free(second, 40);
    assert!(!heap.is_live(second));
    assert_eq!(heap.stats().total_bytes, 3 * CELL_SIZE);
    let third = heap.alloc(ObjKind::Udata, 40).unwrap();
    assert_eq!(third, second);
    assert!(heap.payload(third).iter().all(|&byte| byte == 0));
}

#[test]
fn realloc_in_place_and_moving() {
    let mut heap = Heap::new();
    let obj = heap.alloc(ObjKind::Udata, 4).unwrap();
    heap.payload_mut(obj).copy_from_slice(b"abcd");
    heap.fix(obj);

    // 8 + 8 bytes still fit in one cell.
    let same = heap.realloc(obj, 4, 8).unwrap();
    assert_eq!(same, obj);
    assert_eq!(heap.payload(same), b"abcd\0\0\0\0");

    let moved = heap.realloc(same, 8, 100).unwrap();
    assert_ne!(moved, same);
    assert!(!heap.is_live(same));
    assert_eq!(heap.payload_len(moved), 100);
    assert_eq!(&heap.payload(moved)[..8], b"abcd\0\0\0\0");
    assert_eq!(heap.object_size(moved), 7 * CELL_SIZE);

    // The fixed registration moved along with the object.
    let mut graph = Graph::default();
    heap.full_collect(&mut graph).unwrap();
    assert!(heap.is_live(moved));
}

#[test]
fn huge_objects_bypass_arenas() {
    let mut heap = Heap::new();
    let size = heap.config().huge_threshold;
    let obj = heap.alloc(ObjKind::Udata, size).unwrap();
    assert!(obj.is_huge());
    assert_eq!(heap.stats().huge_blocks, 1);
    assert_eq!(heap.stats().huge_bytes, size + CELL_SIZE);
    assert_eq!(heap.stats().arenas, 0);
    assert_eq!(heap.object_size(obj), size + CELL_SIZE);
    assert!(heap.owns(obj.addr()));
    // Only the head of a huge block is recognized.
    assert!(!heap.owns(obj.addr() + CELL_SIZE));

    let grown = heap.realloc(obj, size, size * 2).unwrap();
    assert!(grown.is_huge());
    assert_eq!(heap.payload_len(grown), size * 2);
    assert!(heap.payload(grown).iter().all(|&byte| byte == 0));

    // Shrinking below the threshold moves the object into an arena.
    let small = heap.realloc(grown, size * 2, 16).unwrap();
    assert!(!small.is_huge());
    assert_eq!(heap.stats().huge_blocks, 0);
    heap.free(small, 16);
    assert_eq!(heap.stats().total_bytes, 0);
}

#[test]
fn interning_deduplicates() {
    let mut heap = Heap::new();
    let a = heap.intern(b"name").unwrap();
    let b = heap.intern(b"name").unwrap();
    let c = heap.intern(b"other").unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(heap.str_bytes(c), b"other");
    assert_eq!(heap.kind(a), ObjKind::Str);
    assert_eq!(heap.stats().strings, 2);

    heap.free(c, 5);
    assert_eq!(heap.stats().strings, 1);
    let again = heap.intern(b"other").unwrap();
    assert_eq!(heap.str_bytes(again), b"other");
}

#[test]
fn survivors_turn_white_after_sweep() {
    let mut heap = Heap::new();
    let mut graph = Graph::default();
    let root = heap.alloc(ObjKind::Table, 16).unwrap();
    let child = heap.alloc(ObjKind::Udata, 16).unwrap();
    let garbage = heap.alloc(ObjKind::Udata, 16).unwrap();
    let tail = heap.alloc(ObjKind::Udata, 16).unwrap();
    graph.roots.push(root);
    graph.link(root, child);
    graph.link(root, tail);

    heap.single_step(&mut graph).unwrap();
    assert_eq!(heap.state(), GcState::Propagate);
    assert_eq!(heap.cell_state(root), CellState::Black);
    assert_eq!(heap.cell_state(child), CellState::White);

    while heap.state() != GcState::Pause {
        heap.single_step(&mut graph).unwrap();
    }
    assert_eq!(heap.cell_state(root), CellState::White);
    assert_eq!(heap.cell_state(child), CellState::White);
    assert!(!heap.is_live(garbage));
    assert_eq!(heap.cell_state(garbage), CellState::Free);
    assert_eq!(heap.stats().cycles, 1);
    assert_eq!(heap.stats().total_bytes, 6 * CELL_SIZE);
}

#[test]
fn allocations_during_sweep_start_black() {
    let mut heap = Heap::new();
    let mut graph = Graph::default();
    let kept = heap.alloc(ObjKind::Udata, 8).unwrap();
    graph.roots.push(kept);

    while heap.state() != GcState::SweepStrings {
        heap.single_step(&mut graph).unwrap();
    }
    let fresh = heap.alloc(ObjKind::Udata, 8).unwrap();
    assert_eq!(heap.cell_state(fresh), CellState::Black);

    while heap.state() != GcState::Pause {
        heap.single_step(&mut graph).unwrap();
    }
    // Unrooted, but allocated after marking finished.
    assert!(heap.is_live(fresh));
    assert_eq!(heap.cell_state(fresh), CellState::White);
    assert!(!heap.space.needs_sweep(fresh));
}

#[test]
fn released_arenas_reindex_the_survivors() {
    let config = GcConfig {
        huge_threshold: GcConfig::MAX_HUGE_THRESHOLD,
        spare_arenas: 0,
        ..GcConfig::default()
    };
    let mut heap = Heap::with_config(config).unwrap();
    let mut graph = Graph::default();
    // Each object fills all but one cell of an arena.
    let size = GcConfig::MAX_HUGE_THRESHOLD - 2 * CELL_SIZE;
    let objects = [0; 3].map(|_| heap.alloc(ObjKind::Udata, size).unwrap());
    assert_eq!(heap.stats().arenas, 3);

    graph.roots.push(objects[2]);
    heap.full_collect(&mut graph).unwrap();
    // The last arena took the first one's slot.
    assert_eq!(heap.stats().arenas, 1);
    assert_eq!(heap.space.current_arena(), Some(0));
    assert!(heap.is_live(objects[2]));
    assert_eq!(heap.payload_len(objects[2]), size);

    let again = heap.alloc(ObjKind::Udata, size).unwrap();
    assert!(heap.is_live(again));
    assert_eq!(heap.stats().arenas, 2);
}

#[test]
fn sweep_starts_with_the_bump_arena() {
    let config = GcConfig {
        huge_threshold: GcConfig::MAX_HUGE_THRESHOLD,
        ..GcConfig::default()
    };
    let mut heap = Heap::with_config(config).unwrap();
    let mut graph = Graph::default();
    let size = GcConfig::MAX_HUGE_THRESHOLD - 2 * CELL_SIZE;
    let objects = [0; 3].map(|_| heap.alloc(ObjKind::Udata, size).unwrap());
    let huge = heap
        .alloc(ObjKind::Udata, GcConfig::MAX_HUGE_THRESHOLD + 1)
        .unwrap();
    assert!(huge.is_huge());
    assert_eq!(heap.space.current_arena(), Some(2));

    while heap.state() != GcState::Sweep {
        heap.single_step(&mut graph).unwrap();
    }
    heap.single_step(&mut graph).unwrap();
    assert!(!heap.is_live(objects[2]));
    assert!(heap.is_live(huge));
    assert!(heap.is_live(objects[0]));

    heap.single_step(&mut graph).unwrap();
    assert!(!heap.is_live(huge));
    assert!(heap.is_live(objects[0]));

    while heap.state() != GcState::Pause {
        heap.single_step(&mut graph).unwrap();
    }
    assert_eq!(heap.stats().total_bytes, 0);
}

#[test]
fn regreyed_huge_objects_are_queued_once() {
    let config = GcConfig {
        store_buffer_len: 1,
        ..GcConfig::default()
    };
    let mut heap = Heap::with_config(config).unwrap();
    let mut graph = Graph::default();
    let table = heap
        .alloc(ObjKind::Table, heap.config().huge_threshold)
        .unwrap();
    assert!(table.is_huge());
    graph.roots.push(table);

    heap.single_step(&mut graph).unwrap();
    assert_eq!(heap.state(), GcState::Propagate);
    // Unmarked and immediately re-marked by the drain, while still queued.
    heap.barrier_back(table);
    assert_eq!(heap.cell_state(table), CellState::Black);

    while heap.state() != GcState::Pause {
        heap.single_step(&mut graph).unwrap();
    }
    assert_eq!(graph.visits.get(&table), Some(&1));
    assert!(heap.is_live(table));
}
