use cellgc::{Heap, ObjKind, WeakMode};

mod common;

use common::World;

#[test]
fn dead_values_are_cleared() {
    let mut world = World::new();
    let mut heap = Heap::new();
    let table = world.table(&mut heap, WeakMode::Values);
    let key = world.alloc(&mut heap, ObjKind::Udata);
    let dead = world.alloc(&mut heap, ObjKind::Udata);
    let kept_key = world.alloc(&mut heap, ObjKind::Udata);
    let kept = world.alloc(&mut heap, ObjKind::Udata);
    world.roots.extend([table, kept]);
    world.insert(&mut heap, table, key, dead);
    world.insert(&mut heap, table, kept_key, kept);

    world.collect(&mut heap);
    assert_eq!(world.entries(table), [(kept_key, kept)]);
    assert!(!heap.is_live(dead));
    // Keys of a weak-value table are strong.
    assert!(heap.is_live(key));
    assert!(heap.is_live(kept_key));
}

#[test]
fn dead_keys_are_cleared() {
    let mut world = World::new();
    let mut heap = Heap::new();
    let table = world.table(&mut heap, WeakMode::Keys);
    let dead = world.alloc(&mut heap, ObjKind::Udata);
    let value = world.alloc(&mut heap, ObjKind::Udata);
    let kept = world.alloc(&mut heap, ObjKind::Udata);
    world.roots.extend([table, kept]);
    world.insert(&mut heap, table, dead, value);
    world.insert(&mut heap, table, kept, value);

    world.collect(&mut heap);
    assert_eq!(world.entries(table), [(kept, value)]);
    assert!(!heap.is_live(dead));
    assert!(heap.is_live(value));
}

#[test]
fn fully_weak_tables_keep_nothing_alive() {
    let mut world = World::new();
    let mut heap = Heap::new();
    let table = world.table(&mut heap, WeakMode::Both);
    let key = world.alloc(&mut heap, ObjKind::Udata);
    let value = world.alloc(&mut heap, ObjKind::Udata);
    world.roots.extend([table, key]);
    world.insert(&mut heap, table, key, value);

    world.collect(&mut heap);
    assert!(world.entries(table).is_empty());
    assert!(heap.is_live(key));
    assert!(!heap.is_live(value));
}

#[test]
fn strings_are_never_weak() {
    let mut world = World::new();
    let mut heap = Heap::new();
    let table = world.table(&mut heap, WeakMode::Both);
    let key = heap.intern(b"key").unwrap();
    let value = heap.intern(b"value").unwrap();
    world.roots.push(table);
    world.insert(&mut heap, table, key, value);

    world.collect(&mut heap);
    world.collect(&mut heap);
    assert_eq!(world.entries(table), [(key, value)]);
    assert!(heap.is_live(key));
    assert_eq!(heap.str_bytes(value), b"value");
    assert_eq!(heap.intern(b"value").unwrap(), value);
}

#[test]
fn objects_awaiting_finalization_are_cleared() {
    let mut world = World::new();
    let mut heap = Heap::new();
    let table = world.table(&mut heap, WeakMode::Values);
    let key = heap.intern(b"pending").unwrap();
    let doomed = world.alloc(&mut heap, ObjKind::Udata);
    world.roots.push(table);
    world.insert(&mut heap, table, key, doomed);
    heap.register_finalizer(doomed);

    world.collect(&mut heap);
    assert_eq!(world.finalized, [doomed]);
    assert!(world.entries(table).is_empty());
    // Still allocated: it was kept alive for its finalizer.
    assert!(heap.is_live(doomed));
}

#[test]
fn weak_tables_found_in_the_atomic_phase_are_cleared() {
    let mut world = World::new();
    let mut heap = Heap::new();
    let holder = world.table(&mut heap, WeakMode::None);
    world.roots.push(holder);
    heap.single_step(&mut world).unwrap();
    world.run_until(&mut heap, cellgc::GcState::Atomic);

    // A weak table reachable only through a store made after propagation.
    let table = world.table(&mut heap, WeakMode::Values);
    let value = world.alloc(&mut heap, ObjKind::Udata);
    world.insert(&mut heap, table, value, value);
    world.link(&mut heap, holder, table);

    world.run_until(&mut heap, cellgc::GcState::Pause);
    world.prune(&heap);
    assert!(heap.is_live(table));
    // The key kept the value alive, so the entry stays.
    assert_eq!(world.entries(table), [(value, value)]);
}
