use cellgc::{GcError, GcState, Heap, ObjKind};

mod common;

use common::World;

#[test]
fn finalizer_runs_once() {
    let mut world = World::new();
    let mut heap = Heap::new();
    let x = world.alloc(&mut heap, ObjKind::Udata);
    let child = world.alloc(&mut heap, ObjKind::Udata);
    world.link(&mut heap, x, child);
    heap.register_finalizer(x);
    heap.register_finalizer(x);

    world.collect(&mut heap);
    assert_eq!(world.finalized, [x]);
    // The finalizer saw the object and everything it references.
    world.assert_intact(&heap, x);
    world.assert_intact(&heap, child);
    assert_eq!(world.hooks, [true, false]);
    assert_eq!(world.thresholds, [usize::MAX]);
    assert_ne!(heap.stats().threshold, usize::MAX);

    world.collect(&mut heap);
    assert_eq!(world.finalized, [x]);
    assert!(!heap.is_live(x));
    assert!(!heap.is_live(child));
}

#[test]
fn resurrected_object_is_not_finalized_again() {
    let mut world = World::new();
    world.resurrect = true;
    let mut heap = Heap::new();
    let x = world.alloc(&mut heap, ObjKind::Udata);
    heap.register_finalizer(x);

    world.collect(&mut heap);
    assert_eq!(world.finalized, [x]);
    assert_eq!(world.roots, [x]);

    world.collect(&mut heap);
    world.collect(&mut heap);
    world.assert_intact(&heap, x);
    assert_eq!(world.finalized, [x]);

    // Registering again arms the finalizer for the next death.
    heap.register_finalizer(x);
    world.roots.clear();
    world.resurrect = false;
    world.collect(&mut heap);
    assert_eq!(world.finalized, [x, x]);
}

#[test]
fn reachable_objects_keep_their_finalizers() {
    let mut world = World::new();
    let mut heap = Heap::new();
    let x = world.alloc(&mut heap, ObjKind::Udata);
    world.roots.push(x);
    heap.register_finalizer(x);

    world.collect(&mut heap);
    world.collect(&mut heap);
    assert!(world.finalized.is_empty());

    world.roots.clear();
    world.collect(&mut heap);
    assert_eq!(world.finalized, [x]);
}

#[test]
fn declined_objects_are_swept_directly() {
    let mut world = World::new();
    let mut heap = Heap::new();
    let x = world.alloc(&mut heap, ObjKind::Udata);
    heap.register_finalizer(x);
    world.declined.push(x);

    world.collect(&mut heap);
    assert!(world.finalized.is_empty());
    assert!(!heap.is_live(x));
}

#[test]
fn huge_objects_are_finalized() {
    let mut world = World::new();
    let mut heap = Heap::new();
    let size = heap.config().huge_threshold * 2;
    let x = heap.alloc(ObjKind::Udata, size).unwrap();
    heap.register_finalizer(x);

    world.collect(&mut heap);
    assert_eq!(world.finalized, [x]);
    world.assert_intact(&heap, x);
    world.collect(&mut heap);
    assert!(!heap.is_live(x));
    assert_eq!(heap.stats().huge_blocks, 0);
}

#[test]
fn failing_finalizer_does_not_stop_the_others() {
    let mut world = World::new();
    let mut heap = Heap::new();
    let objects = [0; 3].map(|_| world.alloc(&mut heap, ObjKind::Udata));
    for obj in objects {
        heap.register_finalizer(obj);
    }
    world.failing.push(objects[1]);

    let mut errors = 0;
    loop {
        match heap.full_collect(&mut world) {
            Ok(()) => break,
            Err(GcError::Finalizer(err)) => {
                assert!(err.to_string().contains("failed"));
                errors += 1;
            }
            Err(other) => panic!("unexpected error {other}"),
        }
    }
    assert_eq!(errors, 1);
    let mut finalized = world.finalized.clone();
    finalized.sort_unstable();
    let mut expected = objects.to_vec();
    expected.sort_unstable();
    assert_eq!(finalized, expected);
    // Hooks were resumed even for the failing finalizer.
    assert_eq!(world.hooks.len(), 6);
    assert_eq!(world.hooks.last(), Some(&false));
    assert_eq!(heap.state(), GcState::Pause);
}

#[test]
fn freeing_a_registered_object_drops_the_registration() {
    let mut world = World::new();
    let mut heap = Heap::new();
    let x = world.alloc(&mut heap, ObjKind::Udata);
    heap.register_finalizer(x);
    heap.fix(x);
    heap.free(x, common::OBJECT_SIZE);

    world.collect(&mut heap);
    assert!(world.finalized.is_empty());
    assert_eq!(heap.stats().total_bytes, 0);
}
