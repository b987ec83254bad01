use crate::error::FinalizerError;
use crate::object::{GcRef, ObjKind};
use crate::trace::{Tracer, WeakMode};
use crate::Heap;

/// The object model a [`Heap`] collects for.
///
/// The heap only knows object kinds, sizes and liveness. Everything else,
/// including where references are stored inside an object, is answered by
/// the host through this trait.
pub trait Host {
    /// Marks every root: execution stacks, registries, globals.
    ///
    /// Called when a cycle starts and again during the atomic phase.
    fn enumerate_roots(&mut self, tracer: &mut Tracer);

    /// Marks every reference held by `obj`.
    ///
    /// Tables should report their entries through [`Tracer::mark_key`] and
    /// [`Tracer::mark_value`] so that weak sides are honoured.
    fn traverse(&mut self, obj: GcRef, kind: ObjKind, tracer: &mut Tracer);

    /// The cost in bytes of traversing `obj`, charged against the step
    /// budget.
    fn size_of(&self, obj: GcRef, kind: ObjKind) -> usize;

    /// Whether an unreachable object registered with
    /// [`Heap::register_finalizer`] still needs its finalizer to run.
    fn is_finalizable(&self, obj: GcRef) -> bool {
        let _ = obj;
        true
    }

    /// Runs the finalizer of `obj`. The object stays valid for the duration
    /// of the call and may be made reachable again.
    ///
    /// # Errors
    ///
    /// Errors are returned from the collector step that ran the finalizer.
    fn run_finalizer(&mut self, heap: &mut Heap, obj: GcRef) -> Result<(), FinalizerError> {
        let _ = (heap, obj);
        Ok(())
    }

    /// The weak mode of a table object.
    fn weak_mode(&self, table: GcRef) -> WeakMode {
        let _ = table;
        WeakMode::None
    }

    /// Removes every entry of a weak `table` whose weak key or value is
    /// reported dead by `is_dead`.
    fn clear_weak(&mut self, table: GcRef, is_dead: &mut dyn FnMut(GcRef) -> bool) {
        let _ = (table, is_dead);
    }

    /// Suspends (`true`) or resumes (`false`) hooks and trace recording
    /// around finalizer calls.
    fn suspend_hooks(&mut self, suspended: bool) {
        let _ = suspended;
    }
}
