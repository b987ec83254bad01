use crate::object::{GcRef, ObjKind};
use crate::space::Space;

/// Which side of a table does not keep its referents alive.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum WeakMode {
    /// Keys and values are strong.
    #[default]
    None,
    /// Keys are weak.
    Keys,
    /// Values are weak.
    Values,
    /// Keys and values are weak.
    Both,
}

impl WeakMode {
    /// Returns true if keys do not keep their referents alive.
    #[must_use]
    pub const fn weak_keys(self) -> bool {
        matches!(self, Self::Keys | Self::Both)
    }

    /// Returns true if values do not keep their referents alive.
    #[must_use]
    pub const fn weak_values(self) -> bool {
        matches!(self, Self::Values | Self::Both)
    }
}

/// Marks the objects reachable from a root set or from one traversed
/// object.
pub struct Tracer<'a> {
    space: &'a mut Space,
    mode: WeakMode,
}

impl<'a> Tracer<'a> {
    pub(crate) fn new(space: &'a mut Space, mode: WeakMode) -> Self {
        Self { space, mode }
    }

    /// Marks `obj` reachable. Objects that can hold references are queued
    /// for traversal; leaves are only marked.
    pub fn mark(&mut self, obj: GcRef) {
        self.space.mark(obj);
    }

    /// Marks a table key unless the traversed table has weak keys. String
    /// keys are always marked.
    pub fn mark_key(&mut self, key: GcRef) {
        if !self.mode.weak_keys() || self.is_string(key) {
            self.mark(key);
        }
    }

    /// Marks a table value unless the traversed table has weak values.
    /// String values are always marked.
    pub fn mark_value(&mut self, value: GcRef) {
        if !self.mode.weak_values() || self.is_string(value) {
            self.mark(value);
        }
    }

    fn is_string(&self, obj: GcRef) -> bool {
        // SAFETY: references handed to the tracer point at allocated
        // objects.
        unsafe { obj.kind() == ObjKind::Str }
    }

    /// The weak mode of the table being traversed. [`WeakMode::None`] for
    /// every other object and for roots.
    #[must_use]
    pub const fn weak_mode(&self) -> WeakMode {
        self.mode
    }

    /// Traces every reference held by `value`.
    pub fn trace<T>(&mut self, value: &T)
    where
        T: Trace + ?Sized,
    {
        if T::MAY_CONTAIN_REFERENCES {
            value.trace(self);
        }
    }
}

/// A host type that can hold references to managed objects.
///
/// This trait can be derived with `#[derive(Trace)]`.
pub trait Trace {
    /// When false, tracing values of this type is skipped entirely.
    const MAY_CONTAIN_REFERENCES: bool;

    /// Marks every managed object referenced by `self`.
    fn trace(&self, tracer: &mut Tracer);
}

/// A marker for types that never hold managed references.
pub trait NoReferences {}

impl<T> Trace for T
where
    T: NoReferences,
{
    const MAY_CONTAIN_REFERENCES: bool = false;

    fn trace(&self, _tracer: &mut Tracer) {}
}

impl NoReferences for () {}
impl NoReferences for bool {}
impl NoReferences for char {}
impl NoReferences for u8 {}
impl NoReferences for u16 {}
impl NoReferences for u32 {}
impl NoReferences for u64 {}
impl NoReferences for u128 {}
impl NoReferences for usize {}
impl NoReferences for i8 {}
impl NoReferences for i16 {}
impl NoReferences for i32 {}
impl NoReferences for i64 {}
impl NoReferences for i128 {}
impl NoReferences for isize {}
impl NoReferences for f32 {}
impl NoReferences for f64 {}
impl NoReferences for String {}

impl Trace for GcRef {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut Tracer) {
        tracer.mark(*self);
    }
}

impl<T> Trace for Option<T>
where
    T: Trace,
{
    const MAY_CONTAIN_REFERENCES: bool = T::MAY_CONTAIN_REFERENCES;

    fn trace(&self, tracer: &mut Tracer) {
        if let Some(value) = self {
            value.trace(tracer);
        }
    }
}

impl<T> Trace for Vec<T>
where
    T: Trace,
{
    const MAY_CONTAIN_REFERENCES: bool = T::MAY_CONTAIN_REFERENCES;

    fn trace(&self, tracer: &mut Tracer) {
        for item in self {
            item.trace(tracer);
        }
    }
}

impl<T, const N: usize> Trace for [T; N]
where
    T: Trace,
{
    const MAY_CONTAIN_REFERENCES: bool = T::MAY_CONTAIN_REFERENCES;

    fn trace(&self, tracer: &mut Tracer) {
        for item in self {
            item.trace(tracer);
        }
    }
}

impl<T> Trace for [T]
where
    T: Trace,
{
    const MAY_CONTAIN_REFERENCES: bool = T::MAY_CONTAIN_REFERENCES;

    fn trace(&self, tracer: &mut Tracer) {
        for item in self {
            item.trace(tracer);
        }
    }
}

impl<A, B> Trace for (A, B)
where
    A: Trace,
    B: Trace,
{
    const MAY_CONTAIN_REFERENCES: bool = A::MAY_CONTAIN_REFERENCES || B::MAY_CONTAIN_REFERENCES;

    fn trace(&self, tracer: &mut Tracer) {
        self.0.trace(tracer);
        self.1.trace(tracer);
    }
}
