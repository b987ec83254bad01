use thiserror::Error;

/// The error a host finalizer may fail with.
pub type FinalizerError = Box<dyn std::error::Error + Send + Sync>;

/// A failed allocation. Allocations are never retried.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum AllocError {
    /// The global allocator could not provide `size` bytes.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory {
        /// The number of bytes requested from the global allocator.
        size: usize,
    },
    /// The request cannot be described by a memory layout or an object
    /// header.
    #[error("allocation of {size} bytes exceeds the maximum object size")]
    TooLarge {
        /// The requested payload size.
        size: usize,
    },
}

/// An error returned by a collector step.
#[derive(Error, Debug)]
pub enum GcError {
    /// A full collection was requested while a compiled trace is running.
    #[error("cannot collect while a compiled trace is active")]
    TraceActive,
    /// A host finalizer failed. The collector's own state is consistent and
    /// collection can continue.
    #[error("finalizer failed")]
    Finalizer(#[source] FinalizerError),
}

/// An invalid [`GcConfig`](crate::GcConfig).
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// A setting that must be positive is zero.
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
    /// The huge-block threshold is larger than an arena can hold.
    #[error("huge threshold {threshold} exceeds the {max} bytes available in an arena")]
    HugeThreshold {
        /// The configured threshold.
        threshold: usize,
        /// The largest usable threshold.
        max: usize,
    },
}
