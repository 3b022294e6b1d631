//! Error types for the thread scheduler, synchronization primitives and
//! allocator.

/// Failure modes of [`crate::scheduler::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    /// A thread tried to join itself.
    #[error("a thread cannot join itself")]
    SelfJoin,
    /// No thread with that id exists (already reaped, or never existed).
    #[error("no such thread")]
    NotFound,
    /// Another thread is already observing (joined on) this target.
    #[error("thread is already being joined by another thread")]
    AlreadyObserved,
    /// Joining this target would close a cycle in the observer chain —
    /// every thread in it is waiting on a join that can never resolve.
    /// Detected *before* suspending, so the caller is left runnable.
    #[error("joining this thread would deadlock")]
    Deadlock,
}

/// Failure modes of [`crate::gc::GcHeap::allocate`] and
/// [`crate::gc::GcHeap::new`].
///
/// A finalizer calling `allocate` reentrantly is not represented here:
/// that condition is fatal and aborts via `panic!` rather than returning
/// an error (see [`crate::gc::GcHeap::allocate`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// No free block, even after a collection, was large enough.
    #[error("out of memory")]
    OutOfMemory,
    /// The requested arena size was zero or would not fit the 62-bit
    /// payload field of a block header (`size > SIZE_MASK`).
    #[error("requested heap size is zero or too large to represent")]
    InvalidSize,
}
