//! Shared-memory segment: named mapping, managed interior, robust mutexes.
//!
//! - [`SharedSegment`]: named file-backed mapping with a named-object
//!   directory and an anonymous block allocator; offsets are stable across
//!   processes.
//! - [`ShmMutex`]: cross-process mutual exclusion with owner-death
//!   detection and recovery reporting.

mod mutex;
mod shm;

pub use mutex::{ShmMutex, ShmMutexGuard};
pub use shm::{SharedObject, SharedSegment, MAX_NAMED_OBJECTS, MAX_OBJECT_NAME};

pub(crate) use mutex::{pid_is_alive, self_pid};
