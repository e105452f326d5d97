//! The hybrid pool: shared pool objects, the auditor, cross-process
//! references, and the per-process facade.
//!
//! - [`PoolShared`]: size-keyed free-lists + allocation registry in the
//!   segment, one per pool kind
//! - [`AuditorShared`]: attached-process records and the sticky validity
//!   flag
//! - [`SharedBufferRef`] / [`IpcBufferRef`]: cross-process reference
//!   counting and handoff
//! - [`HybridMemoryPool`]: the facade a process allocates through

mod auditor;
mod hybrid;
mod refs;
mod shared;

pub use auditor::{AuditorShared, MAX_PROCESSES};
pub use hybrid::HybridMemoryPool;
pub use refs::{IpcBufferRef, PoolKind, SharedBufferRef};
pub use shared::{PoolShared, MAX_BINS, MAX_ENTRIES};
