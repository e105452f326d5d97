//! # crosspool
//!
//! A cross-process hybrid CPU/GPU buffer pool for cooperating processes on
//! a single host.
//!
//! CPU buffers live in a named shared-memory segment; GPU buffers are
//! external-memory allocations whose handles are duplicated across process
//! boundaries. Both are recycled through size-keyed LIFO free-lists kept in
//! the segment, with a cross-process reference count on every allocation: a
//! buffer returns to its free-list when the last handle in *any* process
//! drops. A background auditor detects crashed peers and tears the shared
//! region down before stale bookkeeping can corrupt the survivors.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use crosspool::prelude::*;
//! use std::sync::Arc;
//!
//! let segment = SharedSegment::create("my-app-pool", 64 * 1024 * 1024)?;
//! let pool = HybridMemoryPool::new(segment, default_graphics(), PoolConfig::default())?;
//!
//! // CPU buffer from the shared pool (stream-gated).
//! let buf = pool.get_buffer_from_pool(&StreamId::new("camera0"), 4096);
//!
//! // Hand it to another attached process.
//! let wrapper = pool.convert_cpu(&buf).expect("pool-backed");
//! let wire = wrapper.to_ipc(); // rkyv POD, send however you like
//!
//! // GPU buffer, host-visible.
//! let gpu = pool.get_gpu_buffer_from_pool(1 << 20, false);
//! ```
//!
//! ## Failure model
//!
//! Request-path failures are non-exceptional: budget exhaustion, an
//! inactive graphics backend, or an invalidated segment all yield empty
//! handles (and the stream-gated CPU path transparently falls back to a
//! process-local allocator). Once a peer dies the region is invalidated,
//! stickily; processes must detach and re-attach to a fresh segment.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod graphics;
pub mod local;
pub mod pool;
pub mod segment;
pub mod stream;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::buffer::{AnyBuffer, CpuBuffer, GpuBuffer, GpuBufferData};
    pub use crate::config::PoolConfig;
    pub use crate::error::{Error, Result};
    pub use crate::graphics::{default_graphics, GraphicsApi};
    pub use crate::pool::{HybridMemoryPool, IpcBufferRef, SharedBufferRef};
    pub use crate::segment::SharedSegment;
    pub use crate::stream::StreamId;
}

pub use error::{Error, Result};
