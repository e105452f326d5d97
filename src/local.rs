//! Process-local fallback allocator.
//!
//! When a stream is gated off the shared pool, or a shared request fails
//! (budget exhausted, segment invalidated), CPU buffers come from here
//! instead. This is a malloc wrapper: allocations are plain heap memory,
//! invisible to other processes, and `convert` on the resulting buffers is
//! always empty.

use crate::buffer::CpuBuffer;

/// Purely process-local buffer allocator.
#[derive(Debug, Default)]
pub struct LocalMemoryPool {
    _private: (),
}

impl LocalMemoryPool {
    /// Create a new local pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed buffer of exactly `len` bytes on the heap.
    pub fn request(&self, len: usize) -> CpuBuffer {
        CpuBuffer::from_heap(vec![0u8; len].into_boxed_slice())
    }
}
