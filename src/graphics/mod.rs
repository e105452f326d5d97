//! Graphics-API collaborator: external-memory allocation, mapping, freeing.
//!
//! The pool is generic over a [`GraphicsApi`]: anything that can hand out
//! OS-level external-memory handles (file descriptors on POSIX), map them
//! into the CPU address space, and free them. Three implementations ship:
//!
//! - [`VulkanGraphics`]: exports `OPAQUE_FD` external memory via Vulkan
//!   (feature `vulkan`);
//! - [`HostGraphics`]: memfd-backed stand-in with the same fd-as-handle
//!   ABI, for hosts without a GPU and for tests;
//! - [`NoGraphics`]: permanently inactive; every GPU request returns the
//!   empty buffer.

mod host;
#[cfg(feature = "vulkan")]
mod vulkan;

pub use host::HostGraphics;
#[cfg(feature = "vulkan")]
pub use vulkan::VulkanGraphics;

use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::Result;

/// A successful external-memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuAllocation {
    /// OS-level external-memory handle (a file descriptor on POSIX),
    /// valid in the allocating process. Never 0.
    pub handle: u64,
    /// Memory type index the allocation was made from; needed to map or
    /// import the handle.
    pub memory_type_index: u32,
}

/// A CPU mapping of an external-memory allocation.
///
/// Owns the mapping (and any import-side graphics object backing it);
/// dropping the view unmaps. The external handle itself is untouched.
pub struct CpuView {
    ptr: NonNull<u8>,
    len: usize,
    unmap: Option<Box<dyn FnOnce() + Send>>,
}

// SAFETY: the mapping is shared memory valid until unmap runs in Drop;
// the unmap closure is Send and only ever called once, with exclusive
// access, from Drop.
unsafe impl Send for CpuView {}
unsafe impl Sync for CpuView {}

impl CpuView {
    /// Wrap a mapping; `unmap` runs exactly once on drop.
    pub fn new(ptr: NonNull<u8>, len: usize, unmap: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            ptr,
            len,
            unmap: Some(unmap),
        }
    }

    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Mapping length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the mapping has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mapped bytes.
    pub fn data(&self) -> &[u8] {
        // SAFETY: ptr/len describe the live mapping.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for CpuView {
    fn drop(&mut self) {
        if let Some(unmap) = self.unmap.take() {
            unmap();
        }
    }
}

impl std::fmt::Debug for CpuView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuView").field("len", &self.len).finish()
    }
}

/// The graphics collaborator the pool allocates GPU buffers through.
pub trait GraphicsApi: Send + Sync {
    /// True while the backend can serve allocations. A permanently
    /// inactive backend makes every GPU request return the empty buffer.
    fn is_active(&self) -> bool;

    /// Allocate `size` bytes of external memory; `None` on failure.
    fn allocate(&self, size: u64, device_local: bool) -> Option<GpuAllocation>;

    /// Map an external-memory handle into the CPU address space.
    fn map(&self, handle: u64, size: u64, memory_type_index: u32) -> Result<CpuView>;

    /// Free an external-memory handle: the underlying allocation for
    /// handles this backend allocated, just the local handle for
    /// duplicated foreign ones.
    fn free(&self, handle: u64);
}

/// Permanently inactive backend.
#[derive(Debug, Default)]
pub struct NoGraphics;

impl GraphicsApi for NoGraphics {
    fn is_active(&self) -> bool {
        false
    }

    fn allocate(&self, _size: u64, _device_local: bool) -> Option<GpuAllocation> {
        None
    }

    fn map(&self, _handle: u64, _size: u64, _memory_type_index: u32) -> Result<CpuView> {
        Err(crate::error::Error::GraphicsUnavailable(
            "no graphics backend".into(),
        ))
    }

    fn free(&self, _handle: u64) {}
}

/// Pick the best available backend: Vulkan when it comes up, otherwise
/// an inactive stub (GPU requests will return empty buffers).
pub fn default_graphics() -> Arc<dyn GraphicsApi> {
    #[cfg(feature = "vulkan")]
    {
        match VulkanGraphics::new() {
            Ok(vk) => return Arc::new(vk),
            Err(err) => {
                tracing::debug!(%err, "vulkan unavailable, GPU pool disabled");
            }
        }
    }
    Arc::new(NoGraphics)
}
