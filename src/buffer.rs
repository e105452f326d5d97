//! Local buffer handles returned by the pool.
//!
//! A [`CpuBuffer`] or [`GpuBuffer`] is what callers hold: a cloneable local
//! handle whose *last* drop fires a release callback back into the pool's
//! local handle cache. The callback drops the cached cross-process reference,
//! which in turn runs the shared reclaimer once no process holds the buffer.
//!
//! # Safety
//!
//! Handles hand out views into memory that may be shared with other threads
//! and processes. As with any shared mapping, it is the caller's
//! responsibility to synchronize writes with concurrent readers.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::graphics::CpuView;

// =============================================================================
// CpuBuffer
// =============================================================================

/// How a [`CpuBuffer`]'s backing is released on last drop.
enum Release {
    /// Heap-backed (local fallback allocator): storage owned directly.
    Heap(#[allow(dead_code)] Box<[u8]>),
    /// Pool-backed: callback into the owning pool's local handle cache.
    Callback(Box<dyn Fn(*mut u8) + Send + Sync>),
    /// View into memory owned elsewhere (a mapped GPU region).
    View(#[allow(dead_code)] Arc<CpuView>),
}

struct CpuBufferInner {
    ptr: NonNull<u8>,
    len: usize,
    release: Release,
}

impl Drop for CpuBufferInner {
    fn drop(&mut self) {
        if let Release::Callback(f) = &self.release {
            f(self.ptr.as_ptr());
        }
        // Heap/View storage is dropped with the variant.
    }
}

// SAFETY: the pointer targets heap storage owned by the inner, or shared
// memory whose lifetime is held by the release variant. Release callbacks
// are required to be Send + Sync.
unsafe impl Send for CpuBufferInner {}
unsafe impl Sync for CpuBufferInner {}

/// A locally-owned handle over a byte region.
///
/// Cloning shares the handle; the release callback runs exactly once, when
/// the last clone drops. The empty handle (`CpuBuffer::empty()`) signals a
/// failed request. Equality is by underlying pointer.
#[derive(Clone)]
pub struct CpuBuffer {
    inner: Option<Arc<CpuBufferInner>>,
}

impl CpuBuffer {
    /// The empty handle: no backing memory, `len() == 0`.
    pub fn empty() -> Self {
        Self { inner: None }
    }

    /// Wrap heap storage (local fallback allocations).
    pub(crate) fn from_heap(storage: Box<[u8]>) -> Self {
        let len = storage.len();
        // NonNull::dangling for the zero-length box keeps the invariant
        // that ptr is never null while inner exists.
        let ptr = if len == 0 {
            NonNull::dangling()
        } else {
            // SAFETY: a non-empty box has a non-null data pointer.
            unsafe { NonNull::new_unchecked(storage.as_ptr() as *mut u8) }
        };
        Self {
            inner: Some(Arc::new(CpuBufferInner {
                ptr,
                len,
                release: Release::Heap(storage),
            })),
        }
    }

    /// Wrap a pool allocation; `release` runs on last drop.
    pub(crate) fn from_raw(
        ptr: NonNull<u8>,
        len: usize,
        release: Box<dyn Fn(*mut u8) + Send + Sync>,
    ) -> Self {
        Self {
            inner: Some(Arc::new(CpuBufferInner {
                ptr,
                len,
                release: Release::Callback(release),
            })),
        }
    }

    /// Wrap a mapped view owned elsewhere (no release callback).
    pub(crate) fn from_view(view: Arc<CpuView>) -> Self {
        Self {
            inner: Some(Arc::new(CpuBufferInner {
                ptr: view.ptr(),
                len: view.len(),
                release: Release::View(view),
            })),
        }
    }

    /// True if this is the empty handle.
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Length of the backing region in bytes (0 for the empty handle).
    pub fn len(&self) -> usize {
        self.inner.as_ref().map(|i| i.len).unwrap_or(0)
    }

    /// Raw pointer to the backing region (null for the empty handle).
    pub fn as_ptr(&self) -> *const u8 {
        self.inner
            .as_ref()
            .map(|i| i.ptr.as_ptr() as *const u8)
            .unwrap_or(std::ptr::null())
    }

    /// Mutable raw pointer to the backing region (null for the empty handle).
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner
            .as_ref()
            .map(|i| i.ptr.as_ptr())
            .unwrap_or(std::ptr::null_mut())
    }

    /// The backing region as a byte slice (empty for the empty handle).
    pub fn data(&self) -> &[u8] {
        match &self.inner {
            // SAFETY: ptr/len describe a live region held by inner.
            Some(i) => unsafe { std::slice::from_raw_parts(i.ptr.as_ptr(), i.len) },
            None => &[],
        }
    }

    /// The backing region as a mutable byte slice.
    ///
    /// Clones of this handle (and other processes) alias the same bytes;
    /// callers synchronize concurrent access.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &self.inner {
            // SAFETY: ptr/len describe a live region held by inner; aliasing
            // discipline is delegated to the caller (module docs).
            Some(i) => unsafe { std::slice::from_raw_parts_mut(i.ptr.as_ptr(), i.len) },
            None => &mut [],
        }
    }
}

impl PartialEq for CpuBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_ptr() == other.as_ptr()
    }
}

impl Eq for CpuBuffer {}

impl fmt::Debug for CpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuBuffer")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}

// =============================================================================
// GpuBuffer
// =============================================================================

/// Descriptor of a GPU external-memory allocation as seen by one process.
///
/// `handle` is the OS-level external-memory handle (a file descriptor on
/// POSIX); which process it is valid in depends on context. The shared pool
/// records carry the origin process's handle; local [`GpuBuffer`]s always
/// carry a handle valid in the local process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GpuBufferData {
    /// OS-level external-memory handle.
    pub handle: u64,
    /// Allocation size in bytes.
    pub size: u64,
    /// Graphics-API memory type index the allocation was made from.
    pub memory_type_index: u32,
}

struct GpuBufferInner {
    data: GpuBufferData,
    mapped: Option<Arc<CpuView>>,
    release: Box<dyn Fn(&GpuBufferData) + Send + Sync>,
}

impl Drop for GpuBufferInner {
    fn drop(&mut self) {
        (self.release)(&self.data);
    }
}

/// A locally-owned handle over a GPU external-memory allocation.
///
/// Carries the descriptor valid in the *local* process (the handle is
/// duplicated across process boundaries by
/// [`create_local_gpu`](crate::pool::HybridMemoryPool::create_local_gpu))
/// plus, for host-visible allocations, the mapped CPU view. The release
/// callback runs on last drop. Equality is by handle.
#[derive(Clone)]
pub struct GpuBuffer {
    inner: Option<Arc<GpuBufferInner>>,
}

impl GpuBuffer {
    /// The empty handle, returned by failed GPU requests.
    pub fn empty() -> Self {
        Self { inner: None }
    }

    pub(crate) fn new(
        data: GpuBufferData,
        mapped: Option<Arc<CpuView>>,
        release: Box<dyn Fn(&GpuBufferData) + Send + Sync>,
    ) -> Self {
        Self {
            inner: Some(Arc::new(GpuBufferInner {
                data,
                mapped,
                release,
            })),
        }
    }

    /// True if this is the empty handle.
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// The local descriptor, if any.
    pub fn data(&self) -> Option<&GpuBufferData> {
        self.inner.as_ref().map(|i| &i.data)
    }

    /// The local external-memory handle (0 for the empty handle).
    pub fn handle(&self) -> u64 {
        self.inner.as_ref().map(|i| i.data.handle).unwrap_or(0)
    }

    /// Allocation size in bytes (0 for the empty handle).
    pub fn size(&self) -> u64 {
        self.inner.as_ref().map(|i| i.data.size).unwrap_or(0)
    }

    /// The mapped CPU view for host-visible allocations.
    ///
    /// `None` for device-local buffers and the empty handle.
    pub fn mapped(&self) -> Option<CpuBuffer> {
        self.inner
            .as_ref()
            .and_then(|i| i.mapped.as_ref())
            .map(|v| CpuBuffer::from_view(Arc::clone(v)))
    }
}

impl PartialEq for GpuBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.handle() == other.handle()
    }
}

impl Eq for GpuBuffer {}

impl fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("handle", &self.handle())
            .field("size", &self.size())
            .field(
                "mapped",
                &self.inner.as_ref().is_some_and(|i| i.mapped.is_some()),
            )
            .finish()
    }
}

// =============================================================================
// AnyBuffer
// =============================================================================

/// Either kind of pool buffer, for generic probing.
#[derive(Clone, Debug)]
pub enum AnyBuffer {
    /// A CPU byte buffer.
    Cpu(CpuBuffer),
    /// A GPU external-memory buffer.
    Gpu(GpuBuffer),
}

impl From<CpuBuffer> for AnyBuffer {
    fn from(b: CpuBuffer) -> Self {
        AnyBuffer::Cpu(b)
    }
}

impl From<GpuBuffer> for AnyBuffer {
    fn from(b: GpuBuffer) -> Self {
        AnyBuffer::Gpu(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn test_empty_cpu_buffer() {
        let b = CpuBuffer::empty();
        assert!(b.is_empty());
        assert_eq!(b.len(), 0);
        assert!(b.as_ptr().is_null());
        assert_eq!(b.data(), &[] as &[u8]);
    }

    #[test]
    fn test_heap_buffer_read_write() {
        let mut b = CpuBuffer::from_heap(vec![0u8; 64].into_boxed_slice());
        assert!(!b.is_empty());
        assert_eq!(b.len(), 64);
        b.data_mut()[..5].copy_from_slice(b"hello");
        assert_eq!(&b.data()[..5], b"hello");
    }

    #[test]
    fn test_equality_by_pointer() {
        let a = CpuBuffer::from_heap(vec![1u8; 8].into_boxed_slice());
        let b = a.clone();
        let c = CpuBuffer::from_heap(vec![1u8; 8].into_boxed_slice());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(CpuBuffer::empty(), CpuBuffer::empty());
    }

    #[test]
    fn test_release_runs_once_on_last_drop() {
        let calls = StdArc::new(AtomicUsize::new(0));
        let mut storage = vec![0u8; 16];
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap();

        let calls2 = StdArc::clone(&calls);
        let b = CpuBuffer::from_raw(
            ptr,
            16,
            Box::new(move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let clone = b.clone();
        drop(b);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_gpu_buffer() {
        let g = GpuBuffer::empty();
        assert!(g.is_empty());
        assert_eq!(g.handle(), 0);
        assert!(g.data().is_none());
        assert!(g.mapped().is_none());
    }

    #[test]
    fn test_gpu_release_on_last_drop() {
        let calls = StdArc::new(AtomicUsize::new(0));
        let calls2 = StdArc::clone(&calls);
        let g = GpuBuffer::new(
            GpuBufferData {
                handle: 7,
                size: 4096,
                memory_type_index: 0,
            },
            None,
            Box::new(move |data| {
                assert_eq!(data.handle, 7);
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let clone = g.clone();
        assert_eq!(g, clone);
        drop(g);
        drop(clone);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
