//! Host (memfd) graphics backend.
//!
//! A software stand-in for a real graphics API that keeps the exact ABI the
//! pool relies on: handles are file descriptors, so cross-process
//! duplication through `/proc/<pid>/fd/<fd>` works the same way it does for
//! exported GPU memory. Useful on hosts without a GPU and throughout the
//! test suites. The `device_local` hint is accepted but meaningless here:
//! everything is host memory.

use std::ffi::CString;
use std::os::fd::{BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::ptr::NonNull;

use rustix::mm::{MapFlags, ProtFlags};

use super::{CpuView, GpuAllocation, GraphicsApi};
use crate::error::{Error, Result};

/// Memfd-backed [`GraphicsApi`] implementation.
#[derive(Debug, Default)]
pub struct HostGraphics {
    _private: (),
}

impl HostGraphics {
    /// Create the backend. Always active.
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphicsApi for HostGraphics {
    fn is_active(&self) -> bool {
        true
    }

    fn allocate(&self, size: u64, _device_local: bool) -> Option<GpuAllocation> {
        if size == 0 {
            return None;
        }
        let name = CString::new("crosspool-gpu").expect("static name");
        let fd = rustix::fs::memfd_create(&name, rustix::fs::MemfdFlags::CLOEXEC).ok()?;
        rustix::fs::ftruncate(&fd, size).ok()?;
        Some(GpuAllocation {
            handle: fd.into_raw_fd() as u64,
            memory_type_index: 0,
        })
    }

    fn map(&self, handle: u64, size: u64, _memory_type_index: u32) -> Result<CpuView> {
        let len = size as usize;
        // SAFETY: the handle is an fd owned by the caller; we only borrow
        // it for the mmap call, and the mapping outlives the fd.
        let fd = unsafe { BorrowedFd::borrow_raw(handle as i32) };
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        let raw = ptr.as_ptr() as usize;
        Ok(CpuView::new(
            ptr,
            len,
            Box::new(move || {
                // SAFETY: unmapping the exact region mapped above.
                unsafe {
                    let _ = rustix::mm::munmap(raw as *mut _, len);
                }
            }),
        ))
    }

    fn free(&self, handle: u64) {
        if handle == 0 {
            return;
        }
        // SAFETY: the handle is an fd we (or a duplication) own; dropping
        // the OwnedFd closes it.
        drop(unsafe { OwnedFd::from_raw_fd(handle as i32) });
    }
}
