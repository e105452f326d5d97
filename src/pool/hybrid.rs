//! The hybrid memory pool facade.
//!
//! [`HybridMemoryPool`] ties the pieces together for one process: it
//! resolves the four named objects in the segment (three pools plus the
//! auditor), registers the process, serves CPU and GPU buffer requests from
//! the shared free-lists (falling back to a local allocator when gated or
//! exhausted), duplicates foreign GPU handles into the local process, and
//! runs the background liveness loop that tears the region down when a
//! peer dies.
//!
//! # Locking
//!
//! Request paths hold at most one shared pool mutex at a time and take the
//! process-local cache mutex separately, never nested inside each other in
//! reverse. The teardown paths order `Auditor.mutex` -> pool mutexes
//! (`buffers_mutex` -> `sizes_mutex`); nothing takes them the other way
//! around.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crate::buffer::{AnyBuffer, CpuBuffer, GpuBuffer, GpuBufferData};
use crate::config::{
    PoolConfig, AUDITOR_NAME, MEMORY_POOL_GPU_DEVICE_LOCAL_NAME, MEMORY_POOL_GPU_NAME,
    MEMORY_POOL_NAME,
};
use crate::error::Result;
use crate::graphics::{CpuView, GraphicsApi};
use crate::local::LocalMemoryPool;
use crate::segment::{self_pid, SharedSegment};
use crate::stream::StreamId;

use super::auditor::AuditorShared;
use super::refs::{IpcBufferRef, PoolKind, SharedBufferRef};
use super::shared::PoolShared;

/// Emit rate-limited warnings on the 1st occurrence and every Nth after.
const WARN_EVERY: u64 = 100;

/// Emit trace-level allocation accounting every Nth slow-path allocation.
const TRACE_EVERY: u64 = 100;

/// Process-local handle caches, the original's `memoryMutex_`-guarded maps.
#[derive(Default)]
struct LocalCaches {
    /// Live local CPU pointers -> their shared wrappers.
    ptrs: HashMap<usize, SharedBufferRef>,
    /// Live local GPU handles -> their shared wrappers.
    handles_gpu: HashMap<u64, SharedBufferRef>,
    /// Local GPU handle -> CPU mapping, cached until detach.
    gpu_mapped: HashMap<u64, Arc<CpuView>>,
    /// Origin handle -> locally duplicated handle.
    gpu_handle_proc_map: HashMap<u64, u64>,
}

/// The local cache cell buffer deleters point back into.
///
/// Deleters hold a `Weak` to this (plus the segment mapping), so a buffer
/// that outlives its pool degrades to a no-op release instead of dangling.
struct LocalState {
    caches: Mutex<LocalCaches>,
}

impl LocalState {
    /// Drop the cached wrapper *outside* the cache mutex: its reclaimer
    /// takes a shared pool mutex, and pool mutex -> cache mutex is the
    /// only permitted nesting order.
    fn destroy_local_cpu(&self, addr: usize) {
        let wrapper = {
            let mut caches = self.caches.lock().expect("local cache mutex poisoned");
            caches.ptrs.remove(&addr)
        };
        drop(wrapper);
    }

    fn destroy_local_gpu(&self, handle: u64) {
        let wrapper = {
            let mut caches = self.caches.lock().expect("local cache mutex poisoned");
            caches.handles_gpu.remove(&handle)
        };
        drop(wrapper);
    }
}

/// Cross-process hybrid CPU/GPU buffer pool, one instance per process.
pub struct HybridMemoryPool {
    segment: Arc<SharedSegment>,
    graphics: Arc<dyn GraphicsApi>,

    pool_cpu: NonNull<PoolShared>,
    pool_gpu: NonNull<PoolShared>,
    pool_gpu_device_local: NonNull<PoolShared>,
    auditor: NonNull<AuditorShared>,

    cpu_cap: u64,
    gpu_budget: u64,
    force_clean: bool,
    registered: bool,

    local: Arc<LocalState>,
    local_pool: LocalMemoryPool,
    streams: Mutex<HashMap<StreamId, bool>>,

    stop_signal: Arc<AtomicBool>,
    auditor_thread: Option<JoinHandle<()>>,

    shm_failures: AtomicU64,
    cpu_allocations: AtomicU64,
    gpu_allocations: AtomicU64,
}

// SAFETY: the NonNull fields point into the mapping kept alive by
// `segment`; all shared mutation is atomic or mutex-guarded.
unsafe impl Send for HybridMemoryPool {}
unsafe impl Sync for HybridMemoryPool {}

/// Sendable (segment, auditor) pair for the liveness loop thread.
struct AuditorHandle {
    segment: Arc<SharedSegment>,
    auditor: NonNull<AuditorShared>,
}

// SAFETY: auditor points into the mapping kept alive by segment.
unsafe impl Send for AuditorHandle {}

impl HybridMemoryPool {
    /// Attach to the shared region.
    ///
    /// Resolves or constructs the four named objects, then, under the
    /// auditor mutex, audits the region: if it holds, this process is
    /// recorded and (when configured) the liveness loop starts; otherwise
    /// the region is invalidated and every subsequent request falls back
    /// to local-only behavior.
    pub fn new(
        segment: Arc<SharedSegment>,
        graphics: Arc<dyn GraphicsApi>,
        config: PoolConfig,
    ) -> Result<Self> {
        let pool_cpu = segment.find_or_construct::<PoolShared>(MEMORY_POOL_NAME)?;
        let pool_gpu = segment.find_or_construct::<PoolShared>(MEMORY_POOL_GPU_NAME)?;
        let pool_gpu_device_local =
            segment.find_or_construct::<PoolShared>(MEMORY_POOL_GPU_DEVICE_LOCAL_NAME)?;
        let auditor = segment.find_or_construct::<AuditorShared>(AUDITOR_NAME)?;

        let registered = {
            // SAFETY: auditor points into `segment`'s live mapping.
            let auditor = unsafe { auditor.as_ref() };
            let guard = auditor.mutex.lock();
            if guard.recovered() {
                auditor.invalidate();
            }
            if auditor.audit() {
                if auditor.register_self() {
                    true
                } else {
                    tracing::warn!("auditor process table full; attaching invalidated region");
                    auditor.invalidate();
                    false
                }
            } else {
                tracing::warn!("audit failed on attach; region invalidated");
                auditor.invalidate();
                false
            }
        };

        let mut pool = Self {
            segment,
            graphics,
            pool_cpu,
            pool_gpu,
            pool_gpu_device_local,
            auditor,
            cpu_cap: config.cpu_cap(),
            gpu_budget: config.gpu_budget,
            force_clean: config.force_clean,
            registered,
            local: Arc::new(LocalState {
                caches: Mutex::new(LocalCaches::default()),
            }),
            local_pool: LocalMemoryPool::new(),
            streams: Mutex::new(HashMap::new()),
            stop_signal: Arc::new(AtomicBool::new(false)),
            auditor_thread: None,
            shm_failures: AtomicU64::new(0),
            cpu_allocations: AtomicU64::new(0),
            gpu_allocations: AtomicU64::new(0),
        };

        if pool.registered && config.enable_auditor {
            pool.spawn_liveness_loop(config.audit_interval, config.nuke_hook)?;
        }

        Ok(pool)
    }

    fn spawn_liveness_loop(
        &mut self,
        interval: std::time::Duration,
        nuke_hook: Option<crate::config::NukeHook>,
    ) -> Result<()> {
        let stop = Arc::clone(&self.stop_signal);
        let handle = AuditorHandle {
            segment: Arc::clone(&self.segment),
            auditor: self.auditor,
        };

        let thread = std::thread::Builder::new()
            .name("crosspool-auditor".into())
            .spawn(move || {
                let handle = handle;
                // SAFETY: handle.segment keeps the mapping alive.
                let auditor = unsafe { handle.auditor.as_ref() };
                while !stop.load(Ordering::Acquire) {
                    // Sleep outside the mutex: the audit itself is the only
                    // critical section, so detach is never starved.
                    std::thread::sleep(interval);

                    let guard = auditor.mutex.lock();
                    if guard.recovered() {
                        auditor.invalidate();
                    }
                    if !auditor.audit() {
                        tracing::warn!("dead peer detected; tearing down shared region");
                        auditor.invalidate();
                        let nuked = match &nuke_hook {
                            Some(hook) => hook(),
                            None => Self::nuke(&handle.segment),
                        };
                        if !nuked {
                            tracing::error!("could not nuke shared region");
                        }
                        break;
                    }
                }
            })?;
        self.auditor_thread = Some(thread);
        Ok(())
    }

    /// Destroy the four named objects, recovering a corrupt segment.
    ///
    /// Used only after invalidation; attached processes must restart.
    pub fn nuke(segment: &SharedSegment) -> bool {
        segment.destroy(MEMORY_POOL_NAME);
        segment.destroy(MEMORY_POOL_GPU_NAME);
        segment.destroy(MEMORY_POOL_GPU_DEVICE_LOCAL_NAME);
        segment.destroy(AUDITOR_NAME);
        true
    }

    // =========================================================================
    // Shared-object accessors
    // =========================================================================

    fn pool_shared(&self, kind: PoolKind) -> &PoolShared {
        let ptr = match kind {
            PoolKind::Cpu => self.pool_cpu,
            PoolKind::GpuHostVisible => self.pool_gpu,
            PoolKind::GpuDeviceLocal => self.pool_gpu_device_local,
        };
        // SAFETY: points into the mapping kept alive by self.segment.
        unsafe { ptr.as_ref() }
    }

    fn auditor_shared(&self) -> &AuditorShared {
        // SAFETY: points into the mapping kept alive by self.segment.
        unsafe { self.auditor.as_ref() }
    }

    /// The CPU pool's shared state (accounting and diagnostics).
    pub fn cpu_pool(&self) -> &PoolShared {
        self.pool_shared(PoolKind::Cpu)
    }

    /// A GPU pool's shared state (accounting and diagnostics).
    pub fn gpu_pool(&self, device_local: bool) -> &PoolShared {
        self.pool_shared(if device_local {
            PoolKind::GpuDeviceLocal
        } else {
            PoolKind::GpuHostVisible
        })
    }

    /// The shared auditor object.
    pub fn auditor(&self) -> &AuditorShared {
        self.auditor_shared()
    }

    /// True while the region has not been invalidated.
    pub fn is_valid(&self) -> bool {
        self.auditor_shared().is_valid()
    }

    /// Run the audit predicate under the auditor mutex.
    pub fn audit(&self) -> bool {
        let auditor = self.auditor_shared();
        let guard = auditor.mutex.lock();
        if guard.recovered() {
            auditor.invalidate();
        }
        auditor.audit()
    }

    /// Mark the region invalid. Sticky.
    pub fn invalidate(&self) {
        self.auditor_shared().invalidate();
    }

    // =========================================================================
    // CPU requests
    // =========================================================================

    /// Request `len` bytes from the shared CPU pool.
    ///
    /// Pops the most recently freed buffer of exactly `len` bytes, or
    /// allocates fresh segment memory while the budget allows. Returns the
    /// empty handle when the budget would be exceeded or the region is
    /// invalid.
    pub fn request_shm(&self, len: usize) -> CpuBuffer {
        if len == 0 || !self.is_valid() {
            return CpuBuffer::empty();
        }
        let pool = self.pool_shared(PoolKind::Cpu);
        let size = len as u64;

        // Fast path: recycle from the free-list (LIFO for cache warmth).
        let recycled = {
            let guard = pool.buffers_mutex.lock();
            if guard.recovered() {
                self.invalidate();
                return CpuBuffer::empty();
            }
            pool.bin_for_or_create(size).and_then(|bin| pool.pop_free(bin))
        };

        let index = match recycled {
            Some(index) => index,
            None => {
                let guard = pool.sizes_mutex.lock();
                if guard.recovered() {
                    self.invalidate();
                    return CpuBuffer::empty();
                }
                if self.cpu_allocations.fetch_add(1, Ordering::Relaxed) % TRACE_EVERY == 0 {
                    tracing::trace!(allocated = pool.allocated(), "shared CPU bytes allocated");
                }
                if pool.allocated() + size >= self.cpu_cap {
                    return CpuBuffer::empty();
                }
                let Some(offset) = self.segment.alloc_block(size) else {
                    tracing::warn!(len, "segment exhausted allocating CPU buffer");
                    return CpuBuffer::empty();
                };
                let Some(index) = pool.claim_entry(size, offset, 0, self_pid()) else {
                    tracing::warn!(len, "CPU pool entry table full");
                    self.segment.free_block(offset);
                    return CpuBuffer::empty();
                };
                pool.add_allocated(size);
                metrics::gauge!("crosspool_cpu_allocated_bytes").set(pool.allocated() as f64);
                index
            }
        };

        pool.entry(index).install_first_ref();
        // SAFETY: entry is IN_USE and its refcount counts the reference
        // being adopted; the pointers come from this segment.
        let wrapper = unsafe {
            SharedBufferRef::adopt(
                Arc::clone(&self.segment),
                self.pool_cpu,
                self.auditor,
                PoolKind::Cpu,
                index,
            )
        };
        self.install_cpu_handle(wrapper, len)
    }

    /// Record a CPU wrapper locally and hand out a buffer whose last drop
    /// releases the local reference.
    fn install_cpu_handle(&self, wrapper: SharedBufferRef, len: usize) -> CpuBuffer {
        let addr = self.segment.offset_to_ptr(wrapper.payload());
        let ptr = NonNull::new(addr).expect("segment payload is never at offset 0");

        let replaced = {
            let mut caches = self.local.caches.lock().expect("local cache mutex poisoned");
            caches.ptrs.insert(addr as usize, wrapper)
        };
        drop(replaced);

        let state = Arc::downgrade(&self.local);
        let mapping = Arc::clone(&self.segment);
        CpuBuffer::from_raw(
            ptr,
            len,
            Box::new(move |raw| {
                // Keep the mapping alive for the buffer's whole lifetime.
                let _mapping = &mapping;
                if let Some(state) = Weak::upgrade(&state) {
                    state.destroy_local_cpu(raw as usize);
                }
            }),
        )
    }

    /// Stream-gated CPU request.
    ///
    /// Unknown streams default to the shared pool; a stream explicitly
    /// gated off (or a failed shared request) is served by the local
    /// fallback allocator instead.
    pub fn get_buffer_from_pool(&self, id: &StreamId, len: usize) -> CpuBuffer {
        let shared = {
            let streams = self.streams.lock().expect("stream gate mutex poisoned");
            streams.get(id).copied().unwrap_or(true)
        };
        if shared {
            let shm = self.request_shm(len);
            if !shm.is_empty() {
                return shm;
            }
            if self.shm_failures.fetch_add(1, Ordering::Relaxed) % WARN_EVERY == 0 {
                tracing::warn!(
                    len,
                    stream = %id,
                    "failed to get shared memory buffer; allocating locally"
                );
            }
        }
        self.local_pool.request(len)
    }

    /// Set a stream's gate bit. Idempotent.
    pub fn activate_stream(&self, id: &StreamId, active: bool) {
        let mut streams = self.streams.lock().expect("stream gate mutex poisoned");
        streams.insert(id.clone(), active);
    }

    // =========================================================================
    // GPU requests
    // =========================================================================

    /// Scan a pool's free-list for a recyclable buffer of this size that
    /// originated in this process.
    ///
    /// A handle exported by another process is an opaque token in that
    /// process's fd table; reusing it here would cost a re-duplication,
    /// more than allocating fresh. Each process therefore recycles only
    /// its own entries.
    fn find_buffer(&self, pool: &PoolShared, size: u64) -> Option<u32> {
        let guard = pool.buffers_mutex.lock();
        if guard.recovered() {
            self.invalidate();
            return None;
        }
        let bin = pool.bin_for_or_create(size)?;
        pool.pop_free_origin(bin, self_pid())
    }

    /// Request a GPU buffer of `len` bytes from the shared GPU pool.
    ///
    /// Returns the empty handle when the graphics backend is inactive, the
    /// budget would be exceeded, or the region is invalid. Device-local
    /// buffers carry no CPU view.
    pub fn get_gpu_buffer_from_pool(&self, len: u64, device_local: bool) -> GpuBuffer {
        if !self.graphics.is_active() {
            tracing::warn!("cannot create GPU buffer: graphics backend inactive");
            return GpuBuffer::empty();
        }
        if len == 0 || !self.is_valid() {
            return GpuBuffer::empty();
        }

        let kind = if device_local {
            PoolKind::GpuDeviceLocal
        } else {
            PoolKind::GpuHostVisible
        };
        let pool = self.pool_shared(kind);

        let index = match self.find_buffer(pool, len) {
            Some(index) => index,
            None => {
                let guard = pool.sizes_mutex.lock();
                if guard.recovered() {
                    self.invalidate();
                    return GpuBuffer::empty();
                }
                if self.gpu_allocations.fetch_add(1, Ordering::Relaxed) % TRACE_EVERY == 0 {
                    tracing::trace!(
                        allocated = pool.allocated(),
                        device_local,
                        "GPU bytes allocated"
                    );
                }
                if pool.allocated() + len >= self.gpu_budget {
                    if self.shm_failures.fetch_add(1, Ordering::Relaxed) % WARN_EVERY == 0 {
                        tracing::warn!(
                            len,
                            budget = self.gpu_budget,
                            "GPU budget exhausted; returning empty buffer"
                        );
                    }
                    return GpuBuffer::empty();
                }

                let Some(allocation) = self.graphics.allocate(len, device_local) else {
                    tracing::warn!(len, "graphics allocation failed");
                    return GpuBuffer::empty();
                };
                let view = match self
                    .graphics
                    .map(allocation.handle, len, allocation.memory_type_index)
                {
                    Ok(view) => Arc::new(view),
                    Err(err) => {
                        tracing::warn!(%err, len, "mapping fresh GPU allocation failed");
                        self.graphics.free(allocation.handle);
                        return GpuBuffer::empty();
                    }
                };
                {
                    let mut caches =
                        self.local.caches.lock().expect("local cache mutex poisoned");
                    caches.gpu_mapped.insert(allocation.handle, view);
                }

                let Some(index) = pool.claim_entry(
                    len,
                    allocation.handle,
                    allocation.memory_type_index,
                    self_pid(),
                ) else {
                    tracing::warn!(len, "GPU pool entry table full");
                    self.local
                        .caches
                        .lock()
                        .expect("local cache mutex poisoned")
                        .gpu_mapped
                        .remove(&allocation.handle);
                    self.graphics.free(allocation.handle);
                    return GpuBuffer::empty();
                };
                pool.add_allocated(len);
                let pool_label = if device_local { "device_local" } else { "host_visible" };
                metrics::gauge!("crosspool_gpu_allocated_bytes", "pool" => pool_label)
                    .set(pool.allocated() as f64);
                index
            }
        };

        let entry = pool.entry(index);
        entry.install_first_ref();
        let data = GpuBufferData {
            handle: entry.payload(),
            size: len,
            memory_type_index: entry.memory_type(),
        };
        // SAFETY: entry is IN_USE and its refcount counts the reference
        // being adopted; the pointers come from this segment.
        let wrapper = unsafe {
            SharedBufferRef::adopt(
                Arc::clone(&self.segment),
                match kind {
                    PoolKind::GpuDeviceLocal => self.pool_gpu_device_local,
                    _ => self.pool_gpu,
                },
                self.auditor,
                kind,
                index,
            )
        };

        let mapped = {
            let mut caches = self.local.caches.lock().expect("local cache mutex poisoned");
            caches.handles_gpu.insert(data.handle, wrapper);
            if device_local {
                None
            } else {
                // Recycled entries were mapped when first allocated here;
                // map lazily if the cache was somehow cleared.
                match caches.gpu_mapped.get(&data.handle) {
                    Some(view) => Some(Arc::clone(view)),
                    None => match self.graphics.map(data.handle, len, data.memory_type_index) {
                        Ok(view) => {
                            let view = Arc::new(view);
                            caches.gpu_mapped.insert(data.handle, Arc::clone(&view));
                            Some(view)
                        }
                        Err(err) => {
                            tracing::warn!(%err, "re-mapping recycled GPU buffer failed");
                            None
                        }
                    },
                }
            }
        };

        self.make_gpu_buffer(data, mapped)
    }

    fn make_gpu_buffer(&self, data: GpuBufferData, mapped: Option<Arc<CpuView>>) -> GpuBuffer {
        let state = Arc::downgrade(&self.local);
        let mapping = Arc::clone(&self.segment);
        GpuBuffer::new(
            data,
            mapped,
            Box::new(move |data| {
                let _mapping = &mapping;
                if let Some(state) = Weak::upgrade(&state) {
                    state.destroy_local_gpu(data.handle);
                }
            }),
        )
    }

    // =========================================================================
    // Cross-process adoption
    // =========================================================================

    /// Make a CPU wrapper received from another process usable locally.
    pub fn create_local_cpu(&self, wrapper: SharedBufferRef) -> CpuBuffer {
        if wrapper.kind() != PoolKind::Cpu {
            tracing::warn!(kind = ?wrapper.kind(), "create_local_cpu on a GPU wrapper");
            return CpuBuffer::empty();
        }
        let len = wrapper.size() as usize;
        self.install_cpu_handle(wrapper, len)
    }

    /// Make a GPU wrapper received from another process usable locally.
    ///
    /// Duplicates the origin process's external-memory handle into this
    /// process (via `/proc/<origin>/fd/<handle>`), maps it, and returns a
    /// buffer carrying the local descriptor. On duplication failure the
    /// wrapper is not recorded and the empty handle is returned.
    pub fn create_local_gpu(&self, wrapper: SharedBufferRef) -> GpuBuffer {
        if wrapper.kind() == PoolKind::Cpu {
            tracing::warn!("create_local_gpu on a CPU wrapper");
            return GpuBuffer::empty();
        }
        let origin_handle = wrapper.payload();
        let origin_pid = wrapper.origin_pid();
        let size = wrapper.size();
        let memory_type_index = wrapper.memory_type();

        let mut caches = self.local.caches.lock().expect("local cache mutex poisoned");

        let local_handle = match caches.gpu_handle_proc_map.get(&origin_handle) {
            Some(handle) => *handle,
            None => match duplicate_foreign_handle(origin_pid, origin_handle) {
                Some(handle) => handle,
                None => {
                    tracing::warn!(
                        origin_handle,
                        origin_pid,
                        "failed to duplicate GPU handle into this process"
                    );
                    return GpuBuffer::empty();
                }
            },
        };
        caches.gpu_handle_proc_map.insert(origin_handle, local_handle);
        caches.handles_gpu.insert(local_handle, wrapper);

        if !caches.gpu_mapped.contains_key(&local_handle) {
            match self.graphics.map(local_handle, size, memory_type_index) {
                Ok(view) => {
                    caches.gpu_mapped.insert(local_handle, Arc::new(view));
                }
                Err(err) => {
                    tracing::debug!(%err, local_handle, "GPU buffer not CPU-mappable here");
                }
            }
        }
        let mapped = caches.gpu_mapped.get(&local_handle).cloned();
        drop(caches);

        self.make_gpu_buffer(
            GpuBufferData {
                handle: local_handle,
                size,
                memory_type_index,
            },
            mapped,
        )
    }

    /// Revive a wrapper from its serialized cross-process form.
    pub fn ref_from_ipc(&self, ipc: IpcBufferRef) -> Option<SharedBufferRef> {
        let pool = match ipc.kind {
            PoolKind::Cpu => self.pool_cpu,
            PoolKind::GpuHostVisible => self.pool_gpu,
            PoolKind::GpuDeviceLocal => self.pool_gpu_device_local,
        };
        SharedBufferRef::from_ipc(Arc::clone(&self.segment), pool, self.auditor, ipc)
    }

    // =========================================================================
    // Conversion and probing
    // =========================================================================

    /// The shared wrapper behind a CPU buffer, if it came from this pool.
    pub fn convert_cpu(&self, buffer: &CpuBuffer) -> Option<SharedBufferRef> {
        let caches = self.local.caches.lock().expect("local cache mutex poisoned");
        caches.ptrs.get(&(buffer.as_ptr() as usize)).cloned()
    }

    /// The shared wrapper behind a GPU buffer, if it came from this pool.
    pub fn convert_gpu(&self, buffer: &GpuBuffer) -> Option<SharedBufferRef> {
        let caches = self.local.caches.lock().expect("local cache mutex poisoned");
        caches.handles_gpu.get(&buffer.handle()).cloned()
    }

    /// The shared wrapper behind either buffer kind.
    pub fn convert(&self, buffer: &AnyBuffer) -> Option<SharedBufferRef> {
        match buffer {
            AnyBuffer::Cpu(b) => self.convert_cpu(b),
            AnyBuffer::Gpu(b) => self.convert_gpu(b),
        }
    }

    /// True if the buffer is backed by the shared pool.
    pub fn is_buffer_from_pool(&self, buffer: &AnyBuffer) -> bool {
        self.convert(buffer).is_some()
    }

    /// Request from the shared CPU pool and return the cross-process
    /// wrapper directly, bypassing the local handle.
    pub fn get_buffer_from_shared_pool_direct(&self, len: usize) -> Option<SharedBufferRef> {
        let buffer = self.request_shm(len);
        self.convert_cpu(&buffer)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Tear down one GPU pool's free-lists on detach.
    ///
    /// Every free-listed entry originated by this process is freed through
    /// the graphics API (only the origin can) and destroyed; in-flight
    /// buffers referenced by peers through duplicated handles are
    /// preserved. With `clear_allocations` (last process out) the whole
    /// registry is cleared.
    fn clean_pool(&self, kind: PoolKind, clear_allocations: bool) {
        let pool = self.pool_shared(kind);
        let _buffers = pool.buffers_mutex.lock();
        let _sizes = pool.sizes_mutex.lock();
        let me = self_pid();

        let mut own_free = Vec::new();
        if self.graphics.is_active() {
            pool.for_each_free(|index, entry| {
                if entry.origin_pid() == me {
                    own_free.push(index);
                }
            });
            for &index in &own_free {
                let entry = pool.entry(index);
                self.graphics.free(entry.payload());
                pool.sub_allocated(entry.size());
            }
        }

        pool.clear_free_lists();
        for index in own_free {
            pool.vacate(index);
        }

        if clear_allocations {
            pool.for_each_registered(|index, entry| {
                pool.sub_allocated(entry.size());
                pool.vacate(index);
            });
        }
    }
}

/// Duplicate another process's fd into this one (POSIX path: open the
/// origin's fd through procfs read-write).
fn duplicate_foreign_handle(origin_pid: u64, handle: u64) -> Option<u64> {
    use std::os::fd::IntoRawFd;

    let path = format!("/proc/{}/fd/{}", origin_pid, handle);
    match rustix::fs::open(
        path.as_str(),
        rustix::fs::OFlags::RDWR,
        rustix::fs::Mode::empty(),
    ) {
        Ok(fd) => Some(fd.into_raw_fd() as u64),
        Err(_) => None,
    }
}

impl Drop for HybridMemoryPool {
    fn drop(&mut self) {
        // 1. Drop all local CPU handles; each last-drop reclaims its entry.
        //    Wrappers drop outside the cache mutex (reclaimers take a pool
        //    mutex).
        let cpu_wrappers: Vec<SharedBufferRef> = {
            let mut caches = self.local.caches.lock().expect("local cache mutex poisoned");
            caches.ptrs.drain().map(|(_, w)| w).collect()
        };
        drop(cpu_wrappers);

        // 2. Stop and join the liveness loop.
        self.stop_signal.store(true, Ordering::Release);
        if let Some(thread) = self.auditor_thread.take() {
            let _ = thread.join();
        }

        let auditor = self.auditor_shared();
        let guard = auditor.mutex.lock();
        if guard.recovered() {
            auditor.invalidate();
        }

        // 3. Deregister this process.
        if self.registered {
            auditor.deregister_self();
        }
        if self.force_clean {
            auditor.clear_processes();
        }

        // 4. Last process out tears the CPU pool down entirely.
        let last = auditor.process_count() == 0;
        if last {
            auditor.invalidate();
            let pool = self.pool_shared(PoolKind::Cpu);
            let _buffers = pool.buffers_mutex.lock();
            let _sizes = pool.sizes_mutex.lock();
            pool.clear_free_lists();
            let mut payloads = Vec::new();
            pool.for_each_registered(|index, entry| {
                pool.sub_allocated(entry.size());
                payloads.push(entry.payload());
                pool.vacate(index);
            });
            for payload in payloads {
                self.segment.free_block(payload);
            }
        }

        // 5. Release local GPU handle caches; each GPU wrapper drop
        //    reclaims its entry onto the free-list, which clean_pool then
        //    sweeps.
        let (gpu_wrappers, mapped, duplicated): (Vec<SharedBufferRef>, Vec<Arc<CpuView>>, Vec<u64>) = {
            let mut caches = self.local.caches.lock().expect("local cache mutex poisoned");
            (
                caches.handles_gpu.drain().map(|(_, w)| w).collect(),
                caches.gpu_mapped.drain().map(|(_, v)| v).collect(),
                caches.gpu_handle_proc_map.drain().map(|(_, v)| v).collect(),
            )
        };
        drop(gpu_wrappers);
        drop(mapped);

        // 6. Sweep both GPU pools.
        self.clean_pool(PoolKind::GpuHostVisible, last);
        self.clean_pool(PoolKind::GpuDeviceLocal, last);

        // 7. Free locally duplicated handles.
        for handle in duplicated {
            self.graphics.free(handle);
        }
    }
}

impl std::fmt::Debug for HybridMemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridMemoryPool")
            .field("segment", &self.segment.path())
            .field("cpu_cap", &self.cpu_cap)
            .field("gpu_budget", &self.gpu_budget)
            .field("valid", &self.is_valid())
            .finish()
    }
}
