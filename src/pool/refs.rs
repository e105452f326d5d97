//! Cross-process reference-counted buffer wrappers.
//!
//! A [`SharedBufferRef`] is the local face of one pool entry's shared
//! reference count: cloning increments it, dropping decrements it, and the
//! last drop anywhere on the host runs the reclaimer, which relocks the
//! pool's `buffers_mutex` and pushes the entry back onto its size bin.
//! The reclaimer never decrements `allocated` and never frees backing
//! memory: that happens only at segment teardown (or, for GPU buffers,
//! when their origin process detaches).
//!
//! [`IpcBufferRef`] is the POD wire form for handing a wrapper to another
//! attached process; reviving it re-checks the entry's generation so a
//! reference that raced a teardown fails instead of aliasing a recycled
//! entry.

use std::ptr::NonNull;
use std::sync::Arc;

use super::auditor::AuditorShared;
use super::shared::PoolShared;
use crate::segment::SharedSegment;

/// Which pool a shared reference belongs to.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub enum PoolKind {
    /// The CPU byte-buffer pool.
    Cpu,
    /// The host-visible GPU pool.
    GpuHostVisible,
    /// The device-local GPU pool.
    GpuDeviceLocal,
}

/// Serializable reference to a pool entry, for cross-process handoff.
///
/// Transport is the embedding framework's concern; both ends must be
/// attached to the same segment. Revive with
/// [`HybridMemoryPool::ref_from_ipc`](super::HybridMemoryPool::ref_from_ipc).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct IpcBufferRef {
    /// Pool the entry belongs to.
    pub kind: PoolKind,
    /// Entry index within the pool.
    pub entry: u32,
    /// Entry generation at capture time.
    pub generation: u32,
}

/// A strong cross-process reference to one pool entry.
pub struct SharedBufferRef {
    segment: Arc<SharedSegment>,
    pool: NonNull<PoolShared>,
    auditor: NonNull<AuditorShared>,
    kind: PoolKind,
    entry: u32,
    generation: u32,
}

// SAFETY: pool/auditor point into the mapping kept alive by `segment`;
// all shared mutation is atomic or mutex-guarded.
unsafe impl Send for SharedBufferRef {}
unsafe impl Sync for SharedBufferRef {}

impl SharedBufferRef {
    /// Adopt an existing reference count (the request paths set the entry's
    /// refcount to 1 and then adopt it; no increment happens here).
    ///
    /// # Safety
    ///
    /// The entry must be IN_USE with a refcount that already includes the
    /// reference being adopted, and `pool`/`auditor` must point into
    /// `segment`'s mapping.
    pub(crate) unsafe fn adopt(
        segment: Arc<SharedSegment>,
        pool: NonNull<PoolShared>,
        auditor: NonNull<AuditorShared>,
        kind: PoolKind,
        entry: u32,
    ) -> Self {
        let generation = unsafe { pool.as_ref() }.entry(entry).generation();
        Self {
            segment,
            pool,
            auditor,
            kind,
            entry,
            generation,
        }
    }

    fn pool(&self) -> &PoolShared {
        // SAFETY: self.segment keeps the mapping alive.
        unsafe { self.pool.as_ref() }
    }

    fn auditor(&self) -> &AuditorShared {
        // SAFETY: self.segment keeps the mapping alive.
        unsafe { self.auditor.as_ref() }
    }

    /// The pool this reference belongs to.
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Entry index within the pool.
    pub fn entry_index(&self) -> u32 {
        self.entry
    }

    /// Buffer size in bytes.
    pub fn size(&self) -> u64 {
        self.pool().entry(self.entry).size()
    }

    /// Payload word: segment offset (CPU) or origin external handle (GPU).
    pub fn payload(&self) -> u64 {
        self.pool().entry(self.entry).payload()
    }

    /// PID of the allocating process.
    pub fn origin_pid(&self) -> u64 {
        self.pool().entry(self.entry).origin_pid()
    }

    /// Graphics memory type index (GPU pools).
    pub fn memory_type(&self) -> u32 {
        self.pool().entry(self.entry).memory_type()
    }

    /// Current shared reference count (diagnostics).
    pub fn refcount(&self) -> u32 {
        self.pool().entry(self.entry).refcount()
    }

    /// POD form for cross-process handoff.
    pub fn to_ipc(&self) -> IpcBufferRef {
        IpcBufferRef {
            kind: self.kind,
            entry: self.entry,
            generation: self.generation,
        }
    }

    /// Revive a reference from its POD form against the same pool mapping.
    ///
    /// Fails if the entry has been torn down or recycled since capture
    /// (generation mismatch) or has already hit refcount zero.
    pub(crate) fn from_ipc(
        segment: Arc<SharedSegment>,
        pool: NonNull<PoolShared>,
        auditor: NonNull<AuditorShared>,
        ipc: IpcBufferRef,
    ) -> Option<Self> {
        let shared = unsafe { pool.as_ref() };
        let entry = shared.entry(ipc.entry);
        if entry.generation() != ipc.generation {
            return None;
        }
        if !entry.try_inc_ref() {
            return None;
        }
        // Re-check after taking our count: a racing teardown may have
        // recycled the entry between the checks.
        if entry.generation() != ipc.generation {
            entry.dec_ref();
            return None;
        }
        Some(Self {
            segment,
            pool,
            auditor,
            kind: ipc.kind,
            entry: ipc.entry,
            generation: ipc.generation,
        })
    }
}

impl Clone for SharedBufferRef {
    fn clone(&self) -> Self {
        self.pool().entry(self.entry).inc_ref();
        Self {
            segment: Arc::clone(&self.segment),
            pool: self.pool,
            auditor: self.auditor,
            kind: self.kind,
            entry: self.entry,
            generation: self.generation,
        }
    }
}

impl Drop for SharedBufferRef {
    fn drop(&mut self) {
        let pool = self.pool();
        if !pool.entry(self.entry).dec_ref() {
            return;
        }
        // Last reference anywhere: run the reclaimer.
        let guard = pool.buffers_mutex.lock();
        if guard.recovered() {
            tracing::warn!(
                entry = self.entry,
                "pool mutex recovered from dead owner during reclaim; invalidating region"
            );
            self.auditor().invalidate();
        }
        if !pool.push_free(self.entry) {
            tracing::warn!(
                entry = self.entry,
                size = pool.entry(self.entry).size(),
                "bin table full; entry stranded until teardown"
            );
        }
    }
}

impl PartialEq for SharedBufferRef {
    fn eq(&self, other: &Self) -> bool {
        self.pool == other.pool && self.entry == other.entry && self.generation == other.generation
    }
}

impl Eq for SharedBufferRef {}

impl std::fmt::Debug for SharedBufferRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBufferRef")
            .field("kind", &self.kind)
            .field("entry", &self.entry)
            .field("generation", &self.generation)
            .field("refcount", &self.refcount())
            .finish()
    }
}
