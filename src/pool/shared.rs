//! The in-segment pool object: size-keyed free-lists plus the allocation
//! registry.
//!
//! One [`PoolShared`] lives in the shared segment per pool kind (CPU,
//! GPU host-visible, GPU device-local). It is a fixed-capacity `#[repr(C)]`
//! table of all-atomic fields, so every process maps the identical layout:
//!
//! - the **entry table** is the allocation registry: every buffer currently
//!   charged against the pool's budget occupies one entry, which also holds
//!   the cross-process reference count and the free-list link;
//! - the **bin table** maps an exact byte size to the head of a LIFO
//!   free-list threaded through entries.
//!
//! Locking follows the two-mutex split of the original design:
//! `buffers_mutex` guards the bins and every free-list link, `sizes_mutex`
//! guards registry membership (entry claim/vacate) and the `allocated`
//! counter. Reference counts are atomic and need no mutex.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::segment::{SharedObject, ShmMutex};

/// Maximum number of distinct buffer sizes per pool.
pub const MAX_BINS: usize = 64;

/// Maximum number of live allocations per pool.
pub const MAX_ENTRIES: usize = 1024;

/// Entry states.
pub(crate) const ENTRY_VACANT: u32 = 0;
pub(crate) const ENTRY_IN_USE: u32 = 1;
pub(crate) const ENTRY_FREE: u32 = 2;

/// One allocation-registry record.
///
/// `payload` is the segment offset of the buffer bytes for CPU pools, and
/// the origin process's external-memory handle for GPU pools. Links are
/// stored as index+1 so 0 means "none".
#[repr(C)]
pub struct PoolEntry {
    state: AtomicU32,
    refcount: AtomicU32,
    /// Next entry (index+1) on the same size bin's free-list.
    next: AtomicU32,
    /// Bumped every claim; detects stale cross-process references.
    generation: AtomicU32,
    memory_type: AtomicU32,
    _pad: AtomicU32,
    size: AtomicU64,
    payload: AtomicU64,
    origin_pid: AtomicU64,
}

impl PoolEntry {
    fn init(&self) {
        self.state.store(ENTRY_VACANT, Ordering::Release);
        self.refcount.store(0, Ordering::Release);
        self.next.store(0, Ordering::Release);
        self.generation.store(0, Ordering::Release);
        self.memory_type.store(0, Ordering::Release);
        self.size.store(0, Ordering::Release);
        self.payload.store(0, Ordering::Release);
        self.origin_pid.store(0, Ordering::Release);
    }

    /// Current state (VACANT / IN_USE / FREE).
    pub(crate) fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// Buffer size in bytes.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Payload word: segment offset (CPU) or origin external handle (GPU).
    pub fn payload(&self) -> u64 {
        self.payload.load(Ordering::Acquire)
    }

    /// PID of the process that performed the underlying allocation.
    pub fn origin_pid(&self) -> u64 {
        self.origin_pid.load(Ordering::Acquire)
    }

    /// Graphics memory type index (GPU pools).
    pub fn memory_type(&self) -> u32 {
        self.memory_type.load(Ordering::Acquire)
    }

    /// Claim generation, for stale-reference detection.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Current cross-process reference count.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Install the first reference on a just-obtained entry (refcount 0).
    pub(crate) fn install_first_ref(&self) {
        debug_assert_eq!(self.refcount(), 0);
        self.refcount.store(1, Ordering::Release);
    }

    /// Increment the reference count.
    ///
    /// # Panics
    ///
    /// Panics on overflow past `i32::MAX` references.
    pub(crate) fn inc_ref(&self) {
        let old = self.refcount.fetch_add(1, Ordering::AcqRel);
        if old > i32::MAX as u32 {
            self.refcount.fetch_sub(1, Ordering::AcqRel);
            panic!("pool entry refcount overflow");
        }
    }

    /// Increment only if the count is already non-zero (IPC revival path).
    pub(crate) fn try_inc_ref(&self) -> bool {
        let mut current = self.refcount.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.refcount.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Decrement the reference count; true if this was the last reference.
    pub(crate) fn dec_ref(&self) -> bool {
        let old = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "pool entry refcount underflow");
        old == 1
    }
}

/// One size bin: `size == 0` means vacant. Guarded by `buffers_mutex`.
#[repr(C)]
struct Bin {
    size: AtomicU64,
    /// Free-list head (entry index+1), 0 when empty.
    head: AtomicU32,
    _pad: AtomicU32,
}

/// A pool in the shared segment.
#[repr(C)]
pub struct PoolShared {
    /// Guards the bin table and all free-list links.
    pub buffers_mutex: ShmMutex,
    /// Guards registry membership and `allocated`.
    pub sizes_mutex: ShmMutex,
    allocated: AtomicU64,
    bins: [Bin; MAX_BINS],
    entries: [PoolEntry; MAX_ENTRIES],
}

// SAFETY: repr(C), exclusively atomics and ShmMutex (itself an atomic
// word); init_in_place initializes every field.
unsafe impl SharedObject for PoolShared {
    fn init_in_place(&self) {
        self.buffers_mutex.init();
        self.sizes_mutex.init();
        self.allocated.store(0, Ordering::Release);
        for bin in &self.bins {
            bin.size.store(0, Ordering::Release);
            bin.head.store(0, Ordering::Release);
        }
        for entry in &self.entries {
            entry.init();
        }
    }
}

impl PoolShared {
    /// Running sum of bytes charged against this pool's budget.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Caller holds `sizes_mutex`.
    pub(crate) fn add_allocated(&self, n: u64) {
        self.allocated.fetch_add(n, Ordering::AcqRel);
    }

    /// Caller holds `sizes_mutex`.
    pub(crate) fn sub_allocated(&self, n: u64) {
        self.allocated.fetch_sub(n, Ordering::AcqRel);
    }

    /// Access an entry by index.
    pub(crate) fn entry(&self, index: u32) -> &PoolEntry {
        &self.entries[index as usize]
    }

    /// Find the bin for `size`, creating it in a vacant slot if absent.
    ///
    /// Returns `None` when all bins are taken by other sizes. Bins are
    /// never removed outside teardown. Caller holds `buffers_mutex`.
    pub(crate) fn bin_for_or_create(&self, size: u64) -> Option<usize> {
        let mut vacant = None;
        for (i, bin) in self.bins.iter().enumerate() {
            let bin_size = bin.size.load(Ordering::Acquire);
            if bin_size == size {
                return Some(i);
            }
            if bin_size == 0 && vacant.is_none() {
                vacant = Some(i);
            }
        }
        let i = vacant?;
        self.bins[i].size.store(size, Ordering::Release);
        self.bins[i].head.store(0, Ordering::Release);
        Some(i)
    }

    /// Pop the most recently freed entry from a bin (LIFO).
    ///
    /// The popped entry transitions FREE -> IN_USE with a zero refcount
    /// and a fresh generation (each in-use lifetime gets its own); the
    /// caller installs its first reference. Caller holds `buffers_mutex`.
    pub(crate) fn pop_free(&self, bin: usize) -> Option<u32> {
        let head = self.bins[bin].head.load(Ordering::Acquire);
        if head == 0 {
            return None;
        }
        let index = head - 1;
        let entry = self.entry(index);
        self.bins[bin]
            .head
            .store(entry.next.load(Ordering::Acquire), Ordering::Release);
        entry.next.store(0, Ordering::Release);
        entry.generation.fetch_add(1, Ordering::AcqRel);
        entry.state.store(ENTRY_IN_USE, Ordering::Release);
        Some(index)
    }

    /// Pop the first free entry whose origin is `pid`, searching from the
    /// most recently freed (the GPU fast path: only the origin process can
    /// use its exported handle without re-duplication).
    ///
    /// Caller holds `buffers_mutex`.
    pub(crate) fn pop_free_origin(&self, bin: usize, pid: u64) -> Option<u32> {
        let mut prev: Option<&PoolEntry> = None;
        let mut cursor = self.bins[bin].head.load(Ordering::Acquire);
        while cursor != 0 {
            let entry = self.entry(cursor - 1);
            let next = entry.next.load(Ordering::Acquire);
            if entry.origin_pid.load(Ordering::Acquire) == pid {
                match prev {
                    Some(p) => p.next.store(next, Ordering::Release),
                    None => self.bins[bin].head.store(next, Ordering::Release),
                }
                entry.next.store(0, Ordering::Release);
                entry.generation.fetch_add(1, Ordering::AcqRel);
                entry.state.store(ENTRY_IN_USE, Ordering::Release);
                return Some(cursor - 1);
            }
            prev = Some(entry);
            cursor = next;
        }
        None
    }

    /// Push an in-use entry back onto its size bin (the reclaimer).
    ///
    /// Never touches `allocated` and never frees backing memory: recycled
    /// entries stay charged against the budget. Returns false if the bin
    /// table is full (the entry is then stranded in-use; callers log).
    /// Caller holds `buffers_mutex`.
    pub(crate) fn push_free(&self, index: u32) -> bool {
        let entry = self.entry(index);
        let Some(bin) = self.bin_for_or_create(entry.size.load(Ordering::Acquire)) else {
            return false;
        };
        let head = self.bins[bin].head.load(Ordering::Acquire);
        entry.next.store(head, Ordering::Release);
        entry.state.store(ENTRY_FREE, Ordering::Release);
        self.bins[bin].head.store(index + 1, Ordering::Release);
        true
    }

    /// Claim a vacant entry for a fresh allocation and register it.
    ///
    /// Caller holds `sizes_mutex` and accounts `allocated` separately.
    pub(crate) fn claim_entry(
        &self,
        size: u64,
        payload: u64,
        memory_type: u32,
        origin_pid: u64,
    ) -> Option<u32> {
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.state.load(Ordering::Acquire) == ENTRY_VACANT {
                entry.generation.fetch_add(1, Ordering::AcqRel);
                entry.size.store(size, Ordering::Release);
                entry.payload.store(payload, Ordering::Release);
                entry.memory_type.store(memory_type, Ordering::Release);
                entry.origin_pid.store(origin_pid, Ordering::Release);
                entry.refcount.store(0, Ordering::Release);
                entry.next.store(0, Ordering::Release);
                entry.state.store(ENTRY_IN_USE, Ordering::Release);
                return Some(i as u32);
            }
        }
        None
    }

    /// Remove an entry from the registry.
    ///
    /// Caller holds `sizes_mutex` and has already unlinked the entry from
    /// any free-list.
    pub(crate) fn vacate(&self, index: u32) {
        let entry = self.entry(index);
        entry.generation.fetch_add(1, Ordering::AcqRel);
        entry.state.store(ENTRY_VACANT, Ordering::Release);
        entry.refcount.store(0, Ordering::Release);
        entry.next.store(0, Ordering::Release);
        entry.size.store(0, Ordering::Release);
        entry.payload.store(0, Ordering::Release);
        entry.origin_pid.store(0, Ordering::Release);
    }

    /// Visit every registered entry (IN_USE or FREE).
    pub(crate) fn for_each_registered(&self, mut f: impl FnMut(u32, &PoolEntry)) {
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.state.load(Ordering::Acquire) != ENTRY_VACANT {
                f(i as u32, entry);
            }
        }
    }

    /// Visit every free-listed entry, front (most recently freed) first.
    ///
    /// Caller holds `buffers_mutex`.
    pub(crate) fn for_each_free(&self, mut f: impl FnMut(u32, &PoolEntry)) {
        for bin in &self.bins {
            if bin.size.load(Ordering::Acquire) == 0 {
                continue;
            }
            let mut cursor = bin.head.load(Ordering::Acquire);
            while cursor != 0 {
                let entry = self.entry(cursor - 1);
                let next = entry.next.load(Ordering::Acquire);
                f(cursor - 1, entry);
                cursor = next;
            }
        }
    }

    /// Drop every free-list without vacating the entries.
    ///
    /// Formerly free-listed entries become registered-but-unreachable, the
    /// state a record is in after its origin detached while peers remain.
    /// Caller holds `buffers_mutex`.
    pub(crate) fn clear_free_lists(&self) {
        for bin in &self.bins {
            if bin.size.load(Ordering::Acquire) == 0 {
                continue;
            }
            let mut cursor = bin.head.load(Ordering::Acquire);
            while cursor != 0 {
                let entry = self.entry(cursor - 1);
                cursor = entry.next.load(Ordering::Acquire);
                entry.next.store(0, Ordering::Release);
                entry.state.store(ENTRY_IN_USE, Ordering::Release);
            }
            bin.head.store(0, Ordering::Release);
            bin.size.store(0, Ordering::Release);
        }
    }

    /// Number of entries currently free-listed for `size` (diagnostics and
    /// tests). Takes `buffers_mutex` internally.
    pub fn free_count(&self, size: u64) -> usize {
        let _guard = self.buffers_mutex.lock();
        let mut count = 0;
        for bin in &self.bins {
            if bin.size.load(Ordering::Acquire) != size {
                continue;
            }
            let mut cursor = bin.head.load(Ordering::Acquire);
            while cursor != 0 {
                count += 1;
                cursor = self.entry(cursor - 1).next.load(Ordering::Acquire);
            }
        }
        count
    }

    /// Sum of sizes of every registered entry (invariant check: must equal
    /// [`allocated`](Self::allocated) at quiescence). Takes `sizes_mutex`.
    pub fn registered_bytes(&self) -> u64 {
        let _guard = self.sizes_mutex.lock();
        let mut sum = 0;
        self.for_each_registered(|_, e| sum += e.size());
        sum
    }
}
