//! Liveness auditor: the shared record of attached processes.
//!
//! The auditor is the fourth named object in the segment. It tracks which
//! processes are attached and whether the region is still valid. A process
//! that exits cleanly removes its record on detach; a process that crashes
//! leaves its record behind, which [`audit`](AuditorShared::audit) detects
//! by probing every recorded PID for liveness. The `invalid` flag is
//! sticky: once set it is never cleared within a segment's lifetime.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::segment::{pid_is_alive, self_pid, SharedObject, ShmMutex};

/// Maximum number of simultaneously attached processes.
pub const MAX_PROCESSES: usize = 64;

/// The auditor object in the shared segment.
#[repr(C)]
pub struct AuditorShared {
    /// Guards the process table and attach/detach sequencing.
    pub mutex: ShmMutex,
    invalid: AtomicU32,
    /// Recorded PIDs; 0 means vacant.
    processes: [AtomicU64; MAX_PROCESSES],
}

// SAFETY: repr(C), atomics and ShmMutex only, fully initialized below.
unsafe impl SharedObject for AuditorShared {
    fn init_in_place(&self) {
        self.mutex.init();
        self.invalid.store(0, Ordering::Release);
        for slot in &self.processes {
            slot.store(0, Ordering::Release);
        }
    }
}

impl AuditorShared {
    /// True while the region has not been invalidated.
    pub fn is_valid(&self) -> bool {
        self.invalid.load(Ordering::Acquire) == 0
    }

    /// Mark the region invalid. Sticky: cannot be cleared.
    pub fn invalidate(&self) {
        self.invalid.store(1, Ordering::Release);
    }

    /// The audit predicate: valid and every recorded process alive.
    ///
    /// Caller holds [`mutex`](Self::mutex).
    pub fn audit(&self) -> bool {
        self.is_valid() && self.processes_alive()
    }

    fn processes_alive(&self) -> bool {
        for slot in &self.processes {
            let pid = slot.load(Ordering::Acquire);
            if pid != 0 && !pid_is_alive(pid) {
                return false;
            }
        }
        true
    }

    /// Record an attached process.
    ///
    /// Normally the local process registers itself on attach; arbitrary
    /// PIDs are accepted so embedders and tests can represent peers.
    /// Returns false if the table is full. Caller holds
    /// [`mutex`](Self::mutex).
    pub fn register_process(&self, pid: u64) -> bool {
        for slot in &self.processes {
            if slot.load(Ordering::Acquire) == 0 {
                slot.store(pid, Ordering::Release);
                return true;
            }
        }
        false
    }

    /// Register the local process. Caller holds [`mutex`](Self::mutex).
    pub(crate) fn register_self(&self) -> bool {
        self.register_process(self_pid())
    }

    /// Remove the local process's record (first match only, mirroring one
    /// record per attach). Caller holds [`mutex`](Self::mutex).
    pub(crate) fn deregister_self(&self) {
        let me = self_pid();
        for slot in &self.processes {
            if slot.load(Ordering::Acquire) == me {
                slot.store(0, Ordering::Release);
                return;
            }
        }
    }

    /// Clear every process record (force-clean detach path).
    /// Caller holds [`mutex`](Self::mutex).
    pub(crate) fn clear_processes(&self) {
        for slot in &self.processes {
            slot.store(0, Ordering::Release);
        }
    }

    /// Number of recorded processes. Caller holds [`mutex`](Self::mutex).
    pub fn process_count(&self) -> usize {
        self.processes
            .iter()
            .filter(|s| s.load(Ordering::Acquire) != 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A PID beyond Linux's default pid_max, guaranteed non-existent.
    const DEAD_PID: u64 = 0x7FFF_FFFF;

    fn fresh_auditor() -> AuditorShared {
        // SAFETY: all fields are atomics, valid zeroed; init follows.
        let a: AuditorShared = unsafe { std::mem::zeroed() };
        a.init_in_place();
        a
    }

    #[test]
    fn test_register_and_audit() {
        let auditor = fresh_auditor();
        let _guard = auditor.mutex.lock();
        assert!(auditor.audit()); // no processes, valid

        assert!(auditor.register_self());
        assert_eq!(auditor.process_count(), 1);
        assert!(auditor.audit());

        auditor.deregister_self();
        assert_eq!(auditor.process_count(), 0);
    }

    #[test]
    fn test_audit_fails_on_dead_peer() {
        let auditor = fresh_auditor();
        let _guard = auditor.mutex.lock();
        auditor.register_self();
        auditor.register_process(DEAD_PID);
        assert!(!auditor.audit());
        assert!(auditor.is_valid()); // audit failure alone does not invalidate
    }

    #[test]
    fn test_invalidate_is_sticky() {
        let auditor = fresh_auditor();
        assert!(auditor.is_valid());
        auditor.invalidate();
        assert!(!auditor.is_valid());
        auditor.invalidate();
        assert!(!auditor.is_valid());

        let _guard = auditor.mutex.lock();
        assert!(!auditor.audit());
    }

    #[test]
    fn test_deregister_removes_single_record() {
        let auditor = fresh_auditor();
        let _guard = auditor.mutex.lock();
        // Two attaches from the same process: two records.
        auditor.register_self();
        auditor.register_self();
        assert_eq!(auditor.process_count(), 2);
        auditor.deregister_self();
        assert_eq!(auditor.process_count(), 1);
    }

    #[test]
    fn test_clear_processes() {
        let auditor = fresh_auditor();
        let _guard = auditor.mutex.lock();
        auditor.register_self();
        auditor.register_process(DEAD_PID);
        auditor.clear_processes();
        assert_eq!(auditor.process_count(), 0);
        assert!(auditor.audit());
    }
}
