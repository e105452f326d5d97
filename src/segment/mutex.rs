//! Robust cross-process mutex.
//!
//! A [`ShmMutex`] lives inside the shared segment and provides mutual
//! exclusion between threads of all attached processes. The lock word is the
//! owner's PID, which doubles as the owner-death detector: a waiter that has
//! spun long enough probes the recorded owner for liveness and, if the owner
//! is gone, steals the lock and reports the recovery through the guard.
//! Callers observing [`ShmMutexGuard::recovered`] must treat the guarded
//! state as suspect and invalidate the region.
//!
//! Non-reentrant: a thread relocking a mutex held by its own process blocks.

use std::sync::atomic::{AtomicU64, Ordering};

use rustix::process::{test_kill_process, Pid};

/// Lock word value for "unlocked".
const UNLOCKED: u64 = 0;

/// Spin iterations before escalating to `yield_now`.
const SPIN_LIMIT: u32 = 64;

/// Iterations between liveness probes of the recorded owner.
const PROBE_INTERVAL: u32 = 1024;

/// Check whether a PID refers to a live process.
///
/// Probes with signal 0; `EPERM` means the process exists but is not ours to
/// signal, which still counts as alive.
pub(crate) fn pid_is_alive(pid: u64) -> bool {
    let Some(pid) = i32::try_from(pid).ok().and_then(Pid::from_raw) else {
        return false;
    };
    match test_kill_process(pid) {
        Ok(()) => true,
        Err(rustix::io::Errno::PERM) => true,
        Err(_) => false,
    }
}

/// The local process's PID as a lock word.
pub(crate) fn self_pid() -> u64 {
    std::process::id() as u64
}

/// A cross-process mutex stored in shared memory.
///
/// `#[repr(C)]` with a single atomic lock word so the layout is identical in
/// every process mapping the segment. Constructed in place via [`init`].
///
/// [`init`]: ShmMutex::init
#[repr(C)]
pub struct ShmMutex {
    /// PID of the current owner; [`UNLOCKED`] when free.
    owner: AtomicU64,
}

impl ShmMutex {
    /// Initialize in place (first-touch by the segment initializer).
    pub fn init(&self) {
        self.owner.store(UNLOCKED, Ordering::Release);
    }

    /// Acquire the mutex, blocking until available.
    ///
    /// If the recorded owner died while holding the lock, the lock is
    /// stolen and the returned guard reports `recovered() == true`.
    pub fn lock(&self) -> ShmMutexGuard<'_> {
        let me = self_pid();
        let mut iterations: u32 = 0;

        loop {
            match self
                .owner
                .compare_exchange_weak(UNLOCKED, me, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => {
                    return ShmMutexGuard {
                        mutex: self,
                        recovered: false,
                    }
                }
                Err(current) => {
                    iterations = iterations.wrapping_add(1);

                    if current != UNLOCKED
                        && iterations % PROBE_INTERVAL == 0
                        && !pid_is_alive(current)
                    {
                        // Owner died while holding the lock. Steal it; the
                        // CAS fails harmlessly if someone else got there
                        // first or the owner released in the meantime.
                        if self
                            .owner
                            .compare_exchange(current, me, Ordering::Acquire, Ordering::Relaxed)
                            .is_ok()
                        {
                            return ShmMutexGuard {
                                mutex: self,
                                recovered: true,
                            };
                        }
                    }

                    if iterations < SPIN_LIMIT {
                        std::hint::spin_loop();
                    } else if iterations < PROBE_INTERVAL {
                        std::thread::yield_now();
                    } else {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                }
            }
        }
    }

    /// Try to acquire without blocking.
    pub fn try_lock(&self) -> Option<ShmMutexGuard<'_>> {
        self.owner
            .compare_exchange(UNLOCKED, self_pid(), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ShmMutexGuard {
                mutex: self,
                recovered: false,
            })
    }

    /// Current owner PID, 0 if unlocked. Diagnostic only.
    pub fn owner_pid(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }
}

/// RAII guard for [`ShmMutex`]; unlocks on drop.
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
    recovered: bool,
}

impl ShmMutexGuard<'_> {
    /// True if this lock acquisition stole the mutex from a dead owner.
    ///
    /// The guarded state may have been mutated partway; the caller must
    /// invalidate the shared region.
    pub fn recovered(&self) -> bool {
        self.recovered
    }
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.owner.store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    /// A PID beyond Linux's default pid_max, guaranteed non-existent.
    const DEAD_PID: u64 = 0x7FFF_FFFF;

    fn fresh_mutex() -> ShmMutex {
        let m = ShmMutex {
            owner: AtomicU64::new(0),
        };
        m.init();
        m
    }

    #[test]
    fn test_lock_unlock() {
        let m = fresh_mutex();
        {
            let guard = m.lock();
            assert!(!guard.recovered());
            assert_eq!(m.owner_pid(), self_pid());
        }
        assert_eq!(m.owner_pid(), UNLOCKED);
    }

    #[test]
    fn test_try_lock_contended() {
        let m = fresh_mutex();
        let _guard = m.lock();
        assert!(m.try_lock().is_none());
    }

    #[test]
    fn test_steal_from_dead_owner() {
        let m = fresh_mutex();
        m.owner.store(DEAD_PID, Ordering::Release);

        let guard = m.lock();
        assert!(guard.recovered());
        assert_eq!(m.owner_pid(), self_pid());
    }

    #[test]
    fn test_mutual_exclusion() {
        let m = Arc::new(fresh_mutex());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = m.lock();
                        // Non-atomic read-modify-write under the lock.
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn test_pid_is_alive() {
        assert!(pid_is_alive(self_pid()));
        assert!(pid_is_alive(1)); // init; EPERM counts as alive
        assert!(!pid_is_alive(DEAD_PID));
        assert!(!pid_is_alive(0));
    }
}
