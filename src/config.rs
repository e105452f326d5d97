//! Pool configuration and shared-segment ABI constants.
//!
//! The four named-object strings are part of the ABI between cooperating
//! processes: every process attaching to a segment resolves the same four
//! objects by these names. Changing them is a breaking protocol change.

use std::time::Duration;

// =============================================================================
// Shared-object ABI names
// =============================================================================

/// Named object: the CPU byte-buffer pool.
pub const MEMORY_POOL_NAME: &str = "MemoryPool";

/// Named object: the host-visible GPU buffer pool.
pub const MEMORY_POOL_GPU_NAME: &str = "MemoryPoolGPU";

/// Named object: the device-local GPU buffer pool.
pub const MEMORY_POOL_GPU_DEVICE_LOCAL_NAME: &str = "MemoryPoolGPUDeviceLocal";

/// Named object: the liveness auditor.
pub const AUDITOR_NAME: &str = "Auditor";

// =============================================================================
// Budgets and fractions
// =============================================================================

/// Fraction of the CPU budget usable for buffer payload.
///
/// The remainder is headroom for segment bookkeeping (pool tables, the
/// named-object directory, block headers). A request is rejected once
/// `allocated + n >= cpu_budget * MAX_SHM_USAGE_FRAC`.
pub const MAX_SHM_USAGE_FRAC: f64 = 0.9;

/// Default CPU pool budget: enough for a handful of 1080p BGRA frames.
pub const DEFAULT_CPU_BUDGET: u64 = 64 * 1024 * 1024;

/// Default GPU pool budget (per pool kind).
pub const DEFAULT_GPU_BUDGET: u64 = 256 * 1024 * 1024;

/// Default interval between liveness audits.
pub const DEFAULT_AUDIT_INTERVAL: Duration = Duration::from_millis(10);

// =============================================================================
// PoolConfig
// =============================================================================

/// Teardown hook invoked by the liveness loop when a dead peer is detected.
///
/// Returns `true` if the embedding framework tore the region down; on
/// `false` the failure is logged and the segment is invalidated anyway.
pub type NukeHook = Box<dyn Fn() -> bool + Send + Sync>;

/// Configuration for a [`HybridMemoryPool`](crate::pool::HybridMemoryPool).
pub struct PoolConfig {
    /// Byte budget for the shared CPU pool. Only
    /// `cpu_budget * MAX_SHM_USAGE_FRAC` is usable for payload.
    pub cpu_budget: u64,
    /// Byte budget for each GPU pool (host-visible and device-local).
    pub gpu_budget: u64,
    /// Spawn the background liveness loop on attach.
    pub enable_auditor: bool,
    /// Interval between audits in the liveness loop.
    pub audit_interval: Duration,
    /// On detach, clear *all* process records, not just this process's.
    /// Test/debug escape hatch: forces last-process cleanup.
    pub force_clean: bool,
    /// Optional framework teardown hook; when absent the liveness loop
    /// destroys the four named objects directly.
    pub nuke_hook: Option<NukeHook>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cpu_budget: DEFAULT_CPU_BUDGET,
            gpu_budget: DEFAULT_GPU_BUDGET,
            enable_auditor: true,
            audit_interval: DEFAULT_AUDIT_INTERVAL,
            force_clean: false,
            nuke_hook: None,
        }
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("cpu_budget", &self.cpu_budget)
            .field("gpu_budget", &self.gpu_budget)
            .field("enable_auditor", &self.enable_auditor)
            .field("audit_interval", &self.audit_interval)
            .field("force_clean", &self.force_clean)
            .field("nuke_hook", &self.nuke_hook.is_some())
            .finish()
    }
}

impl PoolConfig {
    /// Usable CPU payload cap in bytes: `cpu_budget * MAX_SHM_USAGE_FRAC`.
    pub fn cpu_cap(&self) -> u64 {
        (self.cpu_budget as f64 * MAX_SHM_USAGE_FRAC) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_cap() {
        let config = PoolConfig {
            cpu_budget: 1024,
            ..Default::default()
        };
        assert_eq!(config.cpu_cap(), 921); // floor(1024 * 0.9)
    }

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert!(config.enable_auditor);
        assert!(!config.force_clean);
        assert_eq!(config.cpu_budget, DEFAULT_CPU_BUDGET);
    }
}
