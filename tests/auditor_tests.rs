//! Integration tests for liveness auditing: dead-peer detection, region
//! invalidation, nuke, and local fallback after teardown.

use crosspool::config::PoolConfig;
use crosspool::graphics::NoGraphics;
use crosspool::pool::HybridMemoryPool;
use crosspool::segment::SharedSegment;
use crosspool::stream::StreamId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SEGMENT_SIZE: usize = 4 * 1024 * 1024;

/// A PID beyond Linux's default pid_max, guaranteed non-existent.
const DEAD_PID: u64 = 0x7FFF_FFFF;

struct TestSegment {
    name: String,
    segment: Arc<SharedSegment>,
}

impl TestSegment {
    fn new(tag: &str) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let name = format!(
            "crosspool-aud-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let segment = SharedSegment::create(&name, SEGMENT_SIZE).unwrap();
        Self { name, segment }
    }

    fn attach(&self, enable_auditor: bool) -> HybridMemoryPool {
        HybridMemoryPool::new(
            Arc::clone(&self.segment),
            Arc::new(NoGraphics),
            PoolConfig {
                cpu_budget: 1024 * 1024,
                enable_auditor,
                audit_interval: Duration::from_millis(5),
                ..Default::default()
            },
        )
        .unwrap()
    }
}

impl Drop for TestSegment {
    fn drop(&mut self) {
        let _ = SharedSegment::unlink(&self.name);
    }
}

fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

// ============================================================================
// Audit predicate
// ============================================================================

/// A freshly attached region audits clean.
#[test]
fn test_audit_clean_region() {
    let ts = TestSegment::new("clean");
    let pool = ts.attach(false);
    assert!(pool.is_valid());
    assert!(pool.audit());
}

/// A planted dead peer fails the audit without (yet) invalidating.
#[test]
fn test_audit_detects_dead_peer() {
    let ts = TestSegment::new("dead-peer");
    let pool = ts.attach(false);

    {
        let auditor = pool.auditor();
        let _guard = auditor.mutex.lock();
        assert!(auditor.register_process(DEAD_PID));
    }
    assert!(!pool.audit());
    assert!(pool.is_valid());
}

/// Invalidation is sticky and monotone.
#[test]
fn test_invalidation_is_sticky() {
    let ts = TestSegment::new("sticky");
    let pool = ts.attach(false);

    pool.invalidate();
    assert!(!pool.is_valid());
    assert!(!pool.audit());
    pool.invalidate();
    assert!(!pool.is_valid());
}

// ============================================================================
// Liveness loop (scenario: peer crash)
// ============================================================================

/// The liveness loop notices a dead peer, nukes the named objects, and
/// invalidates; subsequent CPU requests fall back to local allocation.
#[test]
fn test_liveness_loop_detects_crash() {
    let ts = TestSegment::new("crash");
    let pool = ts.attach(true);
    assert!(pool.is_valid());

    // Plant the "crashed" peer.
    {
        let auditor = pool.auditor();
        let _guard = auditor.mutex.lock();
        assert!(auditor.register_process(DEAD_PID));
    }

    assert!(
        wait_until(Duration::from_secs(2), || !pool.is_valid()
            && !ts.segment.contains("Auditor")),
        "liveness loop should invalidate and nuke after peer death"
    );

    // The four named objects are gone.
    assert!(!ts.segment.contains("MemoryPool"));
    assert!(!ts.segment.contains("MemoryPoolGPU"));
    assert!(!ts.segment.contains("MemoryPoolGPUDeviceLocal"));
    assert!(!ts.segment.contains("Auditor"));

    // Shared requests fail; the gated path degrades to local buffers.
    assert!(pool.request_shm(4096).is_empty());
    let buf = pool.get_buffer_from_pool(&StreamId::new("s"), 4096);
    assert!(!buf.is_empty());
    assert!(pool.convert_cpu(&buf).is_none());
}

/// The custom nuke hook runs instead of the built-in teardown.
#[test]
fn test_liveness_loop_calls_nuke_hook() {
    let ts = TestSegment::new("hook");
    let hook_calls = Arc::new(AtomicU64::new(0));
    let hook_calls2 = Arc::clone(&hook_calls);

    let pool = HybridMemoryPool::new(
        Arc::clone(&ts.segment),
        Arc::new(NoGraphics),
        PoolConfig {
            enable_auditor: true,
            audit_interval: Duration::from_millis(5),
            nuke_hook: Some(Box::new(move || {
                hook_calls2.fetch_add(1, Ordering::SeqCst);
                true
            })),
            ..Default::default()
        },
    )
    .unwrap();

    {
        let auditor = pool.auditor();
        let _guard = auditor.mutex.lock();
        auditor.register_process(DEAD_PID);
    }

    assert!(wait_until(Duration::from_secs(2), || {
        hook_calls.load(Ordering::SeqCst) > 0
    }));
    assert!(!pool.is_valid());
    // The hook replaced the built-in nuke: objects survive.
    assert!(ts.segment.contains("Auditor"));
}

// ============================================================================
// Attach behavior against a bad region
// ============================================================================

/// Attaching to an already-invalidated region registers nothing and serves
/// only local fallbacks.
#[test]
fn test_attach_to_invalid_region() {
    let ts = TestSegment::new("attach-invalid");
    let pool1 = ts.attach(false);
    pool1.invalidate();

    let pool2 = ts.attach(false);
    assert!(!pool2.is_valid());
    {
        let auditor = pool2.auditor();
        let _guard = auditor.mutex.lock();
        // Only pool1's record exists; pool2 never registered.
        assert_eq!(auditor.process_count(), 1);
    }
    assert!(pool2.request_shm(256).is_empty());
    let buf = pool2.get_buffer_from_pool(&StreamId::new("s"), 256);
    assert!(!buf.is_empty());
}

/// Attaching while a dead peer's record lingers invalidates immediately.
#[test]
fn test_attach_with_dead_peer() {
    let ts = TestSegment::new("attach-dead");
    let pool1 = ts.attach(false);
    {
        let auditor = pool1.auditor();
        let _guard = auditor.mutex.lock();
        auditor.register_process(DEAD_PID);
    }

    let pool2 = ts.attach(false);
    assert!(!pool2.is_valid());
    assert!(pool2.request_shm(256).is_empty());
}

/// force_clean wipes every process record on detach, making the next
/// detach-order independent cleanup deterministic in tests.
#[test]
fn test_force_clean_detach() {
    let ts = TestSegment::new("force-clean");
    let keeper = ts.attach(false);

    let cleaner = HybridMemoryPool::new(
        Arc::clone(&ts.segment),
        Arc::new(NoGraphics),
        PoolConfig {
            enable_auditor: false,
            force_clean: true,
            ..Default::default()
        },
    )
    .unwrap();

    drop(cleaner); // clears keeper's record too and runs last-out cleanup
    {
        let auditor = keeper.auditor();
        let _guard = auditor.mutex.lock();
        assert_eq!(auditor.process_count(), 0);
    }
    assert!(!keeper.is_valid());
}
