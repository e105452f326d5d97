//! Integration tests for the CPU side of the hybrid pool: recycling
//! accounting, budget enforcement, stream gating, and cross-process
//! wrapper round-trips.
//!
//! A second attached `HybridMemoryPool` on the same segment stands in for
//! a second process (both map the same shared state; only the PID is
//! shared).

use crosspool::buffer::AnyBuffer;
use crosspool::config::PoolConfig;
use crosspool::graphics::NoGraphics;
use crosspool::pool::HybridMemoryPool;
use crosspool::segment::SharedSegment;
use crosspool::stream::StreamId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const SEGMENT_SIZE: usize = 4 * 1024 * 1024;

/// Per-test segment with automatic unlink.
struct TestSegment {
    name: String,
    segment: Arc<SharedSegment>,
}

impl TestSegment {
    fn new(tag: &str) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let name = format!(
            "crosspool-it-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let segment = SharedSegment::create(&name, SEGMENT_SIZE).unwrap();
        Self { name, segment }
    }

    fn attach(&self, cpu_budget: u64) -> HybridMemoryPool {
        HybridMemoryPool::new(
            Arc::clone(&self.segment),
            Arc::new(NoGraphics),
            PoolConfig {
                cpu_budget,
                gpu_budget: 16 * 1024 * 1024,
                enable_auditor: false,
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

// ============================================================================
// Recycling & accounting (scenario: two allocations, drop, re-request)
// ============================================================================

/// Two 4096-byte allocations charge 8192 bytes; dropping both moves them to
/// the free-list without uncharging; a third request recycles instead of
/// allocating.
#[test]
fn test_recycle_accounting() {
    let ts = TestSegment::new("recycle");
    let pool = ts.attach(1024 * 1024);

    let a = pool.request_shm(4096);
    let b = pool.request_shm(4096);
    assert!(!a.is_empty() && !b.is_empty());
    assert_eq!(pool.cpu_pool().allocated(), 8192);

    drop(a);
    drop(b);
    // The reclaimer never uncharges the budget.
    assert_eq!(pool.cpu_pool().allocated(), 8192);
    assert_eq!(pool.cpu_pool().free_count(4096), 2);

    let c = pool.request_shm(4096);
    assert!(!c.is_empty());
    assert_eq!(pool.cpu_pool().free_count(4096), 1);
    // No new segment memory consumed.
    assert_eq!(pool.cpu_pool().allocated(), 8192);
}

/// Accounting invariant at quiescence: allocated equals the sum of
/// registered sizes.
#[test]
fn test_allocated_matches_registry() {
    let ts = TestSegment::new("registry");
    let pool = ts.attach(1024 * 1024);

    let _a = pool.request_shm(1000);
    let _b = pool.request_shm(2000);
    let c = pool.request_shm(3000);
    drop(c);

    assert_eq!(pool.cpu_pool().allocated(), 6000);
    assert_eq!(pool.cpu_pool().registered_bytes(), 6000);
}

// ============================================================================
// LIFO locality
// ============================================================================

/// Dropping a buffer and re-requesting the same size returns the same
/// address (LIFO favors cache warmth).
#[test]
fn test_lifo_address_reuse() {
    let ts = TestSegment::new("lifo");
    let pool = ts.attach(1024 * 1024);

    let a = pool.request_shm(1024);
    let addr_a = a.as_ptr();
    drop(a);

    let b = pool.request_shm(1024);
    assert_eq!(b.as_ptr(), addr_a);
}

/// LIFO order across several buffers: the most recently freed pops first.
#[test]
fn test_lifo_order() {
    let ts = TestSegment::new("lifo-order");
    let pool = ts.attach(1024 * 1024);

    let a = pool.request_shm(512);
    let b = pool.request_shm(512);
    let addr_a = a.as_ptr();
    let addr_b = b.as_ptr();
    drop(a); // freed first
    drop(b); // freed last -> front of the list

    assert_eq!(pool.request_shm(512).as_ptr(), addr_b);
    assert_eq!(pool.request_shm(512).as_ptr(), addr_a);
}

// ============================================================================
// Budget enforcement (scenario: 1024-byte budget, 0.9 frac => 921 cap)
// ============================================================================

/// With a 1024-byte budget the usable cap is 921: a second 512-byte request
/// must fail, and the stream-gated path falls back to a local buffer whose
/// convert is empty.
#[test]
fn test_budget_rejection() {
    let ts = TestSegment::new("budget");
    let pool = ts.attach(1024);

    let first = pool.request_shm(512);
    assert!(!first.is_empty());

    let second = pool.request_shm(512);
    assert!(second.is_empty());

    let fallback = pool.get_buffer_from_pool(&StreamId::new("s"), 512);
    assert!(!fallback.is_empty());
    assert_eq!(fallback.len(), 512);
    assert!(pool.convert_cpu(&fallback).is_none());
}

/// Allocations summing to cap - 1 succeed; the next single byte fails.
#[test]
fn test_budget_boundary() {
    let ts = TestSegment::new("boundary");
    let pool = ts.attach(1024); // cap = 921

    let big = pool.request_shm(920);
    assert!(!big.is_empty());
    assert_eq!(pool.cpu_pool().allocated(), 920);

    assert!(pool.request_shm(1).is_empty());

    // Recycling stays under the cap: drop and re-request works.
    drop(big);
    assert!(!pool.request_shm(920).is_empty());
}

// ============================================================================
// Stream gating
// ============================================================================

/// A stream gated off never touches the shared pool; re-activating it does.
#[test]
fn test_stream_gating() {
    let ts = TestSegment::new("gate");
    let pool = ts.attach(1024 * 1024);
    let stream = StreamId::new("A");

    pool.activate_stream(&stream, false);
    let local = pool.get_buffer_from_pool(&stream, 256);
    assert!(!local.is_empty());
    assert!(pool.convert_cpu(&local).is_none());
    assert_eq!(pool.cpu_pool().allocated(), 0);

    pool.activate_stream(&stream, true);
    let shared = pool.get_buffer_from_pool(&stream, 256);
    assert!(pool.convert_cpu(&shared).is_some());
}

/// Unknown streams default to the shared pool.
#[test]
fn test_unknown_stream_defaults_shared() {
    let ts = TestSegment::new("gate-default");
    let pool = ts.attach(1024 * 1024);

    let buf = pool.get_buffer_from_pool(&StreamId::new("never-mentioned"), 128);
    assert!(pool.convert_cpu(&buf).is_some());
}

/// Repeating an activation is idempotent.
#[test]
fn test_activate_stream_idempotent() {
    let ts = TestSegment::new("gate-idem");
    let pool = ts.attach(1024 * 1024);
    let stream = StreamId::new("A");

    pool.activate_stream(&stream, false);
    pool.activate_stream(&stream, false);
    let buf = pool.get_buffer_from_pool(&stream, 64);
    assert!(pool.convert_cpu(&buf).is_none());
}

// ============================================================================
// Conversion, probing, direct handles
// ============================================================================

/// convert on a just-requested buffer is non-empty; the next lifetime of
/// the same entry yields a distinct wrapper.
#[test]
fn test_convert_distinct_per_lifetime() {
    let ts = TestSegment::new("convert");
    let pool = ts.attach(1024 * 1024);

    let a = pool.request_shm(4096);
    let wrapper_a = pool.convert_cpu(&a).expect("pool-backed buffer");
    let ipc_a = wrapper_a.to_ipc();
    drop(wrapper_a);
    drop(a);

    // Same entry recycled, new wrapper generation.
    let b = pool.request_shm(4096);
    let ipc_b = pool.convert_cpu(&b).unwrap().to_ipc();
    assert_eq!(ipc_a.entry, ipc_b.entry);
    assert_ne!(ipc_a.generation, ipc_b.generation);
}

/// create_local over a converted wrapper aliases the same shared buffer.
#[test]
fn test_create_local_round_trip() {
    let ts = TestSegment::new("create-local");
    let pool = ts.attach(1024 * 1024);

    let mut a = pool.request_shm(4096);
    a.data_mut()[..5].copy_from_slice(b"hello");
    let wrapper = pool.convert_cpu(&a).unwrap();

    let b = pool.create_local_cpu(wrapper.clone());
    assert_eq!(a, b); // equality by pointer
    assert_eq!(&b.data()[..5], b"hello");

    // Round-trip: converting the adopted buffer yields the same wrapper.
    assert_eq!(pool.convert_cpu(&b).unwrap(), wrapper);
}

/// is_buffer_from_pool distinguishes pool-backed from local buffers.
#[test]
fn test_is_buffer_from_pool() {
    let ts = TestSegment::new("probe");
    let pool = ts.attach(1024 * 1024);

    let shared = pool.request_shm(128);
    assert!(pool.is_buffer_from_pool(&AnyBuffer::Cpu(shared)));

    let stream = StreamId::new("off");
    pool.activate_stream(&stream, false);
    let local = pool.get_buffer_from_pool(&stream, 128);
    assert!(!pool.is_buffer_from_pool(&AnyBuffer::Cpu(local)));
}

/// The direct path returns a live wrapper with no local handle attached.
#[test]
fn test_direct_shared_handle() {
    let ts = TestSegment::new("direct");
    let pool = ts.attach(1024 * 1024);

    let wrapper = pool.get_buffer_from_shared_pool_direct(4096).unwrap();
    assert_eq!(wrapper.size(), 4096);
    assert_eq!(wrapper.refcount(), 1);

    // Adopting it produces a usable local buffer.
    let buf = pool.create_local_cpu(wrapper.clone());
    assert!(!buf.is_empty());
    assert_eq!(buf.len(), 4096);
}

/// Dropping the last wrapper anywhere returns the entry to the free-list.
#[test]
fn test_wrapper_drop_reclaims() {
    let ts = TestSegment::new("reclaim");
    let pool = ts.attach(1024 * 1024);

    let wrapper = pool.get_buffer_from_shared_pool_direct(2048).unwrap();
    assert_eq!(pool.cpu_pool().free_count(2048), 0);
    drop(wrapper);
    assert_eq!(pool.cpu_pool().free_count(2048), 1);
}

// ============================================================================
// Second attach (two pools on one segment stand in for two processes)
// ============================================================================

/// A second attach observes existing pool state and recycles buffers freed
/// by the first.
#[test]
fn test_second_attach_observes_state() {
    let ts = TestSegment::new("second");
    let pool1 = ts.attach(1024 * 1024);

    let a = pool1.request_shm(4096);
    let addr = a.as_ptr();
    drop(a);
    assert_eq!(pool1.cpu_pool().allocated(), 4096);

    let pool2 = ts.attach(1024 * 1024);
    assert_eq!(pool2.cpu_pool().allocated(), 4096);
    assert_eq!(pool2.cpu_pool().free_count(4096), 1);

    // Freed by pool1, recycled by pool2: same shared bytes.
    let b = pool2.request_shm(4096);
    assert_eq!(b.as_ptr(), addr);
    assert_eq!(pool2.cpu_pool().allocated(), 4096);
}

/// A wrapper serialized in one attach revives in the other, sharing the
/// refcount; a stale reference after reclaim is rejected.
#[test]
fn test_ipc_ref_across_attaches() {
    let ts = TestSegment::new("ipc");
    let pool1 = ts.attach(1024 * 1024);
    let pool2 = ts.attach(1024 * 1024);

    let wrapper = pool1.get_buffer_from_shared_pool_direct(8192).unwrap();
    let wire = wrapper.to_ipc();

    let revived = pool2.ref_from_ipc(wire).expect("live entry revives");
    assert_eq!(revived.size(), 8192);
    assert_eq!(revived.refcount(), 2);

    // Writes through one attach are visible through the other.
    let mut a = pool1.create_local_cpu(wrapper.clone());
    a.data_mut()[0] = 0xEE;
    let b = pool2.create_local_cpu(revived.clone());
    assert_eq!(b.data()[0], 0xEE);

    drop(a);
    drop(b);
    drop(wrapper);
    drop(revived);
    // Everyone dropped: entry reclaimed.
    assert_eq!(pool1.cpu_pool().free_count(8192), 1);

    // Stale wire ref no longer revives.
    assert!(pool1.ref_from_ipc(wire).is_none());
}

// ============================================================================
// Zero-size and shutdown behavior
// ============================================================================

/// Zero-byte requests yield the empty handle.
#[test]
fn test_zero_size_request() {
    let ts = TestSegment::new("zero");
    let pool = ts.attach(1024 * 1024);
    assert!(pool.request_shm(0).is_empty());
}

/// Last detach zeroes the accounting; outstanding local buffers stay
/// readable (the deleter keeps the mapping alive).
#[test]
fn test_last_detach_cleans_cpu_pool() {
    let ts = TestSegment::new("detach");
    let pool1 = ts.attach(1024 * 1024);
    let pool2 = ts.attach(1024 * 1024);

    let a = pool1.request_shm(4096);
    drop(a);
    drop(pool1); // not last: state survives
    assert_eq!(pool2.cpu_pool().allocated(), 4096);

    drop(pool2); // last process out

    // Fresh attach finds the region invalidated (sticky).
    let pool3 = ts.attach(1024 * 1024);
    assert!(!pool3.is_valid());
    assert!(pool3.request_shm(64).is_empty());
}
