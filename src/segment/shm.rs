//! Named shared-memory segment with a managed interior.
//!
//! A [`SharedSegment`] is a file under `/dev/shm` (or a configurable base
//! directory) sized with `ftruncate` and mapped `MAP_SHARED` by every
//! cooperating process. The mapped region starts with a header holding:
//!
//! - magic/version for validation,
//! - the anonymous block allocator (bump pointer + free list of destroyed
//!   blocks, every block carrying a size header),
//! - a fixed-capacity named-object directory.
//!
//! Addresses differ per process; **offsets** from the mapping base do not,
//! so all intra-segment references are offsets
//! ([`offset_to_ptr`]/[`ptr_to_offset`] translate).
//!
//! First-touch initialization is raced through `flock`: whichever process
//! wins the exclusive lock with an uninitialized header initializes it; all
//! others validate magic and version.
//!
//! [`offset_to_ptr`]: SharedSegment::offset_to_ptr
//! [`ptr_to_offset`]: SharedSegment::ptr_to_offset

use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use rustix::fd::OwnedFd;
use rustix::fs::{FlockOperation, Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};

use super::mutex::ShmMutex;
use crate::error::{Error, Result};

/// Magic number identifying an initialized segment header.
const SEGMENT_MAGIC: u64 = 0x5850_4F4F_4C53_4547; // "XPOOLSEG"

/// Current segment format version.
const SEGMENT_VERSION: u32 = 1;

/// Maximum number of named objects in a segment.
pub const MAX_NAMED_OBJECTS: usize = 16;

/// Maximum named-object name length in bytes.
pub const MAX_OBJECT_NAME: usize = 32;

/// Alignment of every allocated block's payload.
const BLOCK_ALIGN: u64 = 64;

/// Size of the per-block header preceding each payload.
const BLOCK_HEADER_SIZE: u64 = std::mem::size_of::<BlockHeader>() as u64;

/// Default base directory for segment files.
const DEFAULT_BASE_DIR: &str = "/dev/shm";

/// Types constructible in place inside a shared segment.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, composed exclusively of fields that
/// are valid for any bit pattern and safe to share across process mappings
/// (atomics, [`ShmMutex`], nested arrays of the same), and
/// [`init_in_place`](SharedObject::init_in_place) must bring every field to
/// a consistent initial state: the backing block may be recycled, not
/// zeroed.
pub unsafe trait SharedObject: Sized {
    /// Initialize all fields in place.
    fn init_in_place(&self);
}

/// Directory entry for one named object. Guarded by the directory mutex;
/// `offset == 0` means vacant.
#[repr(C)]
struct DirEntry {
    name: [AtomicU8; MAX_OBJECT_NAME],
    offset: AtomicU64,
}

impl DirEntry {
    /// Caller holds the directory mutex.
    fn name(&self) -> [u8; MAX_OBJECT_NAME] {
        let mut out = [0u8; MAX_OBJECT_NAME];
        for (dst, src) in out.iter_mut().zip(&self.name) {
            *dst = src.load(Ordering::Acquire);
        }
        out
    }

    /// Caller holds the directory mutex.
    fn set_name(&self, key: &[u8; MAX_OBJECT_NAME]) {
        for (dst, src) in self.name.iter().zip(key) {
            dst.store(*src, Ordering::Release);
        }
    }
}

/// Header of an allocated block, immediately preceding the payload.
#[repr(C)]
struct BlockHeader {
    /// Payload size in bytes.
    size: AtomicU64,
    /// Next free block's *header* offset when on the free list.
    next: AtomicU64,
}

/// Segment header at offset 0.
#[repr(C, align(64))]
struct SegmentHeader {
    magic: AtomicU64,
    version: AtomicU32,
    _pad: AtomicU32,
    /// Total mapping size recorded by the initializer.
    size: AtomicU64,
    /// Guards `bump` and `free_head`.
    alloc_mutex: ShmMutex,
    /// Next unallocated offset (bump pointer).
    bump: AtomicU64,
    /// Head of the free-block list (header offset), 0 when empty.
    free_head: AtomicU64,
    /// Guards `dir`.
    dir_mutex: ShmMutex,
    dir: [DirEntry; MAX_NAMED_OBJECTS],
}

impl SegmentHeader {
    fn validate(&self) -> Result<()> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != SEGMENT_MAGIC {
            return Err(Error::InvalidSegment(format!(
                "bad segment magic: expected {:#x}, got {:#x}",
                SEGMENT_MAGIC, magic
            )));
        }
        let version = self.version.load(Ordering::Acquire);
        if version != SEGMENT_VERSION {
            return Err(Error::InvalidSegment(format!(
                "unsupported segment version: expected {}, got {}",
                SEGMENT_VERSION, version
            )));
        }
        Ok(())
    }
}

/// First allocatable offset, past the header, block-aligned.
fn data_start() -> u64 {
    let header = std::mem::size_of::<SegmentHeader>() as u64;
    (header + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

/// A named shared-memory segment mapped into this process.
pub struct SharedSegment {
    path: PathBuf,
    base: NonNull<u8>,
    len: usize,
    fd: OwnedFd,
}

// SAFETY: the mapping is valid for the struct's lifetime and all interior
// mutation goes through atomics or segment mutexes.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create or attach to the named segment under `/dev/shm`.
    pub fn create(name: &str, size: usize) -> Result<Arc<Self>> {
        Self::create_in(Path::new(DEFAULT_BASE_DIR), name, size)
    }

    /// Create or attach to the named segment under `dir`.
    ///
    /// If the backing file already exists its recorded size wins; otherwise
    /// it is created with `size` bytes. The first process through the
    /// `flock`-guarded critical section initializes the header.
    pub fn create_in(dir: &Path, name: &str, size: usize) -> Result<Arc<Self>> {
        let min = (data_start() + BLOCK_ALIGN) as usize;
        if size < min {
            return Err(Error::AllocationFailed(format!(
                "segment size {} below minimum {}",
                size, min
            )));
        }

        let path = dir.join(name);
        let fd = rustix::fs::open(
            &path,
            OFlags::CREATE | OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )?;

        rustix::fs::flock(&fd, FlockOperation::LockExclusive)?;
        let stat = rustix::fs::fstat(&fd)?;
        let len = if stat.st_size == 0 {
            rustix::fs::ftruncate(&fd, size as u64)?;
            size
        } else {
            stat.st_size as usize
        };

        // SAFETY: fd is a freshly opened file of `len` bytes.
        let base = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        let segment = Self {
            path,
            base,
            len,
            fd,
        };

        let header = segment.header();
        if header.magic.load(Ordering::Acquire) != SEGMENT_MAGIC {
            // We won the initialization race.
            header.version.store(SEGMENT_VERSION, Ordering::Release);
            header.size.store(len as u64, Ordering::Release);
            header.alloc_mutex.init();
            header.bump.store(data_start(), Ordering::Release);
            header.free_head.store(0, Ordering::Release);
            header.dir_mutex.init();
            for entry in &header.dir {
                entry.offset.store(0, Ordering::Release);
            }
            // Publish last: attachers spin-free on magic after taking flock.
            header.magic.store(SEGMENT_MAGIC, Ordering::Release);
        } else {
            header.validate()?;
        }
        rustix::fs::flock(&segment.fd, FlockOperation::Unlock)?;

        Ok(Arc::new(segment))
    }

    /// Remove the named segment file under `/dev/shm`.
    pub fn unlink(name: &str) -> Result<()> {
        Self::unlink_in(Path::new(DEFAULT_BASE_DIR), name)
    }

    /// Remove the named segment file under `dir`.
    pub fn unlink_in(dir: &Path, name: &str) -> Result<()> {
        rustix::fs::unlink(dir.join(name))?;
        Ok(())
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping is at least data_start() bytes and the header
        // consists of atomics, valid for any bit pattern.
        unsafe { &*(self.base.as_ptr() as *const SegmentHeader) }
    }

    /// Total mapping size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the mapping has zero length (cannot happen post-construction).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Translate a segment offset to a local address.
    ///
    /// The offset must have come from this segment.
    pub fn offset_to_ptr(&self, offset: u64) -> *mut u8 {
        debug_assert!((offset as usize) < self.len);
        // SAFETY: offset is within the mapping per the caller contract.
        unsafe { self.base.as_ptr().add(offset as usize) }
    }

    /// Translate a local address inside the mapping to its segment offset.
    pub fn ptr_to_offset(&self, ptr: *const u8) -> u64 {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        debug_assert!(addr >= base && addr < base + self.len);
        (addr - base) as u64
    }

    // =========================================================================
    // Anonymous block allocation
    // =========================================================================

    /// Allocate an anonymous block of `len` bytes; returns the payload
    /// offset, or `None` if the segment is exhausted.
    ///
    /// Destroyed blocks are recycled first-fit; fresh blocks come from the
    /// bump pointer. Payloads are 64-byte aligned.
    pub fn alloc_block(&self, len: u64) -> Option<u64> {
        let header = self.header();
        let guard = header.alloc_mutex.lock();

        // First fit from the free list.
        let mut prev: Option<&BlockHeader> = None;
        let mut cursor = header.free_head.load(Ordering::Acquire);
        while cursor != 0 {
            let block = self.block_header(cursor);
            let next = block.next.load(Ordering::Acquire);
            if block.size.load(Ordering::Acquire) >= len {
                match prev {
                    Some(p) => p.next.store(next, Ordering::Release),
                    None => header.free_head.store(next, Ordering::Release),
                }
                drop(guard);
                return Some(cursor + BLOCK_HEADER_SIZE);
            }
            prev = Some(block);
            cursor = next;
        }

        // Bump a fresh block: payload aligned, header right before it.
        let bump = header.bump.load(Ordering::Acquire);
        let payload = (bump + BLOCK_HEADER_SIZE + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1);
        let block_header = payload - BLOCK_HEADER_SIZE;
        let end = payload + len;
        if end > self.len as u64 {
            return None;
        }
        header.bump.store(end, Ordering::Release);

        let block = self.block_header(block_header);
        block.size.store(len, Ordering::Release);
        block.next.store(0, Ordering::Release);
        Some(payload)
    }

    /// Return a block (by payload offset) to the free list.
    ///
    /// Block sizes are remembered in the block header, so the payload
    /// offset alone suffices.
    pub fn free_block(&self, payload_offset: u64) {
        let header = self.header();
        let _guard = header.alloc_mutex.lock();

        let block_offset = payload_offset - BLOCK_HEADER_SIZE;
        let block = self.block_header(block_offset);
        let head = header.free_head.load(Ordering::Acquire);
        block.next.store(head, Ordering::Release);
        header.free_head.store(block_offset, Ordering::Release);
    }

    fn block_header(&self, header_offset: u64) -> &BlockHeader {
        // SAFETY: header_offset addresses a block header inside the mapping;
        // BlockHeader is atomics only.
        unsafe { &*(self.offset_to_ptr(header_offset) as *const BlockHeader) }
    }

    // =========================================================================
    // Named objects
    // =========================================================================

    /// Resolve the named object, constructing it on first use.
    ///
    /// The returned pointer is valid for as long as this segment mapping
    /// lives and refers to the same shared object in every process.
    pub fn find_or_construct<T: SharedObject>(&self, name: &str) -> Result<NonNull<T>> {
        let key = Self::encode_name(name)?;
        let header = self.header();
        let guard = header.dir_mutex.lock();

        for entry in &header.dir {
            let offset = entry.offset.load(Ordering::Acquire);
            if offset != 0 && entry.name() == key {
                drop(guard);
                return Ok(self.object_at(offset));
            }
        }

        // Miss: allocate and construct in place.
        let offset = self
            .alloc_block(std::mem::size_of::<T>() as u64)
            .ok_or_else(|| {
                Error::AllocationFailed(format!(
                    "segment exhausted constructing named object {:?}",
                    name
                ))
            })?;
        let ptr: NonNull<T> = self.object_at(offset);
        // SAFETY: T::init_in_place fully initializes the (possibly recycled)
        // block; T is valid for any bit pattern per the SharedObject contract.
        unsafe { ptr.as_ref() }.init_in_place();

        for entry in &header.dir {
            if entry.offset.load(Ordering::Acquire) == 0 {
                entry.set_name(&key);
                entry.offset.store(offset, Ordering::Release);
                return Ok(ptr);
            }
        }
        self.free_block(offset);
        Err(Error::DirectoryFull(MAX_NAMED_OBJECTS))
    }

    /// Destroy the named object; returns true if it existed.
    ///
    /// The caller guarantees no process will touch the object afterwards
    /// (this is the nuke/teardown path).
    pub fn destroy(&self, name: &str) -> bool {
        let Ok(key) = Self::encode_name(name) else {
            return false;
        };
        let header = self.header();
        let guard = header.dir_mutex.lock();

        for entry in &header.dir {
            let offset = entry.offset.load(Ordering::Acquire);
            if offset != 0 && entry.name() == key {
                entry.offset.store(0, Ordering::Release);
                drop(guard);
                self.free_block(offset);
                return true;
            }
        }
        false
    }

    /// True if a named object exists.
    pub fn contains(&self, name: &str) -> bool {
        let Ok(key) = Self::encode_name(name) else {
            return false;
        };
        let header = self.header();
        let _guard = header.dir_mutex.lock();
        header
            .dir
            .iter()
            .any(|e| e.offset.load(Ordering::Acquire) != 0 && e.name() == key)
    }

    fn object_at<T>(&self, offset: u64) -> NonNull<T> {
        debug_assert_eq!(offset % BLOCK_ALIGN, 0);
        // SAFETY: offset_to_ptr yields a non-null in-mapping pointer.
        unsafe { NonNull::new_unchecked(self.offset_to_ptr(offset) as *mut T) }
    }

    fn encode_name(name: &str) -> Result<[u8; MAX_OBJECT_NAME]> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > MAX_OBJECT_NAME {
            return Err(Error::InvalidSegment(format!(
                "object name {:?} must be 1..={} bytes",
                name, MAX_OBJECT_NAME
            )));
        }
        let mut key = [0u8; MAX_OBJECT_NAME];
        key[..bytes.len()].copy_from_slice(bytes);
        Ok(key)
    }

}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: base/len describe our own live mapping.
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[repr(C)]
    struct Counter {
        value: AtomicU64,
    }

    // SAFETY: repr(C), a single atomic, fully initialized below.
    unsafe impl SharedObject for Counter {
        fn init_in_place(&self) {
            self.value.store(0, Ordering::Release);
        }
    }

    struct NamedSegment {
        name: String,
        segment: Arc<SharedSegment>,
    }

    impl NamedSegment {
        fn new(tag: &str, size: usize) -> Self {
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            let name = format!(
                "crosspool-test-{}-{}-{}",
                tag,
                std::process::id(),
                COUNTER.fetch_add(1, Ordering::Relaxed)
            );
            let segment = SharedSegment::create(&name, size).unwrap();
            Self { name, segment }
        }
    }

    impl Drop for NamedSegment {
        fn drop(&mut self) {
            let _ = SharedSegment::unlink(&self.name);
        }
    }

    #[test]
    fn test_create_and_reattach() {
        let s = NamedSegment::new("reattach", 1024 * 1024);
        let counter = s.segment.find_or_construct::<Counter>("counter").unwrap();
        unsafe { counter.as_ref() }
            .value
            .store(42, Ordering::Release);

        // Second attach (same process stands in for a peer).
        let second = SharedSegment::create(&s.name, 1024 * 1024).unwrap();
        let counter2 = second.find_or_construct::<Counter>("counter").unwrap();
        assert_eq!(unsafe { counter2.as_ref() }.value.load(Ordering::Acquire), 42);
    }

    #[test]
    fn test_find_or_construct_is_idempotent() {
        let s = NamedSegment::new("idempotent", 1024 * 1024);
        let a = s.segment.find_or_construct::<Counter>("c").unwrap();
        let b = s.segment.find_or_construct::<Counter>("c").unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn test_destroy_named_object() {
        let s = NamedSegment::new("destroy", 1024 * 1024);
        s.segment.find_or_construct::<Counter>("c").unwrap();
        assert!(s.segment.contains("c"));
        assert!(s.segment.destroy("c"));
        assert!(!s.segment.contains("c"));
        assert!(!s.segment.destroy("c"));
    }

    #[test]
    fn test_block_alloc_and_recycle() {
        let s = NamedSegment::new("blocks", 1024 * 1024);
        let a = s.segment.alloc_block(4096).unwrap();
        assert_eq!(a % BLOCK_ALIGN, 0);
        let b = s.segment.alloc_block(4096).unwrap();
        assert_ne!(a, b);

        s.segment.free_block(a);
        // First-fit recycles the freed block.
        let c = s.segment.alloc_block(4096).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_block_exhaustion() {
        let s = NamedSegment::new("exhaust", 64 * 1024);
        // Request more than the data area can hold.
        assert!(s.segment.alloc_block(128 * 1024).is_none());
    }

    #[test]
    fn test_offset_ptr_round_trip() {
        let s = NamedSegment::new("offsets", 1024 * 1024);
        let off = s.segment.alloc_block(64).unwrap();
        let ptr = s.segment.offset_to_ptr(off);
        assert_eq!(s.segment.ptr_to_offset(ptr), off);
    }

    #[test]
    fn test_offsets_stable_across_mappings() {
        let s = NamedSegment::new("stable", 1024 * 1024);
        let off = s.segment.alloc_block(64).unwrap();
        unsafe { *s.segment.offset_to_ptr(off) = 0xAB };

        let second = SharedSegment::create(&s.name, 1024 * 1024).unwrap();
        assert_eq!(unsafe { *second.offset_to_ptr(off) }, 0xAB);
    }

    #[test]
    fn test_name_limits() {
        let s = NamedSegment::new("names", 1024 * 1024);
        assert!(s.segment.find_or_construct::<Counter>("").is_err());
        let long = "x".repeat(MAX_OBJECT_NAME + 1);
        assert!(s.segment.find_or_construct::<Counter>(&long).is_err());
        let exact = "y".repeat(MAX_OBJECT_NAME);
        assert!(s.segment.find_or_construct::<Counter>(&exact).is_ok());
    }
}
