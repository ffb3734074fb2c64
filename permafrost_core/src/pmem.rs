use std::collections::HashMap;
use std::fmt;
use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use rustix::fs::{open, Mode, OFlags};

use crate::configs::{Configs, PersistedConfigs, PMEM_BLOCK_BYTES};

const POOL_MAGIC: u32 = 0xF0A1_C0DE;
const POOL_VERSION: u32 = 3;
const CACHE_LINE_BYTES: usize = 64;
const PERSISTED_CONFIG_MAX_BYTES: usize = 120;

pub const NULL_PMEM_OFFSET: u64 = 0;

#[derive(Debug)]
pub enum PmemError {
    InvalidSize(u64),
    MapFile(std::io::Error),
    HeaderCorrupt(String),
    Overflow { requested: u64, remaining: u64 },
    OversizedAllocation { requested: u64, segment: u64 },
    InvalidThread(u16),
}

impl fmt::Display for PmemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PmemError::InvalidSize(size) => write!(f, "pmem pool size {} is invalid", size),
            PmemError::MapFile(err) => write!(f, "failed to map pmem file: {}", err),
            PmemError::HeaderCorrupt(msg) => write!(f, "pmem pool header corrupt: {}", msg),
            PmemError::Overflow {
                requested,
                remaining,
            } => write!(
                f,
                "pmem pool out of space (requested {}, remaining {})",
                requested, remaining
            ),
            PmemError::OversizedAllocation { requested, segment } => write!(
                f,
                "allocation of {} bytes exceeds the {}-byte segment",
                requested, segment
            ),
            PmemError::InvalidThread(tid) => write!(f, "invalid pmem arena thread id {}", tid),
        }
    }
}

impl std::error::Error for PmemError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachMode {
    ColdStart,
    WarmStart,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceEntry {
    pub offset: u64,
    pub size: u64,
}

#[repr(C, align(64))]
struct PoolHeader {
    magic: u32,
    version: u32,
    capacity: u64,
    data_start: u64,
    segment_bytes: u64,
    clean_shutdown: AtomicU32,
    config_len: u32,
    segment_head: AtomicU64,
    config_blob: [u8; PERSISTED_CONFIG_MAX_BYTES],
}

// Per-thread segment cursor plus a block-quantized free list. Only the owning
// thread touches its cache in the fast path; the mutex is uncontended.
#[derive(Debug)]
struct ThreadCache {
    segment_start: u64,
    segment_used: u64,
    free_lists: HashMap<u32, Vec<u64>>,
}

impl ThreadCache {
    fn new() -> Self {
        Self {
            segment_start: NULL_PMEM_OFFSET,
            segment_used: 0,
            free_lists: HashMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct PmemPool {
    base: NonNull<u8>,
    len: usize,
    segment_bytes: u64,
    thread_caches: Vec<Mutex<ThreadCache>>,
}

// SAFETY:
// All mutation of the mapped region goes through atomics or regions reserved
// by a single owner via segment carving.
unsafe impl Send for PmemPool {}
unsafe impl Sync for PmemPool {}

impl PmemPool {
    pub fn open(
        path: impl AsRef<Path>,
        configs: &Configs,
    ) -> Result<(Self, AttachMode), PmemError> {
        let byte_len = configs.pmem_file_size;
        if byte_len == 0 || byte_len > (1 << 47) {
            return Err(PmemError::InvalidSize(byte_len));
        }

        let path = path.as_ref();
        let pre_existing = path.exists();
        let fd = open(
            path,
            OFlags::RDWR | OFlags::CREATE,
            Mode::from_bits(0o600).unwrap_or(Mode::empty()),
        )
        .map_err(|err| PmemError::MapFile(std::io::Error::from_raw_os_error(err.raw_os_error())))?;

        let current_len = if pre_existing {
            std::fs::metadata(path).map_err(PmemError::MapFile)?.len()
        } else {
            0
        };
        if current_len != byte_len {
            let len = libc::off_t::try_from(byte_len).map_err(|_| PmemError::InvalidSize(byte_len))?;
            // SAFETY:
            // `fd` is an open descriptor and `len` was bounds-checked above.
            let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), len) };
            if rc != 0 {
                return Err(PmemError::MapFile(std::io::Error::last_os_error()));
            }
        }

        // SAFETY:
        // `fd` references a file opened read/write with at least `byte_len` bytes.
        let map_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                byte_len as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if map_ptr == libc::MAP_FAILED {
            return Err(PmemError::MapFile(std::io::Error::last_os_error()));
        }
        let base = NonNull::new(map_ptr.cast::<u8>()).ok_or_else(|| {
            PmemError::MapFile(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mmap returned null",
            ))
        })?;

        let pool = Self {
            base,
            len: byte_len as usize,
            segment_bytes: configs.pmem_segment_bytes,
            thread_caches: (0..configs.max_access_threads)
                .map(|_| Mutex::new(ThreadCache::new()))
                .collect(),
        };

        let mode = if pre_existing && pool.header_is_valid() {
            pool.check_persisted_configs(configs)?;
            AttachMode::WarmStart
        } else {
            pool.initialize_header(configs)?;
            AttachMode::ColdStart
        };

        pool.set_clean_shutdown(false);
        Ok((pool, mode))
    }

    fn initialize_header(&self, configs: &Configs) -> Result<(), PmemError> {
        let persisted = PersistedConfigs::from_configs(configs);
        let blob = bincode::serialize(&persisted)
            .map_err(|err| PmemError::HeaderCorrupt(format!("config encode failed: {}", err)))?;
        if blob.len() > PERSISTED_CONFIG_MAX_BYTES {
            return Err(PmemError::HeaderCorrupt(format!(
                "encoded config blob of {} bytes exceeds header slot",
                blob.len()
            )));
        }

        let data_start = align_up(size_of::<PoolHeader>() as u64, PMEM_BLOCK_BYTES);
        if data_start + self.segment_bytes > self.len as u64 {
            return Err(PmemError::InvalidSize(self.len as u64));
        }

        let mut config_blob = [0_u8; PERSISTED_CONFIG_MAX_BYTES];
        config_blob[..blob.len()].copy_from_slice(&blob);

        // SAFETY:
        // Offset 0 of the mapping is reserved for the header; no allocation can
        // hand it out because data_start skips past it.
        unsafe {
            self.header_ptr().write(PoolHeader {
                magic: POOL_MAGIC,
                version: POOL_VERSION,
                capacity: self.len as u64,
                data_start,
                segment_bytes: self.segment_bytes,
                clean_shutdown: AtomicU32::new(1),
                config_len: blob.len() as u32,
                segment_head: AtomicU64::new(data_start),
                config_blob,
            });
        }
        self.persist_header();
        Ok(())
    }

    #[inline]
    fn header_ptr(&self) -> *mut PoolHeader {
        self.base.as_ptr().cast::<PoolHeader>()
    }

    #[inline]
    fn header(&self) -> &PoolHeader {
        // SAFETY:
        // The header occupies the first bytes of the mapping for the lifetime
        // of the pool; callers validate the magic via header_is_valid.
        unsafe { &*self.header_ptr() }
    }

    fn header_is_valid(&self) -> bool {
        let header = self.header();
        header.magic == POOL_MAGIC
            && header.version == POOL_VERSION
            && header.capacity == self.len as u64
            && header.segment_bytes == self.segment_bytes
            && (header.data_start as usize) < self.len
            && header.config_len as usize <= PERSISTED_CONFIG_MAX_BYTES
            && header.segment_head.load(Ordering::Acquire) >= header.data_start
            && header.segment_head.load(Ordering::Acquire) <= header.capacity
    }

    fn check_persisted_configs(&self, configs: &Configs) -> Result<(), PmemError> {
        let header = self.header();
        let len = header.config_len as usize;
        let persisted: PersistedConfigs = bincode::deserialize(&header.config_blob[..len])
            .map_err(|err| PmemError::HeaderCorrupt(format!("config decode failed: {}", err)))?;
        persisted
            .check_compatible(configs)
            .map_err(|err| PmemError::HeaderCorrupt(err.to_string()))
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.len as u64
    }

    #[inline]
    pub fn data_start(&self) -> u64 {
        self.header().data_start
    }

    #[inline]
    pub fn segment_bytes(&self) -> u64 {
        self.segment_bytes
    }

    #[inline]
    pub fn segment_head(&self) -> u64 {
        self.header().segment_head.load(Ordering::Acquire)
    }

    pub fn set_clean_shutdown(&self, value: bool) {
        let header = self.header();
        header
            .clean_shutdown
            .store(if value { 1 } else { 0 }, Ordering::Release);
        self.persist_header();
    }

    #[inline]
    pub fn clean_shutdown(&self) -> bool {
        self.header().clean_shutdown.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn offset_to_addr(&self, offset: u64) -> Option<*mut u8> {
        if offset == NULL_PMEM_OFFSET || offset >= self.len as u64 {
            return None;
        }
        Some((self.base.as_ptr() as usize + offset as usize) as *mut u8)
    }

    #[inline]
    pub fn addr_to_offset(&self, addr: *const u8) -> Option<u64> {
        let base = self.base.as_ptr() as usize;
        let addr = addr as usize;
        if addr < base || addr >= base + self.len {
            return None;
        }
        Some((addr - base) as u64)
    }

    #[inline]
    pub fn contains_range(&self, offset: u64, len: u64) -> bool {
        offset != NULL_PMEM_OFFSET
            && offset < self.len as u64
            && offset.checked_add(len).map(|end| end <= self.len as u64) == Some(true)
    }

    pub fn persist(&self, addr: *const u8, len: usize) {
        if len == 0 {
            return;
        }
        #[cfg(target_arch = "x86_64")]
        // SAFETY:
        // clflush on mapped addresses is always safe; the fence orders the
        // flushes against later stores.
        unsafe {
            let start = (addr as usize) & !(CACHE_LINE_BYTES - 1);
            let end = addr as usize + len;
            let mut line = start;
            while line < end {
                core::arch::x86_64::_mm_clflush(line as *const u8);
                line += CACHE_LINE_BYTES;
            }
            core::arch::x86_64::_mm_sfence();
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = addr;
            std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[inline]
    pub fn persist_offset(&self, offset: u64, len: usize) {
        if let Some(addr) = self.offset_to_addr(offset) {
            self.persist(addr, len);
        }
    }

    fn persist_header(&self) {
        self.persist(self.base.as_ptr(), size_of::<PoolHeader>());
    }

    pub fn allocate(&self, tid: u16, size: u64) -> Result<SpaceEntry, PmemError> {
        let blocks = size.div_ceil(PMEM_BLOCK_BYTES);
        let rounded = blocks * PMEM_BLOCK_BYTES;
        if rounded > self.segment_bytes {
            return Err(PmemError::OversizedAllocation {
                requested: rounded,
                segment: self.segment_bytes,
            });
        }

        let cache = self
            .thread_caches
            .get(tid as usize)
            .ok_or(PmemError::InvalidThread(tid))?;
        let mut cache = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(list) = cache.free_lists.get_mut(&(blocks as u32)) {
            if let Some(offset) = list.pop() {
                return Ok(SpaceEntry {
                    offset,
                    size: rounded,
                });
            }
        }

        if cache.segment_start == NULL_PMEM_OFFSET
            || cache.segment_used + rounded > self.segment_bytes
        {
            cache.segment_start = self.grab_segment()?;
            cache.segment_used = 0;
        }

        let offset = cache.segment_start + cache.segment_used;
        cache.segment_used += rounded;
        Ok(SpaceEntry {
            offset,
            size: rounded,
        })
    }

    pub fn free(&self, tid: u16, entry: SpaceEntry) -> Result<(), PmemError> {
        let blocks = (entry.size / PMEM_BLOCK_BYTES) as u32;
        let cache = self
            .thread_caches
            .get(tid as usize)
            .ok_or(PmemError::InvalidThread(tid))?;
        let mut cache = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.free_lists.entry(blocks).or_default().push(entry.offset);
        Ok(())
    }

    // Recovery rebuilds free lists single-threaded; spread recovered space
    // round-robin so the first writer threads can reuse it.
    pub fn restock_free_space(&self, entry: SpaceEntry) {
        let blocks = (entry.size / PMEM_BLOCK_BYTES) as u32;
        let slot = (entry.offset / PMEM_BLOCK_BYTES) as usize % self.thread_caches.len();
        let mut cache = self.thread_caches[slot]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.free_lists.entry(blocks).or_default().push(entry.offset);
    }

    fn grab_segment(&self) -> Result<u64, PmemError> {
        let header = self.header();
        loop {
            let head = header.segment_head.load(Ordering::Acquire);
            let end = head
                .checked_add(self.segment_bytes)
                .ok_or(PmemError::InvalidSize(head))?;
            if end > header.capacity {
                return Err(PmemError::Overflow {
                    requested: self.segment_bytes,
                    remaining: header.capacity.saturating_sub(head),
                });
            }
            if header
                .segment_head
                .compare_exchange(head, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.persist_header();
                return Ok(head);
            }
            std::hint::spin_loop();
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        let data_start = self.data_start();
        let head = self.segment_head();
        let segment_bytes = self.segment_bytes;
        (0..)
            .map(move |i| data_start + i as u64 * segment_bytes)
            .take_while(move |start| *start < head)
            .map(move |start| (start, start + segment_bytes))
    }
}

impl Drop for PmemPool {
    fn drop(&mut self) {
        // SAFETY:
        // `base` and `len` originate from a successful mmap in `open`.
        let rc = unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
        debug_assert_eq!(rc, 0, "munmap failed: {}", std::io::Error::last_os_error());
    }
}

#[inline]
fn align_up(value: u64, align: u64) -> u64 {
    let mask = align - 1;
    (value + mask) & !mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_configs() -> Configs {
        let mut configs = Configs::default();
        configs.pmem_file_size = 8 << 20;
        configs.pmem_segment_bytes = 1 << 20;
        configs.hash_bucket_num = 1 << 10;
        configs.dram_arena_bytes = 4 << 20;
        configs.max_access_threads = 4;
        configs
    }

    #[test]
    fn cold_then_warm_attach_reuses_pool_file() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let path = dir.path().join("pool");
        let configs = small_configs();

        let (first, mode) = PmemPool::open(&path, &configs).expect("first open failed");
        assert_eq!(mode, AttachMode::ColdStart);
        let entry = first.allocate(0, 96).expect("alloc failed");
        assert_eq!(entry.size, 128, "96 bytes rounds up to two blocks");
        let head_before = first.segment_head();
        first.set_clean_shutdown(true);
        drop(first);

        let (second, mode) = PmemPool::open(&path, &configs).expect("second open failed");
        assert_eq!(mode, AttachMode::WarmStart);
        assert_eq!(second.segment_head(), head_before);
        assert!(!second.clean_shutdown(), "open clears the flag");
    }

    #[test]
    fn warm_attach_rejects_layout_change() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let path = dir.path().join("pool");
        let configs = small_configs();
        {
            let _pool = PmemPool::open(&path, &configs).expect("first open failed");
        }

        let mut changed = configs.clone();
        changed.pmem_segment_bytes = 2 << 20;
        let err = PmemPool::open(&path, &changed).expect_err("layout change must fail");
        assert!(matches!(err, PmemError::HeaderCorrupt(_)), "got {:?}", err);
    }

    #[test]
    fn offsets_and_addresses_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let (pool, _) =
            PmemPool::open(dir.path().join("pool"), &small_configs()).expect("open failed");
        let entry = pool.allocate(1, 64).expect("alloc failed");
        let addr = pool.offset_to_addr(entry.offset).expect("offset invalid");
        assert_eq!(pool.addr_to_offset(addr), Some(entry.offset));
        assert!(pool.offset_to_addr(NULL_PMEM_OFFSET).is_none());
        assert!(pool.offset_to_addr(pool.capacity()).is_none());
    }

    #[test]
    fn free_list_recycles_same_block_class() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let (pool, _) =
            PmemPool::open(dir.path().join("pool"), &small_configs()).expect("open failed");
        let entry = pool.allocate(0, 200).expect("alloc failed");
        pool.free(0, entry).expect("free failed");
        let again = pool.allocate(0, 200).expect("realloc failed");
        assert_eq!(again.offset, entry.offset, "freed space should be reused");
    }

    #[test]
    fn exhausting_segments_reports_overflow() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let mut configs = small_configs();
        configs.pmem_file_size = 2 << 20;
        let (pool, _) =
            PmemPool::open(dir.path().join("pool"), &configs).expect("open failed");

        // The header consumes part of the first segment's span, so only one
        // full segment is grabbable.
        let first = pool.grab_segment().expect("first segment grab");
        assert!(first >= pool.data_start());
        let err = pool.grab_segment().expect_err("pool should be exhausted");
        assert!(matches!(err, PmemError::Overflow { .. }));
    }
}
