use std::collections::HashMap;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub const NULL_DRAM_OFFSET: u64 = 0;
const ARENA_ALIGN: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DramError {
    InvalidSize(usize),
    ZeroSized,
    OutOfMemory { requested: u64, remaining: u64 },
}

impl fmt::Display for DramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DramError::InvalidSize(size) => write!(f, "dram arena size {} is invalid", size),
            DramError::ZeroSized => write!(f, "zero-sized dram allocations are not supported"),
            DramError::OutOfMemory {
                requested,
                remaining,
            } => write!(
                f,
                "dram arena out of memory (requested {}, remaining {})",
                requested, remaining
            ),
        }
    }
}

impl std::error::Error for DramError {}

// Anonymous mapping addressed by u64 offsets. Hash bucket chunks, skip-list
// nodes and node towers live here; offsets stored in hash entries stay valid
// for the arena's lifetime while raw pointers would not survive growth or
// serialization.
pub struct DramArena {
    base: NonNull<u8>,
    len: usize,
    head: AtomicU64,
    free_lists: Mutex<HashMap<u64, Vec<u64>>>,
}

// SAFETY:
// The bump head and free lists serialize region reservation; the mapped bytes
// themselves are plain memory handed out to at most one owner at a time.
unsafe impl Send for DramArena {}
unsafe impl Sync for DramArena {}

impl DramArena {
    pub fn new(byte_len: usize) -> Result<Self, DramError> {
        if byte_len < ARENA_ALIGN as usize * 2 {
            return Err(DramError::InvalidSize(byte_len));
        }

        // SAFETY:
        // Anonymous private mapping; zero-filled by the kernel.
        let map_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                byte_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if map_ptr == libc::MAP_FAILED {
            return Err(DramError::InvalidSize(byte_len));
        }
        let base = NonNull::new(map_ptr.cast::<u8>()).ok_or(DramError::InvalidSize(byte_len))?;

        Ok(Self {
            base,
            len: byte_len,
            // Offset 0 is the null sentinel; the first usable offset skips it.
            head: AtomicU64::new(ARENA_ALIGN),
            free_lists: Mutex::new(HashMap::new()),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn resolve(&self, offset: u64) -> Option<*mut u8> {
        if offset == NULL_DRAM_OFFSET || offset >= self.len as u64 {
            return None;
        }
        Some((self.base.as_ptr() as usize + offset as usize) as *mut u8)
    }

    #[inline]
    pub fn resolve_range(&self, offset: u64, len: u64) -> Option<*mut u8> {
        if offset == NULL_DRAM_OFFSET {
            return None;
        }
        let end = offset.checked_add(len)?;
        if end > self.len as u64 {
            return None;
        }
        Some((self.base.as_ptr() as usize + offset as usize) as *mut u8)
    }

    pub fn alloc(&self, size: u64) -> Result<u64, DramError> {
        if size == 0 {
            return Err(DramError::ZeroSized);
        }
        let rounded = align_up(size, ARENA_ALIGN);

        {
            let mut lists = self
                .free_lists
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(list) = lists.get_mut(&rounded) {
                if let Some(offset) = list.pop() {
                    drop(lists);
                    // Reused space must come back zeroed like a fresh mapping.
                    if let Some(addr) = self.resolve_range(offset, rounded) {
                        // SAFETY:
                        // The region was reserved by a prior alloc of the same
                        // size class and is owned by no one while free-listed.
                        unsafe { ptr::write_bytes(addr, 0, rounded as usize) };
                    }
                    return Ok(offset);
                }
            }
        }

        let mut spins = 0_u32;
        loop {
            let head = self.head.load(Ordering::Acquire);
            let end = head.checked_add(rounded).ok_or(DramError::OutOfMemory {
                requested: rounded,
                remaining: 0,
            })?;
            if end > self.len as u64 {
                return Err(DramError::OutOfMemory {
                    requested: rounded,
                    remaining: self.len as u64 - head,
                });
            }
            if self
                .head
                .compare_exchange(head, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(head);
            }
            spins = spins.wrapping_add(1);
            if spins & 0x3f == 0 {
                std::thread::yield_now();
            }
            std::hint::spin_loop();
        }
    }

    pub fn free(&self, offset: u64, size: u64) {
        if offset == NULL_DRAM_OFFSET || size == 0 {
            return;
        }
        let rounded = align_up(size, ARENA_ALIGN);
        let mut lists = self
            .free_lists
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        lists.entry(rounded).or_default().push(offset);
    }
}

impl Drop for DramArena {
    fn drop(&mut self) {
        // SAFETY:
        // `base` and `len` originate from a successful mmap in `new`.
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

    #[test]
    fn offsets_start_past_the_null_sentinel() {
        let arena = DramArena::new(1 << 20).expect("arena alloc failed");
        let offset = arena.alloc(8).expect("alloc failed");
        assert_ne!(offset, NULL_DRAM_OFFSET);
        assert!(arena.resolve(NULL_DRAM_OFFSET).is_none());
        assert!(arena.resolve(offset).is_some());
    }

    #[test]
    fn freed_space_is_reused_and_zeroed() {
        let arena = DramArena::new(1 << 20).expect("arena alloc failed");
        let offset = arena.alloc(64).expect("alloc failed");
        let addr = arena.resolve_range(offset, 64).expect("resolve failed");
        // SAFETY: region uniquely owned by this test.
        unsafe { ptr::write_bytes(addr, 0xAB, 64) };
        arena.free(offset, 64);

        let again = arena.alloc(64).expect("realloc failed");
        assert_eq!(again, offset);
        let addr = arena.resolve_range(again, 64).expect("resolve failed");
        // SAFETY: region uniquely owned after alloc.
        let bytes = unsafe { std::slice::from_raw_parts(addr, 64) };
        assert!(bytes.iter().all(|b| *b == 0), "reused space must be zeroed");
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let arena = DramArena::new(4096).expect("arena alloc failed");
        let err = arena.alloc(1 << 20).expect_err("oversized alloc must fail");
        assert!(matches!(err, DramError::OutOfMemory { .. }));
    }

    #[test]
    fn resolve_range_rejects_out_of_bounds_spans() {
        let arena = DramArena::new(4096).expect("arena alloc failed");
        let offset = arena.alloc(128).expect("alloc failed");
        assert!(arena.resolve_range(offset, 128).is_some());
        assert!(arena.resolve_range(offset, 1 << 20).is_none());
    }
}
