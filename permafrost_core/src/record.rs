use std::mem::size_of;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use crate::pmem::PmemPool;

pub const STRING_PUT_RECORD: u16 = 1 << 0;
pub const STRING_DELETE_RECORD: u16 = 1 << 1;
pub const SORTED_PUT_RECORD: u16 = 1 << 2;
pub const SORTED_DELETE_RECORD: u16 = 1 << 3;
pub const SORTED_HEADER_RECORD: u16 = 1 << 4;
pub const PADDING_RECORD: u16 = 1 << 5;

pub const STRING_RECORD_MASK: u16 = STRING_PUT_RECORD | STRING_DELETE_RECORD;
pub const SORTED_ELEM_MASK: u16 = SORTED_PUT_RECORD | SORTED_DELETE_RECORD;
pub const SORTED_RECORD_MASK: u16 = SORTED_ELEM_MASK | SORTED_HEADER_RECORD;
pub const ANY_RECORD_MASK: u16 = STRING_RECORD_MASK | SORTED_RECORD_MASK;

#[inline]
pub fn is_sorted_type(record_type: u16) -> bool {
    record_type & SORTED_RECORD_MASK != 0
}

#[inline]
pub fn is_delete_type(record_type: u16) -> bool {
    record_type & (STRING_DELETE_RECORD | SORTED_DELETE_RECORD) != 0
}

#[inline]
pub fn is_valid_type(record_type: u16) -> bool {
    matches!(
        record_type,
        STRING_PUT_RECORD
            | STRING_DELETE_RECORD
            | SORTED_PUT_RECORD
            | SORTED_DELETE_RECORD
            | SORTED_HEADER_RECORD
            | PADDING_RECORD
    )
}

// Record layout on pmem, immutable after the initial persist except for the
// type tag (rewritten to PADDING_RECORD when string space is recycled) and
// the prev/next links of sorted records:
//
//   RecordMeta | prev,next (sorted types only) | key bytes | value bytes
#[repr(C)]
pub struct RecordMeta {
    pub checksum: u32,
    pub alloc_len: u32,
    record_type: AtomicU16,
    pub key_len: u16,
    pub value_len: u32,
    pub timestamp: u64,
}

#[repr(C)]
pub struct SortedLinks {
    pub prev: AtomicU64,
    pub next: AtomicU64,
}

pub const RECORD_META_BYTES: usize = size_of::<RecordMeta>();
pub const SORTED_LINKS_BYTES: usize = size_of::<SortedLinks>();

#[inline]
pub fn required_len(record_type: u16, key_len: usize, value_len: usize) -> u64 {
    let header = if is_sorted_type(record_type) {
        RECORD_META_BYTES + SORTED_LINKS_BYTES
    } else {
        RECORD_META_BYTES
    };
    (header + key_len + value_len) as u64
}

pub fn compute_checksum(
    record_type: u16,
    timestamp: u64,
    key: &[u8],
    value: &[u8],
) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&record_type.to_le_bytes());
    hasher.update(&(key.len() as u16).to_le_bytes());
    hasher.update(&(value.len() as u32).to_le_bytes());
    hasher.update(&timestamp.to_le_bytes());
    hasher.update(key);
    hasher.update(value);
    hasher.finalize()
}

// A validated view over one record. Construction bounds-checks the meta block
// and the key/value extents against the pool; the type tag is re-read through
// the atomic on every access since string records can turn into padding.
#[derive(Clone, Copy)]
pub struct Record<'a> {
    addr: *const u8,
    offset: u64,
    _pool: std::marker::PhantomData<&'a PmemPool>,
}

impl<'a> Record<'a> {
    pub fn at(pool: &'a PmemPool, offset: u64) -> Option<Self> {
        let addr = pool.offset_to_addr(offset)?;
        if !pool.contains_range(offset, RECORD_META_BYTES as u64) {
            return None;
        }
        let record = Self {
            addr: addr.cast_const(),
            offset,
            _pool: std::marker::PhantomData,
        };
        let meta = record.meta();
        let alloc_len = meta.alloc_len as u64;
        if alloc_len < RECORD_META_BYTES as u64 || !pool.contains_range(offset, alloc_len) {
            return None;
        }
        let record_type = record.record_type();
        let body = required_len(record_type, meta.key_len as usize, meta.value_len as usize);
        if body > alloc_len {
            return None;
        }
        Some(record)
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn meta(&self) -> &'a RecordMeta {
        // SAFETY:
        // `at` verified that a full RecordMeta lies inside the pool at `addr`.
        unsafe { &*self.addr.cast::<RecordMeta>() }
    }

    #[inline]
    pub fn record_type(&self) -> u16 {
        self.meta().record_type.load(Ordering::Acquire)
    }

    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.meta().timestamp
    }

    #[inline]
    pub fn alloc_len(&self) -> u32 {
        self.meta().alloc_len
    }

    pub fn links(&self) -> Option<&'a SortedLinks> {
        if !is_sorted_type(self.record_type()) {
            return None;
        }
        // SAFETY:
        // `at` verified the sorted body extent for sorted types.
        Some(unsafe {
            &*self
                .addr
                .add(RECORD_META_BYTES)
                .cast::<SortedLinks>()
        })
    }

    #[inline]
    fn body_start(&self) -> usize {
        if is_sorted_type(self.record_type()) {
            RECORD_META_BYTES + SORTED_LINKS_BYTES
        } else {
            RECORD_META_BYTES
        }
    }

    pub fn key(&self) -> &'a [u8] {
        let meta = self.meta();
        // SAFETY:
        // `at` verified that key and value extents lie inside the allocation.
        unsafe {
            std::slice::from_raw_parts(self.addr.add(self.body_start()), meta.key_len as usize)
        }
    }

    pub fn value(&self) -> &'a [u8] {
        let meta = self.meta();
        // SAFETY:
        // `at` verified that key and value extents lie inside the allocation.
        unsafe {
            std::slice::from_raw_parts(
                self.addr.add(self.body_start() + meta.key_len as usize),
                meta.value_len as usize,
            )
        }
    }

    pub fn verify_checksum(&self) -> bool {
        let meta = self.meta();
        let record_type = self.record_type();
        if !is_valid_type(record_type) || record_type == PADDING_RECORD {
            return false;
        }
        meta.checksum == compute_checksum(record_type, meta.timestamp, self.key(), self.value())
    }
}

// Writes a record into space reserved by the caller. The caller persists the
// full extent afterwards; nothing references the record until then.
pub fn write_record(
    pool: &PmemPool,
    offset: u64,
    alloc_len: u32,
    record_type: u16,
    timestamp: u64,
    key: &[u8],
    value: &[u8],
    links: Option<(u64, u64)>,
) {
    debug_assert!(is_valid_type(record_type));
    debug_assert_eq!(is_sorted_type(record_type), links.is_some());
    debug_assert!(required_len(record_type, key.len(), value.len()) <= alloc_len as u64);

    let addr = pool
        .offset_to_addr(offset)
        .expect("record write offset must be inside the pool");

    // SAFETY:
    // The caller owns [offset, offset + alloc_len) via the pmem allocator and
    // nothing else references it yet.
    unsafe {
        let meta = addr.cast::<RecordMeta>();
        meta.write(RecordMeta {
            checksum: compute_checksum(record_type, timestamp, key, value),
            alloc_len,
            record_type: AtomicU16::new(record_type),
            key_len: key.len() as u16,
            value_len: value.len() as u32,
            timestamp,
        });

        let mut cursor = addr.add(RECORD_META_BYTES);
        if let Some((prev, next)) = links {
            cursor.cast::<SortedLinks>().write(SortedLinks {
                prev: AtomicU64::new(prev),
                next: AtomicU64::new(next),
            });
            cursor = cursor.add(SORTED_LINKS_BYTES);
        }
        std::ptr::copy_nonoverlapping(key.as_ptr(), cursor, key.len());
        std::ptr::copy_nonoverlapping(value.as_ptr(), cursor.add(key.len()), value.len());
    }
}

// Raw look at a possibly torn or zeroed slot, for the recovery segment scan.
// Returns (alloc_len, record_type) without validating body extents.
pub fn peek_meta(pool: &PmemPool, offset: u64) -> Option<(u32, u16)> {
    if !pool.contains_range(offset, RECORD_META_BYTES as u64) {
        return None;
    }
    let addr = pool.offset_to_addr(offset)?;
    // SAFETY:
    // The meta extent was bounds-checked; fields are read through a shared
    // reference and the type tag through its atomic.
    let meta = unsafe { &*addr.cast_const().cast::<RecordMeta>() };
    Some((meta.alloc_len, meta.record_type.load(Ordering::Acquire)))
}

pub fn mark_padding(pool: &PmemPool, record: Record<'_>) {
    record
        .meta()
        .record_type
        .store(PADDING_RECORD, Ordering::Release);
    pool.persist(record.addr, RECORD_META_BYTES);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::Configs;
    use crate::pmem::PmemPool;

    fn pool() -> (tempfile::TempDir, PmemPool) {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let mut configs = Configs::default();
        configs.pmem_file_size = 8 << 20;
        configs.pmem_segment_bytes = 1 << 20;
        configs.hash_bucket_num = 1 << 10;
        configs.dram_arena_bytes = 4 << 20;
        configs.max_access_threads = 2;
        let (pool, _) = PmemPool::open(dir.path().join("pool"), &configs).expect("open failed");
        (dir, pool)
    }

    #[test]
    fn string_record_round_trips_and_checksums() {
        let (_dir, pool) = pool();
        let len = required_len(STRING_PUT_RECORD, 3, 5);
        let entry = pool.allocate(0, len).expect("alloc failed");
        write_record(
            &pool,
            entry.offset,
            entry.size as u32,
            STRING_PUT_RECORD,
            42,
            b"key",
            b"value",
            None,
        );

        let record = Record::at(&pool, entry.offset).expect("record should parse");
        assert_eq!(record.record_type(), STRING_PUT_RECORD);
        assert_eq!(record.timestamp(), 42);
        assert_eq!(record.key(), b"key");
        assert_eq!(record.value(), b"value");
        assert!(record.links().is_none());
        assert!(record.verify_checksum());
    }

    #[test]
    fn sorted_record_carries_links() {
        let (_dir, pool) = pool();
        let len = required_len(SORTED_PUT_RECORD, 4, 2);
        let entry = pool.allocate(0, len).expect("alloc failed");
        write_record(
            &pool,
            entry.offset,
            entry.size as u32,
            SORTED_PUT_RECORD,
            7,
            b"abcd",
            b"xy",
            Some((100, 200)),
        );

        let record = Record::at(&pool, entry.offset).expect("record should parse");
        let links = record.links().expect("sorted record must expose links");
        assert_eq!(links.prev.load(Ordering::Acquire), 100);
        assert_eq!(links.next.load(Ordering::Acquire), 200);
        assert_eq!(record.key(), b"abcd");
        assert!(record.verify_checksum());
    }

    #[test]
    fn padding_invalidates_the_checksum_but_keeps_alloc_len() {
        let (_dir, pool) = pool();
        let len = required_len(STRING_PUT_RECORD, 1, 1);
        let entry = pool.allocate(0, len).expect("alloc failed");
        write_record(
            &pool,
            entry.offset,
            entry.size as u32,
            STRING_PUT_RECORD,
            1,
            b"k",
            b"v",
            None,
        );

        let record = Record::at(&pool, entry.offset).expect("record should parse");
        mark_padding(&pool, record);
        let record = Record::at(&pool, entry.offset).expect("padding still parses");
        assert_eq!(record.record_type(), PADDING_RECORD);
        assert_eq!(record.alloc_len(), entry.size as u32);
        assert!(!record.verify_checksum());
    }

    #[test]
    fn corrupt_value_bytes_fail_verification() {
        let (_dir, pool) = pool();
        let len = required_len(STRING_PUT_RECORD, 3, 3);
        let entry = pool.allocate(0, len).expect("alloc failed");
        write_record(
            &pool,
            entry.offset,
            entry.size as u32,
            STRING_PUT_RECORD,
            9,
            b"abc",
            b"def",
            None,
        );

        let value_off = entry.offset + RECORD_META_BYTES as u64 + 3;
        let addr = pool.offset_to_addr(value_off).expect("value addr");
        // SAFETY: flipping one byte inside this test's own allocation.
        unsafe { *addr = b'X' };

        let record = Record::at(&pool, entry.offset).expect("record should parse");
        assert!(!record.verify_checksum());
    }

    #[test]
    fn records_beyond_the_pool_do_not_parse() {
        let (_dir, pool) = pool();
        assert!(Record::at(&pool, 0).is_none());
        assert!(Record::at(&pool, pool.capacity() - 4).is_none());
    }
}
