use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_64;

use crate::configs::{Configs, HASH_ENTRY_BYTES};
use crate::dram::{DramArena, DramError, NULL_DRAM_OFFSET};
use crate::pmem::PmemPool;
use crate::record::{
    Record, SORTED_DELETE_RECORD, SORTED_HEADER_RECORD, SORTED_PUT_RECORD, STRING_DELETE_RECORD,
    STRING_PUT_RECORD,
};
use crate::skiplist::SkiplistNode;

#[derive(Debug)]
pub enum HashTableError {
    MemoryOverflow(DramError),
    InvalidEntry(u64),
}

impl fmt::Display for HashTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashTableError::MemoryOverflow(err) => {
                write!(f, "hash table allocation failed: {}", err)
            }
            HashTableError::InvalidEntry(offset) => {
                write!(f, "invalid hash entry offset {}", offset)
            }
        }
    }
}

impl std::error::Error for HashTableError {}

impl From<DramError> for HashTableError {
    fn from(value: DramError) -> Self {
        HashTableError::MemoryOverflow(value)
    }
}

#[repr(align(64))]
pub struct SpinMutex {
    locked: AtomicBool,
}

impl SpinMutex {
    #[inline]
    fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lock(&self) {
        let mut spins = 0_u32;
        loop {
            if self.try_lock() {
                return;
            }
            spins = spins.wrapping_add(1);
            if spins & 0x3f == 0 {
                std::thread::yield_now();
            }
            if spins & 0x3ff == 0 {
                std::thread::sleep(std::time::Duration::from_micros(25));
            }
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct KeyHashHint {
    pub hash: u64,
    pub bucket: u64,
    pub slot: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashEntrySnapshot {
    pub key_prefix: u32,
    pub record_type: u16,
    pub payload: u64,
}

impl HashEntrySnapshot {
    #[inline]
    fn from_raw(meta: u64, payload: u64) -> Self {
        Self {
            key_prefix: meta as u32,
            record_type: (meta >> 32) as u16,
            payload,
        }
    }

    #[inline]
    fn pack_meta(key_prefix: u32, record_type: u16) -> u64 {
        key_prefix as u64 | ((record_type as u64) << 32)
    }
}

// One 16-byte slot: the prefix/tag half and the payload half are independent
// atomics, so lock-free readers can observe a torn pair. They re-verify the
// full key against the referenced record before trusting a match.
#[repr(C)]
struct HashEntry {
    meta: AtomicU64,
    payload: AtomicU64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryRef {
    offset: u64,
}

#[derive(Debug)]
pub enum SearchOutcome {
    Found {
        entry: EntryRef,
        snapshot: HashEntrySnapshot,
    },
    NotFound {
        free: Option<EntryRef>,
    },
}

#[repr(align(64))]
struct Slot {
    spin: SpinMutex,
}

pub struct HashTable {
    arena: Arc<DramArena>,
    buckets_offset: u64,
    num_buckets: u64,
    bucket_size: u32,
    entries_per_bucket: u32,
    num_buckets_per_slot: u64,
    slots: Box<[Slot]>,
    bucket_entries: Box<[AtomicU32]>,
}

impl HashTable {
    pub fn new(arena: Arc<DramArena>, configs: &Configs) -> Result<Self, HashTableError> {
        let num_buckets = configs.hash_bucket_num;
        let bucket_size = configs.hash_bucket_size;
        let buckets_offset = arena.alloc(num_buckets * bucket_size as u64)?;
        let num_slots = (num_buckets / configs.num_buckets_per_slot) as usize;

        Ok(Self {
            arena,
            buckets_offset,
            num_buckets,
            bucket_size,
            entries_per_bucket: configs.entries_per_bucket(),
            num_buckets_per_slot: configs.num_buckets_per_slot,
            slots: (0..num_slots.max(1)).map(|_| Slot { spin: SpinMutex::new() }).collect(),
            bucket_entries: (0..num_buckets).map(|_| AtomicU32::new(0)).collect(),
        })
    }

    #[inline]
    pub fn hash_key(key: &[u8]) -> u64 {
        xxh3_64(key)
    }

    pub fn hint(&self, key: &[u8]) -> KeyHashHint {
        let hash = Self::hash_key(key);
        let bucket = hash & (self.num_buckets - 1);
        KeyHashHint {
            hash,
            bucket,
            slot: (bucket / self.num_buckets_per_slot) as usize,
        }
    }

    #[inline]
    pub fn slot_lock(&self, slot: usize) -> &SpinMutex {
        &self.slots[slot].spin
    }

    #[inline]
    pub fn slot_lock_addr(&self, slot: usize) -> usize {
        &self.slots[slot].spin as *const SpinMutex as usize
    }

    // Scans the bucket chain for a live entry whose type is in `type_mask` and
    // whose referenced record carries exactly `key`. Lock-free unless
    // `for_write`, in which case the caller must hold the shard lock and the
    // outcome also carries the slot a new entry would go to.
    pub fn search(
        &self,
        hint: &KeyHashHint,
        key: &[u8],
        type_mask: u16,
        pool: &PmemPool,
        for_write: bool,
    ) -> Result<SearchOutcome, HashTableError> {
        let total = self.bucket_entries[hint.bucket as usize].load(Ordering::Acquire);
        let mut chunk_offset = self.buckets_offset + hint.bucket * self.bucket_size as u64;
        let mut scanned = 0_u32;

        loop {
            let in_this_chunk = (total - scanned).min(self.entries_per_bucket);
            for i in 0..in_this_chunk {
                let entry_offset = chunk_offset + i as u64 * HASH_ENTRY_BYTES as u64;
                let snapshot = self.load_entry(entry_offset)?;
                if snapshot.key_prefix == hint.hash as u32
                    && snapshot.record_type & type_mask != 0
                    && self.entry_matches_key(&snapshot, key, pool)
                {
                    return Ok(SearchOutcome::Found {
                        entry: EntryRef {
                            offset: entry_offset,
                        },
                        snapshot,
                    });
                }
            }
            scanned += in_this_chunk;
            if scanned >= total {
                break;
            }
            chunk_offset = match self.chunk_next(chunk_offset)? {
                Some(next) => next,
                None => break,
            };
        }

        if !for_write {
            return Ok(SearchOutcome::NotFound { free: None });
        }

        // Caller holds the shard lock: `total` is stable and `chunk_offset` is
        // the chunk holding entry index `scanned`'s chain position.
        let index_in_chunk = total % self.entries_per_bucket;
        let chunk_offset = if total > 0 && index_in_chunk == 0 {
            // The chain is exactly full. A chunk linked by an earlier write
            // whose entry never landed gets reused before growing again.
            match self.chunk_next(chunk_offset)? {
                Some(existing) => existing,
                None => {
                    let new_chunk = self.arena.alloc(self.bucket_size as u64)?;
                    self.chunk_set_next(chunk_offset, new_chunk)?;
                    new_chunk
                }
            }
        } else {
            chunk_offset
        };

        Ok(SearchOutcome::NotFound {
            free: Some(EntryRef {
                offset: chunk_offset + index_in_chunk as u64 * HASH_ENTRY_BYTES as u64,
            }),
        })
    }

    // Caller holds the shard lock. For a fresh entry the payload/meta halves
    // become readable only once the bucket count is published.
    pub fn insert(
        &self,
        hint: &KeyHashHint,
        entry: EntryRef,
        record_type: u16,
        payload: u64,
        is_update: bool,
    ) -> Result<(), HashTableError> {
        let slot = self.entry_slot(entry.offset)?;
        slot.payload.store(payload, Ordering::Release);
        slot.meta.store(
            HashEntrySnapshot::pack_meta(hint.hash as u32, record_type),
            Ordering::Release,
        );
        if !is_update {
            self.bucket_entries[hint.bucket as usize].fetch_add(1, Ordering::Release);
        }
        Ok(())
    }

    pub fn load_entry(&self, entry_offset: u64) -> Result<HashEntrySnapshot, HashTableError> {
        let slot = self.entry_slot(entry_offset)?;
        let meta = slot.meta.load(Ordering::Acquire);
        let payload = slot.payload.load(Ordering::Acquire);
        Ok(HashEntrySnapshot::from_raw(meta, payload))
    }

    pub fn reload(&self, entry: EntryRef) -> Result<HashEntrySnapshot, HashTableError> {
        self.load_entry(entry.offset)
    }

    fn entry_slot(&self, entry_offset: u64) -> Result<&HashEntry, HashTableError> {
        let addr = self
            .arena
            .resolve_range(entry_offset, HASH_ENTRY_BYTES as u64)
            .ok_or(HashTableError::InvalidEntry(entry_offset))?;
        // SAFETY:
        // The 16-byte extent was bounds-checked and entries are only ever
        // accessed through atomics.
        Ok(unsafe { &*addr.cast_const().cast::<HashEntry>() })
    }

    fn chunk_next(&self, chunk_offset: u64) -> Result<Option<u64>, HashTableError> {
        let next_offset = chunk_offset + self.bucket_size as u64 - 8;
        let addr = self
            .arena
            .resolve_range(next_offset, 8)
            .ok_or(HashTableError::InvalidEntry(next_offset))?;
        // SAFETY: bounds-checked 8-byte extent read through an atomic.
        let next = unsafe { &*addr.cast_const().cast::<AtomicU64>() }.load(Ordering::Acquire);
        Ok(if next == NULL_DRAM_OFFSET {
            None
        } else {
            Some(next)
        })
    }

    fn chunk_set_next(&self, chunk_offset: u64, next: u64) -> Result<(), HashTableError> {
        let next_offset = chunk_offset + self.bucket_size as u64 - 8;
        let addr = self
            .arena
            .resolve_range(next_offset, 8)
            .ok_or(HashTableError::InvalidEntry(next_offset))?;
        // SAFETY: bounds-checked 8-byte extent written through an atomic.
        unsafe { &*addr.cast_const().cast::<AtomicU64>() }.store(next, Ordering::Release);
        Ok(())
    }

    // The cheap prefix filter already matched; confirm against the full key
    // bytes of whatever the payload references.
    fn entry_matches_key(&self, snapshot: &HashEntrySnapshot, key: &[u8], pool: &PmemPool) -> bool {
        match snapshot.record_type {
            STRING_PUT_RECORD | STRING_DELETE_RECORD | SORTED_DELETE_RECORD
            | SORTED_HEADER_RECORD => match Record::at(pool, snapshot.payload) {
                Some(record) => record.key() == key,
                None => false,
            },
            SORTED_PUT_RECORD => match SkiplistNode::at(&self.arena, snapshot.payload) {
                Some(node) => match node.cached_key() {
                    Some(cached) => cached == key,
                    None => match Record::at(pool, node.record_offset()) {
                        Some(record) => record.key() == key,
                        None => false,
                    },
                },
                None => false,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::Configs;
    use crate::record::{required_len, write_record, STRING_RECORD_MASK};

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: PmemPool,
        table: HashTable,
    }

    fn fixture(num_buckets: u64, bucket_size: u32) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let mut configs = Configs::default();
        configs.pmem_file_size = 8 << 20;
        configs.pmem_segment_bytes = 1 << 20;
        configs.hash_bucket_num = num_buckets;
        configs.hash_bucket_size = bucket_size;
        configs.num_buckets_per_slot = 1;
        configs.dram_arena_bytes = 4 << 20;
        configs.max_access_threads = 2;
        let (pool, _) = PmemPool::open(dir.path().join("pool"), &configs).expect("open failed");
        let arena = Arc::new(DramArena::new(configs.dram_arena_bytes).expect("arena failed"));
        let table = HashTable::new(Arc::clone(&arena), &configs).expect("table failed");
        Fixture {
            _dir: dir,
            pool,
            table,
        }
    }

    fn write_string(pool: &PmemPool, key: &[u8], value: &[u8], ts: u64) -> u64 {
        let len = required_len(STRING_PUT_RECORD, key.len(), value.len());
        let entry = pool.allocate(0, len).expect("alloc failed");
        write_record(
            pool,
            entry.offset,
            entry.size as u32,
            STRING_PUT_RECORD,
            ts,
            key,
            value,
            None,
        );
        entry.offset
    }

    fn insert_string(fixture: &Fixture, key: &[u8], record_offset: u64) {
        let hint = fixture.table.hint(key);
        let outcome = fixture
            .table
            .search(&hint, key, STRING_RECORD_MASK, &fixture.pool, true)
            .expect("search failed");
        match outcome {
            SearchOutcome::NotFound { free: Some(free) } => fixture
                .table
                .insert(&hint, free, STRING_PUT_RECORD, record_offset, false)
                .expect("insert failed"),
            other => panic!("expected a free slot, got {:?}", other),
        }
    }

    #[test]
    fn inserted_key_is_found_with_full_key_verification() {
        let fixture = fixture(4, 128);
        let offset = write_string(&fixture.pool, b"alpha", b"one", 1);
        insert_string(&fixture, b"alpha", offset);

        let hint = fixture.table.hint(b"alpha");
        match fixture
            .table
            .search(&hint, b"alpha", STRING_RECORD_MASK, &fixture.pool, false)
            .expect("search failed")
        {
            SearchOutcome::Found { snapshot, .. } => {
                assert_eq!(snapshot.payload, offset);
                assert_eq!(snapshot.record_type, STRING_PUT_RECORD);
                assert_eq!(snapshot.key_prefix, hint.hash as u32);
            }
            other => panic!("expected a match, got {:?}", other),
        }
    }

    #[test]
    fn missing_key_reports_not_found_without_free_slot_on_reads() {
        let fixture = fixture(4, 128);
        let hint = fixture.table.hint(b"ghost");
        match fixture
            .table
            .search(&hint, b"ghost", STRING_RECORD_MASK, &fixture.pool, false)
            .expect("search failed")
        {
            SearchOutcome::NotFound { free } => assert!(free.is_none()),
            other => panic!("expected not-found, got {:?}", other),
        }
    }

    #[test]
    fn type_mask_filters_out_other_record_kinds() {
        let fixture = fixture(4, 128);
        let offset = write_string(&fixture.pool, b"masked", b"v", 3);
        insert_string(&fixture, b"masked", offset);

        let hint = fixture.table.hint(b"masked");
        match fixture
            .table
            .search(
                &hint,
                b"masked",
                SORTED_DELETE_RECORD | SORTED_PUT_RECORD,
                &fixture.pool,
                false,
            )
            .expect("search failed")
        {
            SearchOutcome::NotFound { .. } => {}
            other => panic!("string entry must not match a sorted mask, got {:?}", other),
        }
    }

    #[test]
    fn single_bucket_grows_overflow_chunks() {
        // One bucket of 64 bytes holds three entries before chaining.
        let fixture = fixture(1, 64);
        let keys: Vec<String> = (0..10).map(|i| format!("key-{}", i)).collect();
        for (i, key) in keys.iter().enumerate() {
            let offset = write_string(&fixture.pool, key.as_bytes(), b"v", i as u64 + 1);
            insert_string(&fixture, key.as_bytes(), offset);
        }

        for key in &keys {
            let hint = fixture.table.hint(key.as_bytes());
            match fixture
                .table
                .search(&hint, key.as_bytes(), STRING_RECORD_MASK, &fixture.pool, false)
                .expect("search failed")
            {
                SearchOutcome::Found { .. } => {}
                other => panic!("lost {} after overflow growth: {:?}", key, other),
            }
        }
    }

    #[test]
    fn update_swings_payload_in_place() {
        let fixture = fixture(4, 128);
        let first = write_string(&fixture.pool, b"swing", b"v1", 1);
        insert_string(&fixture, b"swing", first);

        let hint = fixture.table.hint(b"swing");
        let entry = match fixture
            .table
            .search(&hint, b"swing", STRING_RECORD_MASK, &fixture.pool, true)
            .expect("search failed")
        {
            SearchOutcome::Found { entry, .. } => entry,
            other => panic!("expected existing entry, got {:?}", other),
        };

        let second = write_string(&fixture.pool, b"swing", b"v2", 2);
        fixture
            .table
            .insert(&hint, entry, STRING_PUT_RECORD, second, true)
            .expect("update failed");

        match fixture
            .table
            .search(&hint, b"swing", STRING_RECORD_MASK, &fixture.pool, false)
            .expect("search failed")
        {
            SearchOutcome::Found { snapshot, .. } => assert_eq!(snapshot.payload, second),
            other => panic!("expected updated entry, got {:?}", other),
        }
    }
}
