use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::configs::{ConfigError, Configs};
use crate::dram::{DramArena, DramError};
use crate::epoch::EpochManager;
use crate::hash_table::{HashTable, HashTableError, KeyHashHint, SearchOutcome, SpinMutex};
use crate::pmem::{AttachMode, PmemError, PmemPool, SpaceEntry};
use crate::record::{
    is_delete_type, mark_padding, required_len, write_record, Record, SORTED_DELETE_RECORD,
    SORTED_ELEM_MASK, SORTED_HEADER_RECORD, SORTED_PUT_RECORD, STRING_DELETE_RECORD,
    STRING_PUT_RECORD, STRING_RECORD_MASK,
};
use crate::recovery::{self, RecoveryError, RecoveryStats};
use crate::skiplist::{
    encode_internal_key, Skiplist, SkiplistError, SortedIterator, Splice, COLLECTION_ID_BYTES,
};
use crate::threads::{ThreadError, ThreadRegistry};

pub const MAX_KEY_BYTES: usize = u16::MAX as usize - COLLECTION_ID_BYTES;
pub const MAX_VALUE_BYTES: usize = u32::MAX as usize;

const RECLAIM_BUDGET_PER_DELETE: usize = 64;

#[derive(Debug)]
pub enum KvError {
    NotFound,
    MemoryOverflow,
    PmemOverflow { requested: u64, remaining: u64 },
    PmemMapFile(String),
    BatchOverflow,
    TooManyAccessThreads,
    InvalidDataSize { what: &'static str, len: usize, max: usize },
    InvalidConfiguration(String),
    Corruption(String),
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::NotFound => write!(f, "key not found"),
            KvError::MemoryOverflow => write!(f, "volatile memory exhausted"),
            KvError::PmemOverflow {
                requested,
                remaining,
            } => write!(
                f,
                "pmem pool exhausted (requested {}, remaining {})",
                requested, remaining
            ),
            KvError::PmemMapFile(msg) => write!(f, "pmem file mapping failed: {}", msg),
            KvError::BatchOverflow => write!(f, "write batch capacity exceeded"),
            KvError::TooManyAccessThreads => write!(f, "access thread slots exhausted"),
            KvError::InvalidDataSize { what, len, max } => {
                write!(f, "{} of {} bytes exceeds the {}-byte limit", what, len, max)
            }
            KvError::InvalidConfiguration(msg) => write!(f, "invalid configuration: {}", msg),
            KvError::Corruption(msg) => write!(f, "corruption: {}", msg),
        }
    }
}

impl std::error::Error for KvError {}

impl From<PmemError> for KvError {
    fn from(value: PmemError) -> Self {
        match value {
            PmemError::MapFile(err) => KvError::PmemMapFile(err.to_string()),
            PmemError::Overflow {
                requested,
                remaining,
            } => KvError::PmemOverflow {
                requested,
                remaining,
            },
            PmemError::OversizedAllocation { requested, segment } => KvError::InvalidDataSize {
                what: "record",
                len: requested as usize,
                max: segment as usize,
            },
            PmemError::HeaderCorrupt(msg) => KvError::Corruption(msg),
            PmemError::InvalidSize(size) => {
                KvError::InvalidConfiguration(format!("pmem pool size {} is invalid", size))
            }
            PmemError::InvalidThread(_) => KvError::TooManyAccessThreads,
        }
    }
}

impl From<DramError> for KvError {
    fn from(_: DramError) -> Self {
        KvError::MemoryOverflow
    }
}

impl From<HashTableError> for KvError {
    fn from(value: HashTableError) -> Self {
        match value {
            HashTableError::MemoryOverflow(_) => KvError::MemoryOverflow,
            HashTableError::InvalidEntry(offset) => {
                KvError::Corruption(format!("invalid hash entry offset {}", offset))
            }
        }
    }
}

impl From<SkiplistError> for KvError {
    fn from(value: SkiplistError) -> Self {
        match value {
            SkiplistError::Alloc(_) => KvError::MemoryOverflow,
            other => KvError::Corruption(other.to_string()),
        }
    }
}

impl From<ThreadError> for KvError {
    fn from(_: ThreadError) -> Self {
        KvError::TooManyAccessThreads
    }
}

impl From<ConfigError> for KvError {
    fn from(value: ConfigError) -> Self {
        KvError::InvalidConfiguration(value.to_string())
    }
}

impl From<RecoveryError> for KvError {
    fn from(value: RecoveryError) -> Self {
        match value {
            RecoveryError::Pmem(err) => err.into(),
            RecoveryError::Hash(err) => err.into(),
            RecoveryError::Skiplist(err) => err.into(),
            RecoveryError::Dram(err) => err.into(),
            RecoveryError::Corruption { offset, reason } => {
                KvError::Corruption(format!("offset {}: {}", offset, reason))
            }
        }
    }
}

struct LockSet<'a> {
    locks: Vec<&'a SpinMutex>,
}

impl Drop for LockSet<'_> {
    fn drop(&mut self) {
        for lock in self.locks.iter().rev() {
            lock.unlock();
        }
    }
}

pub struct KvEngine {
    configs: Configs,
    pmem: Arc<PmemPool>,
    arena: Arc<DramArena>,
    hash: HashTable,
    registry: Arc<ThreadRegistry>,
    epoch: Arc<EpochManager>,
    collections: RwLock<HashMap<String, Arc<Skiplist>>>,
    timestamp: AtomicU64,
    next_collection_id: AtomicU64,
    recovery_stats: Option<RecoveryStats>,
}

impl KvEngine {
    pub fn open(path: impl AsRef<Path>, configs: Configs) -> Result<Self, KvError> {
        configs.validate()?;
        let (pmem, mode) = PmemPool::open(path.as_ref(), &configs)?;
        let pmem = Arc::new(pmem);
        let arena = Arc::new(DramArena::new(configs.dram_arena_bytes)?);
        let hash = HashTable::new(Arc::clone(&arena), &configs)?;
        let registry = ThreadRegistry::new(configs.max_access_threads);
        let epoch = Arc::new(EpochManager::new(configs.max_access_threads));

        let mut engine = Self {
            configs,
            pmem,
            arena,
            hash,
            registry,
            epoch,
            collections: RwLock::new(HashMap::new()),
            timestamp: AtomicU64::new(1),
            next_collection_id: AtomicU64::new(1),
            recovery_stats: None,
        };

        match mode {
            AttachMode::ColdStart => {
                tracing::info!(path = %path.as_ref().display(), "created fresh pmem pool");
            }
            AttachMode::WarmStart => {
                tracing::info!(
                    path = %path.as_ref().display(),
                    clean_shutdown = engine.pmem.clean_shutdown(),
                    "reattaching to existing pmem pool"
                );
                let outcome =
                    recovery::recover(&engine.pmem, &engine.arena, &engine.hash, &engine.epoch)?;
                engine
                    .timestamp
                    .store(outcome.max_timestamp + 1, Ordering::Release);
                engine
                    .next_collection_id
                    .store(outcome.max_collection_id + 1, Ordering::Release);
                *engine.collections.get_mut().unwrap_or_else(|p| p.into_inner()) =
                    outcome.collections;
                engine.recovery_stats = Some(outcome.stats);
            }
        }

        Ok(engine)
    }

    #[inline]
    pub fn configs(&self) -> &Configs {
        &self.configs
    }

    #[inline]
    pub fn recovery_stats(&self) -> Option<&RecoveryStats> {
        self.recovery_stats.as_ref()
    }

    #[inline]
    fn new_timestamp(&self) -> u64 {
        self.timestamp.fetch_add(1, Ordering::AcqRel)
    }

    fn check_key(key: &[u8], what: &'static str) -> Result<(), KvError> {
        if key.len() > MAX_KEY_BYTES {
            return Err(KvError::InvalidDataSize {
                what,
                len: key.len(),
                max: MAX_KEY_BYTES,
            });
        }
        Ok(())
    }

    fn check_value(value: &[u8]) -> Result<(), KvError> {
        if value.len() > MAX_VALUE_BYTES {
            return Err(KvError::InvalidDataSize {
                what: "value",
                len: value.len(),
                max: MAX_VALUE_BYTES,
            });
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, KvError> {
        Self::check_key(key, "key")?;
        let hint = self.hash.hint(key);
        loop {
            match self
                .hash
                .search(&hint, key, STRING_RECORD_MASK, &self.pmem, false)?
            {
                SearchOutcome::Found { entry, snapshot } => {
                    if snapshot.record_type == STRING_DELETE_RECORD {
                        return Err(KvError::NotFound);
                    }
                    let Some(record) = Record::at(&self.pmem, snapshot.payload) else {
                        continue;
                    };
                    if record.key() != key {
                        continue;
                    }
                    let value = record.value().to_vec();
                    // The record's space can be recycled the moment an update
                    // swings the entry away; a stable re-read certifies that
                    // the copy came from the live record.
                    if self.hash.reload(entry)? == snapshot {
                        return Ok(value);
                    }
                }
                SearchOutcome::NotFound { .. } => return Err(KvError::NotFound),
            }
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        Self::check_key(key, "key")?;
        Self::check_value(value)?;
        let thread_id = self.registry.access_thread_id()?;
        let hint = self.hash.hint(key);

        let own = self.hash.slot_lock(hint.slot);
        own.lock();
        let result = self.locked_string_write(thread_id, &hint, key, Some(value));
        own.unlock();
        result
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), KvError> {
        Self::check_key(key, "key")?;
        let thread_id = self.registry.access_thread_id()?;
        let hint = self.hash.hint(key);

        let own = self.hash.slot_lock(hint.slot);
        own.lock();
        let result = self.locked_string_write(thread_id, &hint, key, None);
        own.unlock();
        result
    }

    // String-space writes are hash-only: persist the new record, swing the
    // entry, recycle whatever it replaced. `value` of None appends a delete
    // marker instead.
    fn locked_string_write(
        &self,
        thread_id: u16,
        hint: &KeyHashHint,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<(), KvError> {
        let outcome = self
            .hash
            .search(hint, key, STRING_RECORD_MASK, &self.pmem, true)?;

        match outcome {
            SearchOutcome::Found { entry, snapshot } => {
                if value.is_none() && snapshot.record_type == STRING_DELETE_RECORD {
                    return Ok(());
                }
                let (record_type, body) = match value {
                    Some(value) => (STRING_PUT_RECORD, value),
                    None => (STRING_DELETE_RECORD, &[][..]),
                };
                let space = self.persist_record(thread_id, record_type, key, body, None)?;
                self.hash
                    .insert(hint, entry, record_type, space.offset, true)?;
                self.recycle_string_record(thread_id, snapshot.payload)?;
                Ok(())
            }
            SearchOutcome::NotFound { free } => {
                let Some(value) = value else {
                    // Deleting a key that never existed leaves no trace.
                    return Ok(());
                };
                let free = free.ok_or(KvError::MemoryOverflow)?;
                let space =
                    self.persist_record(thread_id, STRING_PUT_RECORD, key, value, None)?;
                self.hash
                    .insert(hint, free, STRING_PUT_RECORD, space.offset, false)?;
                Ok(())
            }
        }
    }

    fn recycle_string_record(&self, thread_id: u16, offset: u64) -> Result<(), KvError> {
        let record = Record::at(&self.pmem, offset)
            .ok_or_else(|| KvError::Corruption(format!("stale string record at {}", offset)))?;
        let size = record.alloc_len() as u64;
        mark_padding(&self.pmem, record);
        self.pmem.free(thread_id, SpaceEntry { offset, size })?;
        Ok(())
    }

    pub fn create_sorted_collection(&self, name: &str) -> Result<(), KvError> {
        self.get_or_create_collection(name).map(|_| ())
    }

    pub fn sorted_collections(&self) -> Vec<String> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        collections.keys().cloned().collect()
    }

    fn collection(&self, name: &str) -> Option<Arc<Skiplist>> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        collections.get(name).cloned()
    }

    fn get_or_create_collection(&self, name: &str) -> Result<Arc<Skiplist>, KvError> {
        if let Some(list) = self.collection(name) {
            return Ok(list);
        }
        Self::check_key(name.as_bytes(), "collection name")?;
        let thread_id = self.registry.access_thread_id()?;

        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(list) = collections.get(name) {
            return Ok(Arc::clone(list));
        }

        let id = self.next_collection_id.fetch_add(1, Ordering::AcqRel);
        let space = self.persist_collection_header(thread_id, name, id)?;

        let hint = self.hash.hint(name.as_bytes());
        let own = self.hash.slot_lock(hint.slot);
        own.lock();
        let result = match self
            .hash
            .search(&hint, name.as_bytes(), SORTED_HEADER_RECORD, &self.pmem, true)
        {
            Ok(SearchOutcome::NotFound { free: Some(free) }) => self
                .hash
                .insert(&hint, free, SORTED_HEADER_RECORD, space.offset, false)
                .map_err(KvError::from),
            Ok(SearchOutcome::Found { entry, .. }) => self
                .hash
                .insert(&hint, entry, SORTED_HEADER_RECORD, space.offset, true)
                .map_err(KvError::from),
            Ok(SearchOutcome::NotFound { free: None }) => Err(KvError::MemoryOverflow),
            Err(err) => Err(err.into()),
        };
        own.unlock();
        result?;

        let list = Skiplist::new(
            id,
            name.to_string(),
            space.offset,
            Arc::clone(&self.pmem),
            Arc::clone(&self.arena),
            Arc::clone(&self.epoch),
        )?;
        collections.insert(name.to_string(), Arc::clone(&list));
        tracing::info!(collection = name, id, "created sorted collection");
        Ok(list)
    }

    fn persist_collection_header(
        &self,
        thread_id: u16,
        name: &str,
        id: u64,
    ) -> Result<SpaceEntry, KvError> {
        let timestamp = self.new_timestamp();
        let len = required_len(SORTED_HEADER_RECORD, name.len(), 8);
        let space = self.pmem.allocate(thread_id, len)?;
        write_record(
            &self.pmem,
            space.offset,
            space.size as u32,
            SORTED_HEADER_RECORD,
            timestamp,
            name.as_bytes(),
            &id.to_le_bytes(),
            Some((space.offset, space.offset)),
        );
        self.pmem.persist_offset(space.offset, space.size as usize);
        Ok(space)
    }

    pub fn sorted_put(&self, collection: &str, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        Self::check_key(key, "key")?;
        Self::check_value(value)?;
        let list = self.get_or_create_collection(collection)?;
        let thread_id = self.registry.access_thread_id()?;
        let _pin = self.epoch.pin(thread_id);
        let internal = encode_internal_key(list.id(), key);
        let hint = self.hash.hint(&internal);

        loop {
            let own = self.hash.slot_lock(hint.slot);
            own.lock();
            let result = self.locked_sorted_put(&list, thread_id, &hint, &internal, value);
            own.unlock();
            match result {
                Ok(true) => return Ok(()),
                Ok(false) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn locked_sorted_put(
        &self,
        list: &Arc<Skiplist>,
        thread_id: u16,
        hint: &KeyHashHint,
        internal: &[u8],
        value: &[u8],
    ) -> Result<bool, KvError> {
        match self
            .hash
            .search(hint, internal, SORTED_ELEM_MASK, &self.pmem, true)?
        {
            SearchOutcome::Found { entry, snapshot } => {
                // The key already owns a chain slot (live record or delete
                // marker); the new record takes that slot in place.
                let (old_offset, existing_node) = match snapshot.record_type {
                    SORTED_PUT_RECORD => {
                        let node = list.node_ref(snapshot.payload)?;
                        (node.record_offset(), Some(snapshot.payload))
                    }
                    _ => (snapshot.payload, None),
                };
                let old = Record::at(&self.pmem, old_offset).ok_or_else(|| {
                    KvError::Corruption(format!("stale sorted record at {}", old_offset))
                })?;
                let links = old
                    .links()
                    .ok_or_else(|| KvError::Corruption("sorted record without links".into()))?;
                let prev = links.prev.load(Ordering::Acquire);
                let next = links.next.load(Ordering::Acquire);

                let Some(_neighbours) = self.lock_neighbours(hint.slot, prev, next)? else {
                    return Ok(false);
                };
                if !self.chain_window_valid(prev, old_offset)
                    || !self.chain_window_valid(old_offset, next)
                    || self.hash.reload(entry)? != snapshot
                {
                    return Ok(false);
                }

                let space = self.persist_record(
                    thread_id,
                    SORTED_PUT_RECORD,
                    internal,
                    value,
                    Some((prev, next)),
                )?;
                list.splice_chain(prev, next, space.offset)?;

                match existing_node {
                    Some(node_offset) => {
                        list.node_ref(node_offset)?.set_record(space.offset);
                        self.hash
                            .insert(hint, entry, SORTED_PUT_RECORD, node_offset, true)?;
                    }
                    None => {
                        // Putting over a delete marker: the marker had no
                        // index node, so publish a fresh one.
                        let mut splice = Splice::new();
                        list.seek(internal, &mut splice)?;
                        let height = list.random_height();
                        let node_offset =
                            list.insert_node(&mut splice, internal, space.offset, height)?;
                        self.hash
                            .insert(hint, entry, SORTED_PUT_RECORD, node_offset, true)?;
                    }
                }
                Ok(true)
            }
            SearchOutcome::NotFound { free } => {
                let free = free.ok_or(KvError::MemoryOverflow)?;
                let mut splice = Splice::new();
                list.seek(internal, &mut splice)?;
                let prev = splice.prev_record;
                let next = splice.next_record;

                let Some(_neighbours) = self.lock_neighbours(hint.slot, prev, next)? else {
                    return Ok(false);
                };
                if !self.chain_window_valid(prev, next) {
                    return Ok(false);
                }

                let space = self.persist_record(
                    thread_id,
                    SORTED_PUT_RECORD,
                    internal,
                    value,
                    Some((prev, next)),
                )?;
                list.splice_chain(prev, next, space.offset)?;
                let height = list.random_height();
                let node_offset = list.insert_node(&mut splice, internal, space.offset, height)?;
                self.hash
                    .insert(hint, free, SORTED_PUT_RECORD, node_offset, false)?;
                Ok(true)
            }
        }
    }

    pub fn sorted_get(&self, collection: &str, key: &[u8]) -> Result<Vec<u8>, KvError> {
        Self::check_key(key, "key")?;
        let list = self.collection(collection).ok_or(KvError::NotFound)?;
        let thread_id = self.registry.access_thread_id()?;
        let _pin = self.epoch.pin(thread_id);
        let internal = encode_internal_key(list.id(), key);
        let hint = self.hash.hint(&internal);

        loop {
            match self
                .hash
                .search(&hint, &internal, SORTED_ELEM_MASK, &self.pmem, false)?
            {
                SearchOutcome::Found { entry, snapshot } => match snapshot.record_type {
                    SORTED_PUT_RECORD => {
                        let Ok(node) = list.node_ref(snapshot.payload) else {
                            continue;
                        };
                        let Some(record) = Record::at(&self.pmem, node.record_offset()) else {
                            continue;
                        };
                        if record.key() != internal {
                            continue;
                        }
                        if is_delete_type(record.record_type()) {
                            return Err(KvError::NotFound);
                        }
                        let value = record.value().to_vec();
                        if self.hash.reload(entry)? == snapshot {
                            return Ok(value);
                        }
                    }
                    _ => return Err(KvError::NotFound),
                },
                SearchOutcome::NotFound { .. } => return Err(KvError::NotFound),
            }
        }
    }

    pub fn sorted_delete(&self, collection: &str, key: &[u8]) -> Result<(), KvError> {
        Self::check_key(key, "key")?;
        let Some(list) = self.collection(collection) else {
            return Ok(());
        };
        let thread_id = self.registry.access_thread_id()?;
        let _pin = self.epoch.pin(thread_id);
        let internal = encode_internal_key(list.id(), key);
        let hint = self.hash.hint(&internal);

        loop {
            let own = self.hash.slot_lock(hint.slot);
            own.lock();
            let result = self.locked_sorted_delete(&list, thread_id, &hint, &internal);
            own.unlock();
            match result {
                Ok(true) => {
                    self.epoch.collect(&self.arena, RECLAIM_BUDGET_PER_DELETE);
                    return Ok(());
                }
                Ok(false) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn locked_sorted_delete(
        &self,
        list: &Arc<Skiplist>,
        thread_id: u16,
        hint: &KeyHashHint,
        internal: &[u8],
    ) -> Result<bool, KvError> {
        match self
            .hash
            .search(hint, internal, SORTED_ELEM_MASK, &self.pmem, true)?
        {
            SearchOutcome::Found { entry, snapshot } => {
                if snapshot.record_type == SORTED_DELETE_RECORD {
                    return Ok(true);
                }
                let node_offset = snapshot.payload;
                let node = list.node_ref(node_offset)?;
                let old_offset = node.record_offset();
                let old = Record::at(&self.pmem, old_offset).ok_or_else(|| {
                    KvError::Corruption(format!("stale sorted record at {}", old_offset))
                })?;
                let links = old
                    .links()
                    .ok_or_else(|| KvError::Corruption("sorted record without links".into()))?;
                let prev = links.prev.load(Ordering::Acquire);
                let next = links.next.load(Ordering::Acquire);

                let Some(_neighbours) = self.lock_neighbours(hint.slot, prev, next)? else {
                    return Ok(false);
                };
                if !self.chain_window_valid(prev, old_offset)
                    || !self.chain_window_valid(old_offset, next)
                    || self.hash.reload(entry)? != snapshot
                {
                    return Ok(false);
                }

                // The delete marker takes the live record's chain slot so a
                // crash on either side of the hash update recovers the same
                // state.
                let space = self.persist_record(
                    thread_id,
                    SORTED_DELETE_RECORD,
                    internal,
                    b"",
                    Some((prev, next)),
                )?;
                list.splice_chain(prev, next, space.offset)?;
                self.hash
                    .insert(hint, entry, SORTED_DELETE_RECORD, space.offset, true)?;
                list.unlink_node(internal, node_offset)?;
                Ok(true)
            }
            SearchOutcome::NotFound { .. } => Ok(true),
        }
    }

    pub fn sorted_iterator(&self, collection: &str) -> Result<SortedIterator, KvError> {
        let list = self.collection(collection).ok_or(KvError::NotFound)?;
        Ok(SortedIterator::new(list, Arc::clone(&self.registry)))
    }

    pub fn reclaim_volatile(&self, max_blocks: usize) -> usize {
        self.epoch.collect(&self.arena, max_blocks)
    }

    fn persist_record(
        &self,
        thread_id: u16,
        record_type: u16,
        key: &[u8],
        value: &[u8],
        links: Option<(u64, u64)>,
    ) -> Result<SpaceEntry, KvError> {
        let timestamp = self.new_timestamp();
        let len = required_len(record_type, key.len(), value.len());
        let space = self.pmem.allocate(thread_id, len)?;
        write_record(
            &self.pmem,
            space.offset,
            space.size as u32,
            record_type,
            timestamp,
            key,
            value,
            links,
        );
        self.pmem.persist_offset(space.offset, space.size as usize);
        Ok(space)
    }

    // Neighbour shards are taken in ascending lock-address order with
    // try-lock, since the caller already holds its own shard out of order. A
    // missed lock aborts the attempt and the caller reseeks.
    fn lock_neighbours(
        &self,
        own_slot: usize,
        prev_offset: u64,
        next_offset: u64,
    ) -> Result<Option<LockSet<'_>>, KvError> {
        let mut slots = Vec::with_capacity(2);
        for offset in [prev_offset, next_offset] {
            let record = Record::at(&self.pmem, offset).ok_or_else(|| {
                KvError::Corruption(format!("neighbour record at {} no longer parses", offset))
            })?;
            let slot = self.hash.hint(record.key()).slot;
            if slot != own_slot {
                slots.push(slot);
            }
        }
        slots.sort_by_key(|slot| self.hash.slot_lock_addr(*slot));
        slots.dedup();

        let mut set = LockSet {
            locks: Vec::with_capacity(slots.len()),
        };
        for slot in slots {
            let lock = self.hash.slot_lock(slot);
            if !lock.try_lock() {
                return Ok(None);
            }
            set.locks.push(lock);
        }
        Ok(Some(set))
    }

    // Both directions must agree under the locks; a neighbour that was
    // replaced between seek and lock acquisition fails one of them.
    fn chain_window_valid(&self, prev_offset: u64, next_offset: u64) -> bool {
        let (Some(prev), Some(next)) = (
            Record::at(&self.pmem, prev_offset),
            Record::at(&self.pmem, next_offset),
        ) else {
            return false;
        };
        let (Some(prev_links), Some(next_links)) = (prev.links(), next.links()) else {
            return false;
        };
        prev_links.next.load(Ordering::Acquire) == next_offset
            && next_links.prev.load(Ordering::Acquire) == prev_offset
    }
}

impl Drop for KvEngine {
    fn drop(&mut self) {
        self.pmem.set_clean_shutdown(true);
    }
}
