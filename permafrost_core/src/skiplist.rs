use std::cmp::Ordering as KeyOrdering;
use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::dram::{DramArena, DramError, NULL_DRAM_OFFSET};
use crate::epoch::EpochManager;
use crate::pmem::{PmemPool, NULL_PMEM_OFFSET};
use crate::record::{
    is_delete_type, Record, RECORD_META_BYTES, SORTED_HEADER_RECORD, SORTED_LINKS_BYTES,
};
use crate::threads::ThreadRegistry;

pub const MAX_HEIGHT: usize = 12;
pub const COLLECTION_ID_BYTES: usize = 8;
const CACHE_HEIGHT: u16 = 3;
const SMALL_KEY_BYTES: usize = 4;
const NODE_FLAG_MARKED: u32 = 1 << 0;

#[derive(Debug)]
pub enum SkiplistError {
    InvalidNode(u64),
    InvalidLane { node_offset: u64, level: usize },
    InvalidRecord(u64),
    Alloc(DramError),
}

impl fmt::Display for SkiplistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiplistError::InvalidNode(offset) => {
                write!(f, "invalid skiplist node offset {}", offset)
            }
            SkiplistError::InvalidLane { node_offset, level } => {
                write!(
                    f,
                    "invalid lane for skiplist node {} at level {}",
                    node_offset, level
                )
            }
            SkiplistError::InvalidRecord(offset) => {
                write!(f, "invalid sorted record offset {}", offset)
            }
            SkiplistError::Alloc(err) => write!(f, "skiplist allocation failed: {}", err),
        }
    }
}

impl std::error::Error for SkiplistError {}

impl From<DramError> for SkiplistError {
    fn from(value: DramError) -> Self {
        SkiplistError::Alloc(value)
    }
}

#[inline]
pub fn encode_internal_key(collection_id: u64, user_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(COLLECTION_ID_BYTES + user_key.len());
    out.extend_from_slice(&collection_id.to_be_bytes());
    out.extend_from_slice(user_key);
    out
}

#[inline]
pub fn user_key(internal_key: &[u8]) -> &[u8] {
    &internal_key[COLLECTION_ID_BYTES.min(internal_key.len())..]
}

// Volatile index node. The base address (and therefore the hash-entry
// payload) stays stable for the node's lifetime; the variable-height lane
// array lives in its own arena block referenced by `tower`, and the cached
// key occupies the bytes trailing the struct.
#[repr(C)]
pub struct SkiplistNode {
    record: AtomicU64,
    tower: u64,
    flags: AtomicU32,
    height: u16,
    cached_key_len: u16,
}

impl SkiplistNode {
    pub fn at<'a>(arena: &'a DramArena, offset: u64) -> Option<&'a SkiplistNode> {
        let addr = arena.resolve_range(offset, size_of::<SkiplistNode>() as u64)?;
        // SAFETY:
        // The struct extent was bounds-checked; nodes are written once before
        // publication and mutated only through atomics afterwards.
        let node = unsafe { &*addr.cast_const().cast::<SkiplistNode>() };
        arena.resolve_range(
            offset,
            (size_of::<SkiplistNode>() + node.cached_key_len as usize) as u64,
        )?;
        Some(node)
    }

    #[inline]
    pub fn record_offset(&self) -> u64 {
        self.record.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_record(&self, offset: u64) {
        self.record.store(offset, Ordering::Release);
    }

    #[inline]
    pub fn height(&self) -> u16 {
        self.height
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.flags.load(Ordering::Acquire) & NODE_FLAG_MARKED != 0
    }

    #[inline]
    fn mark(&self) {
        self.flags.fetch_or(NODE_FLAG_MARKED, Ordering::AcqRel);
    }

    pub fn cached_key(&self) -> Option<&[u8]> {
        if self.cached_key_len == 0 {
            return None;
        }
        // SAFETY:
        // `at` verified the trailing bytes lie inside the node's allocation,
        // and they are immutable after construction.
        Some(unsafe {
            std::slice::from_raw_parts(
                (self as *const SkiplistNode).add(1).cast::<u8>(),
                self.cached_key_len as usize,
            )
        })
    }

    fn lane<'a>(
        &self,
        arena: &'a DramArena,
        node_offset: u64,
        level: usize,
    ) -> Result<&'a AtomicU64, SkiplistError> {
        if level == 0 || level > self.height as usize {
            return Err(SkiplistError::InvalidLane { node_offset, level });
        }
        let lane_offset = self.tower + (level as u64 - 1) * 8;
        let addr = arena
            .resolve_range(lane_offset, 8)
            .ok_or(SkiplistError::InvalidLane { node_offset, level })?;
        // SAFETY: bounds-checked 8-byte extent accessed only through the atomic.
        Ok(unsafe { &*addr.cast_const().cast::<AtomicU64>() })
    }

    #[inline]
    fn alloc_bytes(height: u16, cached_key_len: usize) -> (u64, u64) {
        (
            (size_of::<SkiplistNode>() + cached_key_len) as u64,
            height as u64 * 8,
        )
    }
}

// Per-operation accumulator of the search window at every level plus the
// surrounding records in the persistent chain. Levels are 1-indexed; index 0
// is unused.
pub struct Splice {
    pub prevs: [u64; MAX_HEIGHT + 1],
    pub nexts: [u64; MAX_HEIGHT + 1],
    pub prev_record: u64,
    pub next_record: u64,
}

impl Splice {
    pub fn new() -> Self {
        Self {
            prevs: [NULL_DRAM_OFFSET; MAX_HEIGHT + 1],
            nexts: [NULL_DRAM_OFFSET; MAX_HEIGHT + 1],
            prev_record: NULL_PMEM_OFFSET,
            next_record: NULL_PMEM_OFFSET,
        }
    }

    pub fn recompute(
        &mut self,
        list: &Skiplist,
        key: &[u8],
        level: usize,
    ) -> Result<(), SkiplistError> {
        loop {
            let pred = list.node_ref(self.prevs[level])?;
            let next_offset = pred.lane(&list.arena, self.prevs[level], level)?.load(Ordering::Acquire);
            if next_offset == NULL_DRAM_OFFSET {
                self.nexts[level] = NULL_DRAM_OFFSET;
                return Ok(());
            }
            let node = list.node_ref(next_offset)?;
            if list.node_key(node)? < key {
                self.prevs[level] = next_offset;
            } else {
                self.nexts[level] = next_offset;
                return Ok(());
            }
        }
    }
}

impl Default for Splice {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Skiplist {
    id: u64,
    name: String,
    header_node: u64,
    header_record: u64,
    rng_state: AtomicU64,
    pmem: Arc<PmemPool>,
    arena: Arc<DramArena>,
    epoch: Arc<EpochManager>,
}

impl Skiplist {
    pub fn new(
        id: u64,
        name: String,
        header_record: u64,
        pmem: Arc<PmemPool>,
        arena: Arc<DramArena>,
        epoch: Arc<EpochManager>,
    ) -> Result<Arc<Self>, SkiplistError> {
        let (node_bytes, tower_bytes) = SkiplistNode::alloc_bytes(MAX_HEIGHT as u16, 0);
        let tower = arena.alloc(tower_bytes)?;
        let header_node = arena.alloc(node_bytes)?;
        let addr = arena
            .resolve_range(header_node, node_bytes)
            .ok_or(SkiplistError::InvalidNode(header_node))?;
        // SAFETY: freshly reserved, zeroed extent.
        unsafe {
            addr.cast::<SkiplistNode>().write(SkiplistNode {
                record: AtomicU64::new(header_record),
                tower,
                flags: AtomicU32::new(0),
                height: MAX_HEIGHT as u16,
                cached_key_len: 0,
            });
        }

        Ok(Arc::new(Self {
            id,
            name,
            header_node,
            header_record,
            rng_state: AtomicU64::new(header_record ^ (id << 32) ^ 0x9E37_79B9_7F4A_7C15),
            pmem,
            arena,
            epoch,
        }))
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn header_record(&self) -> u64 {
        self.header_record
    }

    #[inline]
    pub fn header_node(&self) -> u64 {
        self.header_node
    }

    // Coin flips at probability one half per extra level, clamped to [1, MAX].
    pub fn random_height(&self) -> u16 {
        let mut old = self.rng_state.load(Ordering::Relaxed).max(1);
        let mut bits;
        loop {
            bits = xorshift64(old);
            match self.rng_state.compare_exchange_weak(
                old,
                bits,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => old = observed.max(1),
            }
        }

        let mut height = 1_u16;
        while (height as usize) < MAX_HEIGHT && bits & 1 == 1 {
            height += 1;
            bits >>= 1;
        }
        height
    }

    #[inline]
    pub fn node_ref(&self, offset: u64) -> Result<&SkiplistNode, SkiplistError> {
        SkiplistNode::at(&self.arena, offset).ok_or(SkiplistError::InvalidNode(offset))
    }

    #[inline]
    fn record_ref(&self, offset: u64) -> Result<Record<'_>, SkiplistError> {
        Record::at(&self.pmem, offset).ok_or(SkiplistError::InvalidRecord(offset))
    }

    pub fn node_key<'a>(&'a self, node: &'a SkiplistNode) -> Result<&'a [u8], SkiplistError> {
        if let Some(cached) = node.cached_key() {
            return Ok(cached);
        }
        let record = self.record_ref(node.record_offset())?;
        Ok(record.key())
    }

    // Lock-free multi-level descent. Marked nodes met on the way are swung
    // past (and the whole descent restarts if that CAS loses a race), so a
    // completed pass never leaves a marked node in the returned window.
    pub fn seek(&self, key: &[u8], splice: &mut Splice) -> Result<(), SkiplistError> {
        'retry: loop {
            let mut pred_offset = self.header_node;
            for level in (1..=MAX_HEIGHT).rev() {
                let pred = self.node_ref(pred_offset)?;
                let mut curr_offset = pred
                    .lane(&self.arena, pred_offset, level)?
                    .load(Ordering::Acquire);
                loop {
                    if curr_offset == NULL_DRAM_OFFSET {
                        break;
                    }
                    let curr = self.node_ref(curr_offset)?;
                    let curr_next = curr
                        .lane(&self.arena, curr_offset, level)?
                        .load(Ordering::Acquire);

                    if curr.is_marked() {
                        let pred = self.node_ref(pred_offset)?;
                        if pred
                            .lane(&self.arena, pred_offset, level)?
                            .compare_exchange(
                                curr_offset,
                                curr_next,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_err()
                        {
                            continue 'retry;
                        }
                        curr_offset = curr_next;
                        continue;
                    }

                    match self.node_key(curr)?.cmp(key) {
                        KeyOrdering::Less => {
                            pred_offset = curr_offset;
                            curr_offset = curr_next;
                        }
                        _ => break,
                    }
                }
                splice.prevs[level] = pred_offset;
                splice.nexts[level] = curr_offset;
            }

            self.seek_chain(key, splice)?;
            return Ok(());
        }
    }

    // Level-1 landing only narrows to the last indexed node; delete-type
    // records still sit in the chain without index nodes, so the final
    // position comes from walking records.
    fn seek_chain(&self, key: &[u8], splice: &mut Splice) -> Result<(), SkiplistError> {
        let pred = self.node_ref(splice.prevs[1])?;
        let mut prev_offset = pred.record_offset();
        loop {
            let prev = self.record_ref(prev_offset)?;
            let next_offset = prev
                .links()
                .ok_or(SkiplistError::InvalidRecord(prev_offset))?
                .next
                .load(Ordering::Acquire);
            if next_offset == self.header_record {
                splice.prev_record = prev_offset;
                splice.next_record = next_offset;
                return Ok(());
            }
            let next = self.record_ref(next_offset)?;
            if next.record_type() == SORTED_HEADER_RECORD || next.key() >= key {
                splice.prev_record = prev_offset;
                splice.next_record = next_offset;
                return Ok(());
            }
            prev_offset = next_offset;
        }
    }

    // Durably relinks the chain around a fully persisted new record:
    // successor's back pointer first, then the predecessor's forward pointer.
    pub fn splice_chain(
        &self,
        prev_offset: u64,
        next_offset: u64,
        new_offset: u64,
    ) -> Result<(), SkiplistError> {
        let next = self.record_ref(next_offset)?;
        next.links()
            .ok_or(SkiplistError::InvalidRecord(next_offset))?
            .prev
            .store(new_offset, Ordering::Release);
        self.pmem
            .persist_offset(next_offset + RECORD_META_BYTES as u64, SORTED_LINKS_BYTES);

        let prev = self.record_ref(prev_offset)?;
        prev.links()
            .ok_or(SkiplistError::InvalidRecord(prev_offset))?
            .next
            .store(new_offset, Ordering::Release);
        self.pmem
            .persist_offset(prev_offset + RECORD_META_BYTES as u64, SORTED_LINKS_BYTES);
        Ok(())
    }

    fn alloc_node(
        &self,
        key: &[u8],
        record_offset: u64,
        height: u16,
    ) -> Result<u64, SkiplistError> {
        let cache_key = height >= CACHE_HEIGHT || key.len() <= SMALL_KEY_BYTES;
        let cached_len = if cache_key && key.len() <= u16::MAX as usize {
            key.len()
        } else {
            0
        };

        let (node_bytes, tower_bytes) = SkiplistNode::alloc_bytes(height, cached_len);
        let tower = self.arena.alloc(tower_bytes)?;
        let node_offset = self.arena.alloc(node_bytes)?;
        let addr = self
            .arena
            .resolve_range(node_offset, node_bytes)
            .ok_or(SkiplistError::InvalidNode(node_offset))?;
        // SAFETY: freshly reserved, zeroed extent owned by this call.
        unsafe {
            addr.cast::<SkiplistNode>().write(SkiplistNode {
                record: AtomicU64::new(record_offset),
                tower,
                flags: AtomicU32::new(0),
                height,
                cached_key_len: cached_len as u16,
            });
            std::ptr::copy_nonoverlapping(
                key.as_ptr(),
                addr.add(size_of::<SkiplistNode>()),
                cached_len,
            );
        }
        Ok(node_offset)
    }

    // Publishes a new node bottom-up so a reader that finds it at level k
    // also finds it at every lower level. The caller holds the neighbour
    // shard locks; upper-level windows may still go stale under concurrent
    // inserts elsewhere and are recomputed per level.
    pub fn insert_node(
        &self,
        splice: &mut Splice,
        key: &[u8],
        record_offset: u64,
        height: u16,
    ) -> Result<u64, SkiplistError> {
        let node_offset = self.alloc_node(key, record_offset, height)?;
        let node = self.node_ref(node_offset)?;

        for level in 1..=height as usize {
            loop {
                node.lane(&self.arena, node_offset, level)?
                    .store(splice.nexts[level], Ordering::Release);
                let pred = self.node_ref(splice.prevs[level])?;
                match pred.lane(&self.arena, splice.prevs[level], level)?.compare_exchange(
                    splice.nexts[level],
                    node_offset,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(_) => {
                        splice.recompute(self, key, level)?;
                        if splice.nexts[level] == node_offset {
                            break;
                        }
                    }
                }
            }
        }
        Ok(node_offset)
    }

    // Logical delete already moved the hash entry and the chain to the
    // delete record; here the index node is marked, swung out of every lane
    // it occupies, and retired to the epoch queue. The caller holds the
    // deleted key's shard lock, so no same-key node can be inserted while
    // the unlink is in flight.
    pub fn unlink_node(&self, key: &[u8], node_offset: u64) -> Result<(), SkiplistError> {
        let node = self.node_ref(node_offset)?;
        node.mark();

        let mut splice = Splice::new();
        self.seek(key, &mut splice)?;
        debug_assert!(
            !splice.nexts[1..=node.height as usize].contains(&node_offset),
            "a completed seek must have unlinked the marked node"
        );

        let cached_len = node.cached_key_len as usize;
        let (node_bytes, tower_bytes) = SkiplistNode::alloc_bytes(node.height, cached_len);
        self.epoch.retire(node.tower, tower_bytes);
        self.epoch.retire(node_offset, node_bytes);
        Ok(())
    }

    // Single-threaded recovery append: records arrive in chain (key) order,
    // so each level just extends its current tail.
    pub fn rebuild_append(
        &self,
        tails: &mut [u64; MAX_HEIGHT + 1],
        key: &[u8],
        record_offset: u64,
    ) -> Result<u64, SkiplistError> {
        let height = self.random_height();
        let node_offset = self.alloc_node(key, record_offset, height)?;
        for level in 1..=height as usize {
            let tail = self.node_ref(tails[level])?;
            tail.lane(&self.arena, tails[level], level)?
                .store(node_offset, Ordering::Release);
            tails[level] = node_offset;
        }
        Ok(node_offset)
    }

    #[inline]
    pub fn record_next(&self, offset: u64) -> Result<u64, SkiplistError> {
        let record = self.record_ref(offset)?;
        Ok(record
            .links()
            .ok_or(SkiplistError::InvalidRecord(offset))?
            .next
            .load(Ordering::Acquire))
    }

    #[inline]
    pub fn record_prev(&self, offset: u64) -> Result<u64, SkiplistError> {
        let record = self.record_ref(offset)?;
        Ok(record
            .links()
            .ok_or(SkiplistError::InvalidRecord(offset))?
            .prev
            .load(Ordering::Acquire))
    }
}

// Ordered iteration follows the persistent chain rather than the index, so a
// long scan holds no epoch pin while it walks. Seek positions through the
// index under a short-lived pin; every subsequent step resolves records only.
pub struct SortedIterator {
    list: Arc<Skiplist>,
    registry: Arc<ThreadRegistry>,
    current: u64,
}

impl SortedIterator {
    pub fn new(list: Arc<Skiplist>, registry: Arc<ThreadRegistry>) -> Self {
        Self {
            list,
            registry,
            current: NULL_PMEM_OFFSET,
        }
    }

    pub fn seek(&mut self, key: &[u8]) {
        let internal = encode_internal_key(self.list.id(), key);
        let Ok(thread_id) = self.registry.access_thread_id() else {
            self.current = NULL_PMEM_OFFSET;
            return;
        };
        let list = self.list.clone();
        let _pin = list.epoch.pin(thread_id);
        let mut splice = Splice::new();
        if self.list.seek(&internal, &mut splice).is_err() {
            self.current = NULL_PMEM_OFFSET;
            return;
        }
        self.current = splice.next_record;
        self.skip_deletes_forward();
    }

    pub fn seek_to_first(&mut self) {
        match self.list.record_next(self.list.header_record()) {
            Ok(next) => {
                self.current = next;
                self.skip_deletes_forward();
            }
            Err(_) => self.current = NULL_PMEM_OFFSET,
        }
    }

    pub fn seek_to_last(&mut self) {
        match self.list.record_prev(self.list.header_record()) {
            Ok(prev) => {
                self.current = prev;
                self.skip_deletes_backward();
            }
            Err(_) => self.current = NULL_PMEM_OFFSET,
        }
    }

    pub fn next(&mut self) -> bool {
        if !self.valid() {
            return false;
        }
        match self.list.record_next(self.current) {
            Ok(next) => {
                self.current = next;
                self.skip_deletes_forward();
            }
            Err(_) => self.current = NULL_PMEM_OFFSET,
        }
        self.valid()
    }

    pub fn prev(&mut self) -> bool {
        if !self.valid() {
            return false;
        }
        match self.list.record_prev(self.current) {
            Ok(prev) => {
                self.current = prev;
                self.skip_deletes_backward();
            }
            Err(_) => self.current = NULL_PMEM_OFFSET,
        }
        self.valid()
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.current != NULL_PMEM_OFFSET && self.current != self.list.header_record()
    }

    pub fn key(&self) -> Option<Vec<u8>> {
        if !self.valid() {
            return None;
        }
        let record = Record::at(&self.list.pmem, self.current)?;
        Some(user_key(record.key()).to_vec())
    }

    pub fn value(&self) -> Option<Vec<u8>> {
        if !self.valid() {
            return None;
        }
        let record = Record::at(&self.list.pmem, self.current)?;
        Some(record.value().to_vec())
    }

    fn skip_deletes_forward(&mut self) {
        while self.valid() {
            let Some(record) = Record::at(&self.list.pmem, self.current) else {
                self.current = NULL_PMEM_OFFSET;
                return;
            };
            if !is_delete_type(record.record_type()) {
                return;
            }
            match self.list.record_next(self.current) {
                Ok(next) => self.current = next,
                Err(_) => {
                    self.current = NULL_PMEM_OFFSET;
                    return;
                }
            }
        }
    }

    fn skip_deletes_backward(&mut self) {
        while self.valid() {
            let Some(record) = Record::at(&self.list.pmem, self.current) else {
                self.current = NULL_PMEM_OFFSET;
                return;
            };
            if !is_delete_type(record.record_type()) {
                return;
            }
            match self.list.record_prev(self.current) {
                Ok(prev) => self.current = prev,
                Err(_) => {
                    self.current = NULL_PMEM_OFFSET;
                    return;
                }
            }
        }
    }
}

#[inline]
fn xorshift64(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    if x == 0 {
        1
    } else {
        x
    }
}
