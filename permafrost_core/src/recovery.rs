use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::configs::PMEM_BLOCK_BYTES;
use crate::dram::{DramArena, DramError};
use crate::epoch::EpochManager;
use crate::hash_table::{HashTable, HashTableError, SearchOutcome};
use crate::pmem::{PmemError, PmemPool, SpaceEntry};
use crate::record::{
    mark_padding, peek_meta, Record, RECORD_META_BYTES, SORTED_DELETE_RECORD, SORTED_ELEM_MASK,
    SORTED_HEADER_RECORD, SORTED_LINKS_BYTES, SORTED_PUT_RECORD, STRING_DELETE_RECORD,
    STRING_PUT_RECORD, STRING_RECORD_MASK, PADDING_RECORD,
};
use crate::skiplist::{Skiplist, SkiplistError, MAX_HEIGHT};

#[derive(Debug)]
pub enum RecoveryError {
    Pmem(PmemError),
    Hash(HashTableError),
    Skiplist(SkiplistError),
    Dram(DramError),
    Corruption { offset: u64, reason: String },
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryError::Pmem(err) => write!(f, "pmem error during recovery: {}", err),
            RecoveryError::Hash(err) => write!(f, "hash index error during recovery: {}", err),
            RecoveryError::Skiplist(err) => {
                write!(f, "skiplist error during recovery: {}", err)
            }
            RecoveryError::Dram(err) => write!(f, "dram error during recovery: {}", err),
            RecoveryError::Corruption { offset, reason } => {
                write!(f, "unreconcilable record at offset {}: {}", offset, reason)
            }
        }
    }
}

impl std::error::Error for RecoveryError {}

impl From<PmemError> for RecoveryError {
    fn from(value: PmemError) -> Self {
        RecoveryError::Pmem(value)
    }
}

impl From<HashTableError> for RecoveryError {
    fn from(value: HashTableError) -> Self {
        RecoveryError::Hash(value)
    }
}

impl From<SkiplistError> for RecoveryError {
    fn from(value: SkiplistError) -> Self {
        RecoveryError::Skiplist(value)
    }
}

impl From<DramError> for RecoveryError {
    fn from(value: DramError) -> Self {
        RecoveryError::Dram(value)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryStats {
    pub segments_scanned: u64,
    pub records_scanned: u64,
    pub string_records: u64,
    pub sorted_records: u64,
    pub collections: u64,
    pub orphans_completed: u64,
    pub orphans_dropped: u64,
    pub superseded_reclaimed: u64,
    pub corrupt_skipped: u64,
}

pub struct RecoveryOutcome {
    pub collections: HashMap<String, Arc<Skiplist>>,
    pub max_timestamp: u64,
    pub max_collection_id: u64,
    pub stats: RecoveryStats,
}

struct ScannedPool {
    string_latest: HashMap<Vec<u8>, (u64, u64)>,
    string_superseded: Vec<u64>,
    headers: Vec<(u64, Vec<u8>, u64)>,
    sorted_elems: HashSet<u64>,
    max_timestamp: u64,
    stats: RecoveryStats,
}

// Rebuilds the volatile indexes from the pool: scan every allocated segment,
// repair or drop records left mid-splice by a crash, then walk each
// collection's chain in order and reinstate every live key.
pub fn recover(
    pmem: &Arc<PmemPool>,
    arena: &Arc<DramArena>,
    hash: &HashTable,
    epoch: &Arc<EpochManager>,
) -> Result<RecoveryOutcome, RecoveryError> {
    let mut scan = scan_segments(pmem)?;
    repair_orphans(pmem, &mut scan)?;

    let mut collections = HashMap::new();
    let mut max_collection_id = 0_u64;
    let mut visited = HashSet::new();

    for (header_offset, name_bytes, id) in scan.headers.clone() {
        let name = String::from_utf8_lossy(&name_bytes).to_string();
        insert_hash_entry(pmem, hash, &name_bytes, SORTED_HEADER_RECORD, header_offset)?;
        let list = Skiplist::new(
            id,
            name.clone(),
            header_offset,
            Arc::clone(pmem),
            Arc::clone(arena),
            Arc::clone(epoch),
        )?;
        rebuild_collection(pmem, hash, &list, &scan, &mut visited)?;
        max_collection_id = max_collection_id.max(id);
        scan.stats.collections += 1;
        collections.insert(name, list);
    }

    // Records that still looked linked during repair but ended up outside
    // every chain are stale tails of replace sequences; retire their space.
    let unreachable: Vec<u64> = scan
        .sorted_elems
        .iter()
        .copied()
        .filter(|offset| !visited.contains(offset))
        .collect();
    for offset in unreachable {
        if let Some(record) = Record::at(pmem, offset) {
            mark_padding(pmem, record);
            pmem.restock_free_space(SpaceEntry {
                offset,
                size: record.alloc_len() as u64,
            });
            scan.stats.superseded_reclaimed += 1;
        }
    }

    for (key, (offset, _ts)) in scan.string_latest.iter() {
        let record = Record::at(pmem, *offset).ok_or_else(|| RecoveryError::Corruption {
            offset: *offset,
            reason: "scanned string record no longer parses".to_string(),
        })?;
        insert_hash_entry(pmem, hash, key, record.record_type(), *offset)?;
    }
    for offset in scan.string_superseded.drain(..) {
        if let Some(record) = Record::at(pmem, offset) {
            mark_padding(pmem, record);
            pmem.restock_free_space(SpaceEntry {
                offset,
                size: record.alloc_len() as u64,
            });
        }
    }

    tracing::info!(
        segments = scan.stats.segments_scanned,
        records = scan.stats.records_scanned,
        strings = scan.stats.string_records,
        sorted = scan.stats.sorted_records,
        collections = scan.stats.collections,
        orphans_completed = scan.stats.orphans_completed,
        orphans_dropped = scan.stats.orphans_dropped,
        superseded_reclaimed = scan.stats.superseded_reclaimed,
        corrupt_skipped = scan.stats.corrupt_skipped,
        "pool recovery complete"
    );

    Ok(RecoveryOutcome {
        collections,
        max_timestamp: scan.max_timestamp,
        max_collection_id,
        stats: scan.stats,
    })
}

fn scan_segments(pmem: &Arc<PmemPool>) -> Result<ScannedPool, RecoveryError> {
    let mut scan = ScannedPool {
        string_latest: HashMap::new(),
        string_superseded: Vec::new(),
        headers: Vec::new(),
        sorted_elems: HashSet::new(),
        max_timestamp: 0,
        stats: RecoveryStats::default(),
    };

    for (seg_start, seg_end) in pmem.segments() {
        scan.stats.segments_scanned += 1;
        let mut offset = seg_start;
        while offset < seg_end {
            let Some((alloc_len, record_type)) = peek_meta(pmem, offset) else {
                break;
            };
            if alloc_len == 0 {
                // Zeroed tail of a partially filled segment.
                break;
            }
            let alloc_len = alloc_len as u64;
            if alloc_len < RECORD_META_BYTES as u64
                || alloc_len % PMEM_BLOCK_BYTES != 0
                || offset + alloc_len > seg_end
            {
                tracing::warn!(offset, alloc_len, "implausible record length, abandoning segment tail");
                scan.stats.corrupt_skipped += 1;
                break;
            }

            if record_type == PADDING_RECORD {
                pmem.restock_free_space(SpaceEntry {
                    offset,
                    size: alloc_len,
                });
                offset += alloc_len;
                continue;
            }

            let parsed = Record::at(pmem, offset).filter(|record| record.verify_checksum());
            let Some(record) = parsed else {
                // A torn write at the segment's append point, or garbage in
                // recycled space that never got republished. Either way the
                // slot is free.
                tracing::warn!(offset, record_type, "dropping record with bad checksum");
                scan.stats.corrupt_skipped += 1;
                pmem.restock_free_space(SpaceEntry {
                    offset,
                    size: alloc_len,
                });
                offset += alloc_len;
                continue;
            };

            scan.stats.records_scanned += 1;
            scan.max_timestamp = scan.max_timestamp.max(record.timestamp());
            match record.record_type() {
                STRING_PUT_RECORD | STRING_DELETE_RECORD => {
                    scan.stats.string_records += 1;
                    let key = record.key().to_vec();
                    match scan.string_latest.get_mut(&key) {
                        Some((existing_offset, existing_ts)) => {
                            if record.timestamp() > *existing_ts {
                                scan.string_superseded.push(*existing_offset);
                                *existing_offset = offset;
                                *existing_ts = record.timestamp();
                            } else {
                                scan.string_superseded.push(offset);
                            }
                        }
                        None => {
                            scan.string_latest.insert(key, (offset, record.timestamp()));
                        }
                    }
                }
                SORTED_HEADER_RECORD => {
                    let mut id_bytes = [0_u8; 8];
                    let value = record.value();
                    if value.len() != 8 {
                        return Err(RecoveryError::Corruption {
                            offset,
                            reason: "collection header value is not an 8-byte id".to_string(),
                        });
                    }
                    id_bytes.copy_from_slice(value);
                    scan.headers.push((
                        offset,
                        record.key().to_vec(),
                        u64::from_le_bytes(id_bytes),
                    ));
                }
                SORTED_PUT_RECORD | SORTED_DELETE_RECORD => {
                    scan.stats.sorted_records += 1;
                    scan.sorted_elems.insert(offset);
                }
                other => {
                    return Err(RecoveryError::Corruption {
                        offset,
                        reason: format!("checksummed record with unknown type {}", other),
                    });
                }
            }
            offset += alloc_len;
        }
    }

    Ok(scan)
}

// A crash can leave a freshly persisted record whose neighbours do not both
// reference it yet. If the successor's back pointer already reached the
// record, the insert is completed forward; otherwise the record never became
// reachable and is dropped.
fn repair_orphans(pmem: &Arc<PmemPool>, scan: &mut ScannedPool) -> Result<(), RecoveryError> {
    let offsets: Vec<u64> = scan.sorted_elems.iter().copied().collect();
    for offset in offsets {
        let record = Record::at(pmem, offset).ok_or_else(|| RecoveryError::Corruption {
            offset,
            reason: "scanned sorted record no longer parses".to_string(),
        })?;
        let links = record.links().ok_or_else(|| RecoveryError::Corruption {
            offset,
            reason: "sorted record without link block".to_string(),
        })?;
        let prev_offset = links.prev.load(Ordering::Acquire);
        let next_offset = links.next.load(Ordering::Acquire);

        let prev_links = Record::at(pmem, prev_offset).and_then(|prev| prev.links());
        let next_links = Record::at(pmem, next_offset).and_then(|next| next.links());
        let (Some(prev_links), Some(next_links)) = (prev_links, next_links) else {
            tracing::warn!(offset, "dropping unreachable sorted record");
            reclaim_sorted_record(pmem, scan, offset, record);
            scan.stats.orphans_dropped += 1;
            continue;
        };

        if prev_links.next.load(Ordering::Acquire) == offset {
            continue;
        }
        if next_links.prev.load(Ordering::Acquire) == offset {
            // Steps one and two of the splice were durable; redo step three.
            prev_links.next.store(offset, Ordering::Release);
            pmem.persist_offset(prev_offset + RECORD_META_BYTES as u64, SORTED_LINKS_BYTES);
            scan.stats.orphans_completed += 1;
            tracing::info!(offset, "completed half-spliced sorted record");
            continue;
        }

        // Neither neighbour references the record. If a newer record of the
        // same key occupies its old window, this is the detached leftover of
        // a completed update or delete rather than an in-flight insert.
        let superseded = Record::at(pmem, prev_links.next.load(Ordering::Acquire))
            .map(|successor| {
                successor.key() == record.key() && successor.timestamp() > record.timestamp()
            })
            .unwrap_or(false);
        if superseded {
            tracing::debug!(offset, "reclaiming superseded sorted record");
            reclaim_sorted_record(pmem, scan, offset, record);
            scan.stats.superseded_reclaimed += 1;
        } else {
            tracing::warn!(offset, "dropping unreachable sorted record");
            reclaim_sorted_record(pmem, scan, offset, record);
            scan.stats.orphans_dropped += 1;
        }
    }
    Ok(())
}

fn reclaim_sorted_record(pmem: &PmemPool, scan: &mut ScannedPool, offset: u64, record: Record<'_>) {
    mark_padding(pmem, record);
    pmem.restock_free_space(SpaceEntry {
        offset,
        size: record.alloc_len() as u64,
    });
    scan.sorted_elems.remove(&offset);
}

fn rebuild_collection(
    pmem: &Arc<PmemPool>,
    hash: &HashTable,
    list: &Arc<Skiplist>,
    scan: &ScannedPool,
    visited: &mut HashSet<u64>,
) -> Result<(), RecoveryError> {
    let mut tails = [list.header_node(); MAX_HEIGHT + 1];
    let mut last_key: Option<Vec<u8>> = None;
    let mut offset = list.record_next(list.header_record())?;

    while offset != list.header_record() {
        if !scan.sorted_elems.contains(&offset) {
            return Err(RecoveryError::Corruption {
                offset,
                reason: format!("chain of '{}' references an unscanned record", list.name()),
            });
        }
        if !visited.insert(offset) {
            return Err(RecoveryError::Corruption {
                offset,
                reason: format!("chain of '{}' revisits a record", list.name()),
            });
        }
        let record = Record::at(pmem, offset).ok_or_else(|| RecoveryError::Corruption {
            offset,
            reason: "chain record no longer parses".to_string(),
        })?;
        let key = record.key();
        if let Some(last) = &last_key {
            if key <= last.as_slice() {
                return Err(RecoveryError::Corruption {
                    offset,
                    reason: format!("chain of '{}' is out of key order", list.name()),
                });
            }
        }
        last_key = Some(key.to_vec());

        match record.record_type() {
            SORTED_PUT_RECORD => {
                let node_offset = list.rebuild_append(&mut tails, key, offset)?;
                insert_hash_entry(pmem, hash, key, SORTED_PUT_RECORD, node_offset)?;
            }
            SORTED_DELETE_RECORD => {
                // Delete markers keep their chain slot but get no index node.
                insert_hash_entry(pmem, hash, key, SORTED_DELETE_RECORD, offset)?;
            }
            other => {
                return Err(RecoveryError::Corruption {
                    offset,
                    reason: format!("chain record with unexpected type {}", other),
                });
            }
        }
        offset = list.record_next(offset)?;
    }
    Ok(())
}

// Single-threaded during recovery, so shard locks are unnecessary.
fn insert_hash_entry(
    pmem: &PmemPool,
    hash: &HashTable,
    key: &[u8],
    record_type: u16,
    payload: u64,
) -> Result<(), RecoveryError> {
    let mask = match record_type {
        STRING_PUT_RECORD | STRING_DELETE_RECORD => STRING_RECORD_MASK,
        SORTED_HEADER_RECORD => SORTED_HEADER_RECORD,
        _ => SORTED_ELEM_MASK,
    };
    let hint = hash.hint(key);
    match hash.search(&hint, key, mask, pmem, true)? {
        SearchOutcome::NotFound { free: Some(free) } => {
            hash.insert(&hint, free, record_type, payload, false)?;
            Ok(())
        }
        SearchOutcome::Found { entry, .. } => {
            hash.insert(&hint, entry, record_type, payload, true)?;
            Ok(())
        }
        SearchOutcome::NotFound { free: None } => Err(RecoveryError::Corruption {
            offset: payload,
            reason: "hash search for write returned no slot".to_string(),
        }),
    }
}
