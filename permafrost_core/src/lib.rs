pub mod configs;
pub mod dram;
pub mod engine;
pub mod epoch;
pub mod hash_table;
pub mod pmem;
pub mod record;
pub mod recovery;
pub mod skiplist;
pub mod threads;

pub use configs::{ConfigError, Configs, PersistedConfigs, PMEM_BLOCK_BYTES};
pub use dram::{DramArena, DramError, NULL_DRAM_OFFSET};
pub use engine::{KvEngine, KvError, MAX_KEY_BYTES, MAX_VALUE_BYTES};
pub use epoch::{EpochManager, EpochPin};
pub use hash_table::{
    HashEntrySnapshot, HashTable, HashTableError, KeyHashHint, SearchOutcome, SpinMutex,
};
pub use pmem::{AttachMode, PmemError, PmemPool, SpaceEntry, NULL_PMEM_OFFSET};
pub use record::{
    Record, RecordMeta, SortedLinks, PADDING_RECORD, SORTED_DELETE_RECORD, SORTED_HEADER_RECORD,
    SORTED_PUT_RECORD, STRING_DELETE_RECORD, STRING_PUT_RECORD,
};
pub use recovery::{RecoveryError, RecoveryOutcome, RecoveryStats};
pub use skiplist::{
    encode_internal_key, user_key, Skiplist, SkiplistError, SkiplistNode, SortedIterator, Splice,
    MAX_HEIGHT,
};
pub use threads::{ThreadError, ThreadRegistry};
