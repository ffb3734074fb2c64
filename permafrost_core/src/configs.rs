use std::fmt;

use serde::{Deserialize, Serialize};

pub const PMEM_BLOCK_BYTES: u64 = 64;
pub const HASH_ENTRY_BYTES: u32 = 16;
pub const MIN_HASH_BUCKET_BYTES: u32 = HASH_ENTRY_BYTES + 8;

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue { field: &'static str, reason: String },
    Mismatch { field: &'static str, persisted: u64, requested: u64 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "invalid config value for {}: {}", field, reason)
            }
            ConfigError::Mismatch {
                field,
                persisted,
                requested,
            } => write!(
                f,
                "config {} does not match pool (persisted {}, requested {})",
                field, persisted, requested
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Configs {
    pub pmem_file_size: u64,
    pub pmem_segment_bytes: u64,
    pub hash_bucket_num: u64,
    pub hash_bucket_size: u32,
    pub num_buckets_per_slot: u64,
    pub max_access_threads: usize,
    pub dram_arena_bytes: usize,
}

impl Default for Configs {
    fn default() -> Self {
        Self {
            pmem_file_size: 1 << 30,
            pmem_segment_bytes: 1 << 20,
            hash_bucket_num: 1 << 20,
            hash_bucket_size: 128,
            num_buckets_per_slot: 16,
            max_access_threads: 64,
            dram_arena_bytes: 1 << 30,
        }
    }
}

impl Configs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.hash_bucket_num.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                field: "hash_bucket_num",
                reason: format!("{} is not a power of two", self.hash_bucket_num),
            });
        }
        if self.hash_bucket_size < MIN_HASH_BUCKET_BYTES {
            return Err(ConfigError::InvalidValue {
                field: "hash_bucket_size",
                reason: format!(
                    "{} cannot hold one entry plus the overflow pointer (min {})",
                    self.hash_bucket_size, MIN_HASH_BUCKET_BYTES
                ),
            });
        }
        if self.num_buckets_per_slot == 0
            || !self.num_buckets_per_slot.is_power_of_two()
            || self.num_buckets_per_slot > self.hash_bucket_num
        {
            return Err(ConfigError::InvalidValue {
                field: "num_buckets_per_slot",
                reason: format!(
                    "{} must be a power of two no larger than hash_bucket_num",
                    self.num_buckets_per_slot
                ),
            });
        }
        if self.pmem_segment_bytes == 0 || self.pmem_segment_bytes % PMEM_BLOCK_BYTES != 0 {
            return Err(ConfigError::InvalidValue {
                field: "pmem_segment_bytes",
                reason: format!(
                    "{} must be a non-zero multiple of the {}-byte block",
                    self.pmem_segment_bytes, PMEM_BLOCK_BYTES
                ),
            });
        }
        if self.pmem_file_size < self.pmem_segment_bytes * 2 {
            return Err(ConfigError::InvalidValue {
                field: "pmem_file_size",
                reason: format!(
                    "{} must hold at least two {}-byte segments",
                    self.pmem_file_size, self.pmem_segment_bytes
                ),
            });
        }
        if self.max_access_threads == 0 || self.max_access_threads > u16::MAX as usize {
            return Err(ConfigError::InvalidValue {
                field: "max_access_threads",
                reason: format!("{} is out of range", self.max_access_threads),
            });
        }
        if self.dram_arena_bytes < (self.hash_bucket_num * self.hash_bucket_size as u64) as usize {
            return Err(ConfigError::InvalidValue {
                field: "dram_arena_bytes",
                reason: "arena smaller than the main hash bucket array".to_string(),
            });
        }
        Ok(())
    }

    #[inline]
    pub fn entries_per_bucket(&self) -> u32 {
        (self.hash_bucket_size - 8) / HASH_ENTRY_BYTES
    }
}

// The subset of `Configs` that fixes the on-pmem layout. Persisted into the
// pool header at creation and re-validated on every reopen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedConfigs {
    pub pmem_file_size: u64,
    pub pmem_segment_bytes: u64,
}

impl PersistedConfigs {
    pub fn from_configs(configs: &Configs) -> Self {
        Self {
            pmem_file_size: configs.pmem_file_size,
            pmem_segment_bytes: configs.pmem_segment_bytes,
        }
    }

    pub fn check_compatible(&self, configs: &Configs) -> Result<(), ConfigError> {
        if self.pmem_file_size != configs.pmem_file_size {
            return Err(ConfigError::Mismatch {
                field: "pmem_file_size",
                persisted: self.pmem_file_size,
                requested: configs.pmem_file_size,
            });
        }
        if self.pmem_segment_bytes != configs.pmem_segment_bytes {
            return Err(ConfigError::Mismatch {
                field: "pmem_segment_bytes",
                persisted: self.pmem_segment_bytes,
                requested: configs.pmem_segment_bytes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configs_validate() {
        Configs::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn non_power_of_two_bucket_num_is_rejected() {
        let mut configs = Configs::default();
        configs.hash_bucket_num = 1000;
        assert!(matches!(
            configs.validate(),
            Err(ConfigError::InvalidValue {
                field: "hash_bucket_num",
                ..
            })
        ));
    }

    #[test]
    fn bucket_size_must_hold_entry_and_overflow_pointer() {
        let mut configs = Configs::default();
        configs.hash_bucket_size = 16;
        assert!(matches!(
            configs.validate(),
            Err(ConfigError::InvalidValue {
                field: "hash_bucket_size",
                ..
            })
        ));
    }

    #[test]
    fn persisted_configs_reject_layout_change() {
        let configs = Configs::default();
        let persisted = PersistedConfigs::from_configs(&configs);
        persisted
            .check_compatible(&configs)
            .expect("identical configs must be compatible");

        let mut shrunk = configs.clone();
        shrunk.pmem_file_size /= 2;
        assert!(matches!(
            persisted.check_compatible(&shrunk),
            Err(ConfigError::Mismatch {
                field: "pmem_file_size",
                ..
            })
        ));
    }

    #[test]
    fn default_bucket_holds_seven_entries() {
        assert_eq!(Configs::default().entries_per_bucket(), 7);
    }
}
