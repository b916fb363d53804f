//!
//! # Common components
//!
//! Domain keys, the per-request operation context and the configuration
//! blocks carried by an [`crate::ApiContext`].
//!

use blockwise_core::MB;
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf};

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// Fixed size of a storage block.
pub const BLOCK_SIZE: usize = 4 * MB as usize;

/// A merge that would leave less trailing space than this in the block is
/// not worth another round; the slice is flushed instead.
pub const COMBINE_MIN_TRAILING: usize = 4096;

pub type Oid = u64;
pub type Tid = u64;

/// Block identity: `(object_id, block_offset)`.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct BlockKey {
    pub oid: Oid,
    pub offset: u64,
}

impl BlockKey {
    /// Partitioning code for the data-thread rings and group routing.
    #[inline(always)]
    pub fn hash_code(&self) -> u64 {
        self.oid.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ (self.offset / BLOCK_SIZE as u64)
    }
}

/// A contiguous byte range inside a block.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct SliceRange {
    pub offset: u32,
    pub length: u32,
}

/// The full extent addressed by a slice operation.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct BlockSliceKey {
    pub block: BlockKey,
    pub slice: SliceRange,
}

impl BlockSliceKey {
    /// Absolute byte offset of the slice start within the object.
    #[inline(always)]
    pub fn abs_offset(&self) -> u64 {
        self.block.offset + self.slice.offset as u64
    }

    /// Absolute byte offset immediately after the slice.
    #[inline(always)]
    pub fn abs_end(&self) -> u64 {
        self.abs_offset() + self.slice.length as u64
    }
}

/// Ephemeral per-request value handed to [`crate::ApiContext::write`]. The
/// payload buffer is borrowed for the duration of the call.
#[derive(Clone, Copy, Debug)]
pub struct OperationContext {
    pub bs_key: BlockSliceKey,
    pub tid: Tid,
}

impl OperationContext {
    pub fn slice_write(oid: Oid, block_offset: u64, slice_offset: u32, length: u32, tid: Tid) -> Self {
        Self {
            bs_key: BlockSliceKey {
                block: BlockKey {
                    oid,
                    offset: block_offset,
                },
                slice: SliceRange {
                    offset: slice_offset,
                    length,
                },
            },
            tid,
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// Write-combining tunables, all times in milliseconds and sizes in bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteCombineConfig {
    pub enabled: bool,
    /// Unit of per-successive timeout extension.
    pub min_wait_time_ms: i64,
    /// Absolute cap on a slice's coalescing lifetime.
    pub max_wait_time_ms: i64,
    /// Writes at or above this size bypass coalescing.
    pub skip_combine_on_slice_size: u32,
    /// After this many merges a flushed-behind-our-back writer starts a
    /// fresh slice instead of passing through.
    pub skip_combine_on_last_merged_slices: u32,
    pub otid_shard_count: usize,
    pub obid_shard_count: usize,
    pub otid_element_limit: usize,
    pub otid_min_ttl_ms: i64,
    pub otid_max_ttl_ms: i64,
    pub timer_precision_ms: i64,
    pub timer_slot_count: usize,
}

impl Default for WriteCombineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_wait_time_ms: 10,
            max_wait_time_ms: 100,
            skip_combine_on_slice_size: 64 * 1024,
            skip_combine_on_last_merged_slices: 1,
            otid_shard_count: 163,
            obid_shard_count: 163,
            otid_element_limit: 16384,
            otid_min_ttl_ms: 600_000,
            otid_max_ttl_ms: 86_400_000,
            timer_precision_ms: 1,
            timer_slot_count: 16384,
        }
    }
}

/// Data-thread pool sizing and retry policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataThreadConfig {
    pub data_threads_master: usize,
    pub data_threads_slave: usize,
    pub queue_depth: usize,
    /// Transient storage errors are retried this many times before they
    /// surface to the caller.
    pub retry_limit: u32,
    pub retry_interval_ms: u64,
}

impl Default for DataThreadConfig {
    fn default() -> Self {
        Self {
            data_threads_master: 2,
            data_threads_slave: 2,
            queue_depth: 1024,
            retry_limit: 3,
            retry_interval_ms: 10,
        }
    }
}

/// Replica binlog layout.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BinlogConfig {
    pub base_dir: PathBuf,
    pub segment_size: u64,
}

impl Default for BinlogConfig {
    fn default() -> Self {
        let d = env::var("BLOCKWISE_BINLOG_DIR")
            .or_else(|_| env::var("HOME").map(|h| format!("{}/.blockwise/binlog", h)))
            .unwrap_or_else(|_| "/tmp/.blockwise/binlog".to_owned());
        Self {
            base_dir: PathBuf::from(d),
            segment_size: 64 * MB,
        }
    }
}

/// Top-level context configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    pub write_combine: WriteCombineConfig,
    pub data_threads: DataThreadConfig,
    pub binlog: BinlogConfig,
    pub data_group_count: usize,
    /// Number of 4 MiB slice buffers the slab may hold.
    pub slice_slab_capacity: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            write_combine: WriteCombineConfig::default(),
            data_threads: DataThreadConfig::default(),
            binlog: BinlogConfig::default(),
            data_group_count: 4,
            slice_slab_capacity: 64,
        }
    }
}
