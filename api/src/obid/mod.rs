//!
//! OBID index: `(object_id, block_offset)` → in-flight slice.
//!
//! Owns the merging slice for a block so concurrent writers of the same
//! block can find it. Entries are created when a mergeable slice is opened
//! and removed when it flushes; an entry holding a live slice is never
//! displaced or reclaimed.
//!

#[cfg(test)]
mod test;

use crate::{
    common::{BlockKey, WriteCombineConfig},
    slice::{SliceId, SLICE_NONE},
};
use blockwise_core::{EntryRef, ShardedHtable, ShardedValue, ShardingConfig};

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

pub struct ObidEntry {
    pub slice: SliceId,
}

impl ShardedValue for ObidEntry {
    type Key = BlockKey;

    fn new(_key: &BlockKey) -> Self {
        Self { slice: SLICE_NONE }
    }

    fn accept_reclaim(&self) -> bool {
        self.slice == SLICE_NONE
    }
}

pub struct ObidIndex {
    table: ShardedHtable<ObidEntry>,
}

impl ObidIndex {
    pub fn new(cfg: &WriteCombineConfig) -> Self {
        Self {
            table: ShardedHtable::new(ShardingConfig {
                shard_count: cfg.obid_shard_count,
                // entries leave at flush time; the cap only catches leaks
                element_limit: usize::MAX >> 1,
                min_ttl_ms: cfg.otid_min_ttl_ms,
                max_ttl_ms: cfg.otid_max_ttl_ms,
            }),
        }
    }

    /// Run `f` on the block's slot with the shard lock held.
    #[inline(always)]
    pub fn with_entry<R>(
        &self,
        key: &BlockKey,
        f: impl FnOnce(&mut EntryRef<'_, ObidEntry>) -> R,
    ) -> R {
        self.table.with_entry(key, f)
    }

    /// Blocks of an object that currently own a slice.
    pub fn blocks_of(&self, oid: u64) -> Vec<BlockKey> {
        self.table.keys_matching(|k| k.oid == oid)
    }

    /// Every block that currently owns a slice.
    pub fn all_blocks(&self) -> Vec<BlockKey> {
        self.table.keys_matching(|_| true)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
