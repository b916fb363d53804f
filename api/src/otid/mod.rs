//!
//! OTID index: `(object_id, thread_id)` → successive-write state.
//!
//! Every write routes through [`OtidIndex::insert`]; the handler runs
//! under the OTID shard lock and decides whether the write extends the
//! writer's in-flight slice, opens a fresh one, or passes through. The
//! writer's `current_slice` cell is an atomic shared with the slice so the
//! flush path can clear it without touching the OTID lock.
//!


use crate::{
    combine::{CombineCore, ExpireKey, FlushCause},
    common::{OperationContext, Oid, Tid, WriteCombineConfig, BLOCK_SIZE, COMBINE_MIN_TRAILING},
    obid::ObidEntry,
    slice::{SliceId, SliceStage, SLICE_NONE},
};
use blockwise_core::{
    now_ms, EntryHandler, OpError, OpResult, ShardedHtable, ShardedValue, ShardingConfig, TimerId,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct OtidKey {
    pub oid: Oid,
    pub tid: Tid,
}

pub struct OtidEntry {
    /// Absolute byte offset immediately after the last accepted write.
    pub last_write_offset: u64,
    /// Length of the current run of writes with `start == previous end`.
    pub successive_count: u32,
    slice: Arc<AtomicU64>,
}

impl OtidEntry {
    #[inline(always)]
    pub fn slice_id(&self) -> SliceId {
        self.slice.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn slice_cell(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.slice)
    }
}

impl ShardedValue for OtidEntry {
    type Key = OtidKey;

    fn new(_key: &OtidKey) -> Self {
        Self {
            last_write_offset: 0,
            successive_count: 0,
            slice: Arc::new(AtomicU64::new(SLICE_NONE)),
        }
    }

    // an entry with an engaged slice is never reclaimable
    fn accept_reclaim(&self) -> bool {
        self.slice_id() == SLICE_NONE
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

pub struct OtidIndex {
    table: ShardedHtable<OtidEntry>,
}

impl OtidIndex {
    pub fn new(cfg: &WriteCombineConfig) -> Self {
        Self {
            table: ShardedHtable::new(ShardingConfig {
                shard_count: cfg.otid_shard_count,
                element_limit: cfg.otid_element_limit,
                min_ttl_ms: cfg.otid_min_ttl_ms,
                max_ttl_ms: cfg.otid_max_ttl_ms,
            }),
        }
    }

    /// Route a write through the successive-write policy. Returns whether
    /// the payload was absorbed by the combine core.
    pub fn insert(
        &self,
        core: &CombineCore,
        op: &OperationContext,
        buf: &[u8],
    ) -> OpResult<bool> {
        let key = OtidKey {
            oid: op.bs_key.block.oid,
            tid: op.tid,
        };
        let mut arg = InsertArg {
            op,
            buf,
            combined: false,
        };
        let handler = InsertHandler { core };
        self.table.insert(&key, &handler, &mut arg)?;
        Ok(arg.combined)
    }

    /// Drop the object's writer entries that hold no slice.
    pub fn drop_object(&self, oid: Oid) {
        self.table
            .retain(|k, e| k.oid != oid || e.slice_id() != SLICE_NONE);
    }

    pub fn visit<R>(&self, key: &OtidKey, f: impl FnOnce(&mut OtidEntry) -> R) -> Option<R> {
        self.table.visit(key, f)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

struct InsertArg<'a> {
    op: &'a OperationContext,
    buf: &'a [u8],
    combined: bool,
}

struct InsertHandler<'c> {
    core: &'c CombineCore,
}

impl<'a> EntryHandler<OtidEntry, InsertArg<'a>> for InsertHandler<'_> {
    fn on_entry(
        &self,
        entry: &mut OtidEntry,
        arg: &mut InsertArg<'a>,
        new_create: bool,
    ) -> OpResult<()> {
        let offset = arg.op.bs_key.abs_offset();
        let result = if new_create {
            entry.successive_count = 0;
            Ok(())
        } else if offset == entry.last_write_offset {
            entry.successive_count += 1;
            self.check_combine_slice(entry, arg)
        } else {
            entry.successive_count = 0;
            Ok(())
        };
        entry.last_write_offset = offset + arg.op.bs_key.slice.length as u64;
        result
    }
}

// what combine_slice decided while the locks were held
enum Verdict {
    Extend(i64, TimerId),
    Flush(FlushCause),
    FlushOverflow,
}

impl InsertHandler<'_> {
    #[inline(always)]
    fn coalescable(&self, arg: &InsertArg<'_>) -> bool {
        arg.op.bs_key.slice.length < self.core.cfg.skip_combine_on_slice_size
    }

    fn check_combine_slice(
        &self,
        entry: &mut OtidEntry,
        arg: &mut InsertArg<'_>,
    ) -> OpResult<()> {
        let sid = entry.slice_id();
        let new_slice = if sid == SLICE_NONE {
            arg.combined = self.coalescable(arg);
            true
        } else {
            self.combine_slice(sid, entry, arg)?
        };

        if new_slice && arg.combined {
            return self.create_slice(entry, arg);
        }
        Ok(())
    }

    // Try to extend the writer's in-flight slice. Returns whether a fresh
    // slice should be opened instead.
    fn combine_slice(
        &self,
        sid: SliceId,
        entry: &mut OtidEntry,
        arg: &mut InsertArg<'_>,
    ) -> OpResult<bool> {
        let core = self.core;
        let cfg = &core.cfg;
        let block = arg.op.bs_key.block;

        core.obid.with_entry(&block, |ent| {
            let owned_here = matches!(ent.get(), Some(oe) if oe.slice == sid);
            if !owned_here {
                // the slice flushed behind our back (or belongs to another
                // block entirely): a busy writer gets a fresh slice
                let merged = core.arena.with(sid, |s| s.merged_slices).unwrap_or(0);
                arg.combined = merged > cfg.skip_combine_on_last_merged_slices;
                return Ok(true);
            }

            // resident in OBID implies MERGING; the shard lock pins it
            let verdict = core.arena.with(sid, |s| {
                debug_assert_eq!(s.stage, SliceStage::Merging);
                if s.bs_key.abs_end() != arg.op.bs_key.abs_offset() {
                    // successive for the writer but not contiguous with the
                    // slice extent: flush the stale slice
                    return Verdict::Flush(FlushCause::Adjacency);
                }
                let merged = s.length() as u64 + arg.op.bs_key.slice.length as u64;
                if s.bs_key.slice.offset as u64 + merged > BLOCK_SIZE as u64 {
                    return Verdict::FlushOverflow;
                }
                if arg.op.bs_key.slice.length >= cfg.skip_combine_on_slice_size {
                    return Verdict::Flush(FlushCause::Size);
                }

                s.absorb(arg.buf);
                arg.combined = true;

                if s.trailing_space() >= COMBINE_MIN_TRAILING as i64 {
                    let current = entry.successive_count as i64 * cfg.min_wait_time_ms;
                    let remain = (s.start_time_ms + cfg.max_wait_time_ms) - now_ms();
                    Verdict::Extend(current.min(remain), s.timer)
                } else {
                    Verdict::Flush(FlushCause::Space)
                }
            });

            match verdict {
                None => {
                    // OBID said owned but the arena missed: recovered by a
                    // pass-through
                    arg.combined = false;
                    Ok(true)
                }
                Some(Verdict::Extend(timeout, timer)) => {
                    let _ = core.wheel.modify(timer, timeout.max(0));
                    Ok(false)
                }
                Some(Verdict::Flush(FlushCause::Adjacency)) => {
                    core.push_to_flush_locked(ent, sid, FlushCause::Adjacency, None);
                    arg.combined = self.coalescable(arg);
                    Ok(true)
                }
                Some(Verdict::Flush(cause)) => {
                    core.push_to_flush_locked(ent, sid, cause, None);
                    Ok(false)
                }
                Some(Verdict::FlushOverflow) => {
                    // eager flush keeps the stranded slice from waiting out
                    // its timer; the write itself passes through
                    core.push_to_flush_locked(ent, sid, FlushCause::Overflow, None);
                    Err(OpError::Overflow)
                }
            }
        })
    }

    fn create_slice(&self, entry: &mut OtidEntry, arg: &mut InsertArg<'_>) -> OpResult<()> {
        let core = self.core;
        let cfg = &core.cfg;
        let bs = arg.op.bs_key;

        let trailing =
            BLOCK_SIZE as i64 - (bs.slice.offset as i64 + bs.slice.length as i64);
        if trailing < COMBINE_MIN_TRAILING as i64 {
            arg.combined = false;
            return Ok(());
        }
        if bs.slice.length as usize > BLOCK_SIZE {
            arg.combined = false;
            return Err(OpError::Overflow);
        }

        let sid = match core.arena.create(bs, arg.buf, entry.slice_cell()) {
            Ok(sid) => sid,
            Err(e) => {
                arg.combined = false;
                core.stats.alloc_failures.fetch_add(1, Ordering::AcqRel);
                return Err(e);
            }
        };

        let inserted = core.obid.with_entry(&bs.block, |ent| {
            let occupied = matches!(ent.get(), Some(oe) if oe.slice != SLICE_NONE);
            if occupied {
                return false;
            }
            match ent.get() {
                Some(oe) => oe.slice = sid,
                None => {
                    if ent.insert(ObidEntry { slice: sid }).is_err() {
                        return false;
                    }
                }
            }
            // link and arm inside the OBID lock so a concurrent flush
            // cannot observe a timerless MERGING slice
            entry.slice.store(sid, Ordering::Release);
            let timeout =
                (entry.successive_count as i64 * cfg.min_wait_time_ms).min(cfg.max_wait_time_ms);
            let tid = core.wheel.add(
                ExpireKey {
                    slice: sid,
                    block: bs.block,
                },
                timeout.max(0),
            );
            core.arena.with(sid, |s| s.timer = tid);
            true
        });

        if !inserted {
            if let Some(stale) = core.arena.take(sid) {
                core.arena.release(stale);
            }
            arg.combined = false;
            return Err(OpError::Exists);
        }
        Ok(())
    }
}
