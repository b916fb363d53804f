//!
//! Combine handler.
//!
//! Push-to-flush is the only transition visible to the write path: a
//! `MERGING` slice leaves both indices, loses its timer and lands on the
//! outbound ring, all while the OBID shard lock is held. A single drainer
//! thread moves queued slices from the ring into the data-thread pool.
//!


use crate::{
    common::{BlockKey, WriteCombineConfig},
    data_thread::{DataOperation, DataThreadPool, DoneNotify, OpKind, OpSource},
    obid::{ObidEntry, ObidIndex},
    slice::{SliceArena, SliceId, SliceStage, SLICE_NONE},
};
use blockwise_core::{CondQueue, EntryRef, OpError, TimerWheel, TIMER_NONE};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use threadpool::ThreadPool;

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// Timer payload: enough to find the slice again without touching it.
#[derive(Clone, Copy, Debug)]
pub struct ExpireKey {
    pub slice: SliceId,
    pub block: BlockKey,
}

/// What tripped a flush.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushCause {
    Timer,
    Size,
    Space,
    Adjacency,
    Overflow,
    Explicit,
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
pub struct CombineStats {
    pub total_writes: AtomicU64,
    pub combined_writes: AtomicU64,
    pub flushed_by_timer: AtomicU64,
    pub flushed_by_size: AtomicU64,
    pub flushed_by_space: AtomicU64,
    pub flushed_by_adjacency: AtomicU64,
    pub flushed_by_overflow: AtomicU64,
    pub flushed_explicit: AtomicU64,
    pub alloc_failures: AtomicU64,
    pub dispatched_ok: AtomicU64,
    pub storage_errors: AtomicU64,
    pub binlog_errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct StatsSnapshot {
    pub total_writes: u64,
    pub combined_writes: u64,
    pub flushed_by_timer: u64,
    pub flushed_by_size: u64,
    pub flushed_by_space: u64,
    pub flushed_by_adjacency: u64,
    pub flushed_by_overflow: u64,
    pub flushed_explicit: u64,
    pub alloc_failures: u64,
    pub dispatched_ok: u64,
    pub storage_errors: u64,
    pub binlog_errors: u64,
}

impl CombineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let ld = |a: &AtomicU64| a.load(Ordering::Acquire);
        StatsSnapshot {
            total_writes: ld(&self.total_writes),
            combined_writes: ld(&self.combined_writes),
            flushed_by_timer: ld(&self.flushed_by_timer),
            flushed_by_size: ld(&self.flushed_by_size),
            flushed_by_space: ld(&self.flushed_by_space),
            flushed_by_adjacency: ld(&self.flushed_by_adjacency),
            flushed_by_overflow: ld(&self.flushed_by_overflow),
            flushed_explicit: ld(&self.flushed_explicit),
            alloc_failures: ld(&self.alloc_failures),
            dispatched_ok: ld(&self.dispatched_ok),
            storage_errors: ld(&self.storage_errors),
            binlog_errors: ld(&self.binlog_errors),
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// Shared state of the combine engine: tunables, the slice arena, the OBID
/// index, the timing wheel and the outbound ring.
pub struct CombineCore {
    pub cfg: WriteCombineConfig,
    pub arena: Arc<SliceArena>,
    pub obid: ObidIndex,
    pub wheel: Arc<TimerWheel<ExpireKey>>,
    pub ring: Arc<CondQueue<SliceId>>,
    pub stats: Arc<CombineStats>,
}

impl CombineCore {
    pub fn new(
        cfg: WriteCombineConfig,
        arena: Arc<SliceArena>,
        wheel: Arc<TimerWheel<ExpireKey>>,
    ) -> Self {
        let obid = ObidIndex::new(&cfg);
        Self {
            cfg,
            arena,
            obid,
            wheel,
            ring: Arc::new(CondQueue::new(8192)),
            stats: Arc::new(CombineStats::default()),
        }
    }

    /// `MERGING → QUEUED` under the OBID shard lock held by `ent`: detach
    /// the timer, clear the writer link, drop the OBID entry and enqueue to
    /// the outbound ring. A slice already past `MERGING` is left alone.
    pub(crate) fn push_to_flush_locked(
        &self,
        ent: &mut EntryRef<'_, ObidEntry>,
        sid: SliceId,
        cause: FlushCause,
        notify: Option<Arc<DoneNotify>>,
    ) -> bool {
        let mut notify = notify;
        let queued = self
            .arena
            .with(sid, |s| {
                if s.stage != SliceStage::Merging {
                    return false;
                }
                s.stage = SliceStage::Queued;
                s.notify = notify.take();
                let timer = s.timer;
                s.timer = TIMER_NONE;
                s.clear_writer_link(sid);
                if timer != TIMER_NONE {
                    self.wheel.remove(timer);
                }
                true
            })
            .unwrap_or(false);

        if !queued {
            // flushed behind our back; nothing left to wait for
            if let Some(n) = notify {
                n.signal(Ok(()));
            }
            return false;
        }

        ent.remove();
        self.count_flush(cause);

        if let Err(sid) = self.ring.push(sid) {
            self.abort_queued(sid);
            return false;
        }
        true
    }

    /// Timer expiry: flush if the block still owns this slice.
    pub fn on_timeout(&self, key: ExpireKey) {
        self.obid.with_entry(&key.block, |ent| {
            match ent.get() {
                Some(oe) if oe.slice == key.slice => {}
                _ => return,
            }
            self.push_to_flush_locked(ent, key.slice, FlushCause::Timer, None);
        });
    }

    /// Flush whatever slice the block currently owns.
    pub fn flush_block(&self, block: &BlockKey, notify: Option<Arc<DoneNotify>>) -> bool {
        self.obid.with_entry(block, |ent| {
            let sid = match ent.get() {
                Some(oe) if oe.slice != SLICE_NONE => oe.slice,
                _ => return false,
            };
            self.push_to_flush_locked(ent, sid, FlushCause::Explicit, notify)
        })
    }

    /// Flush every merging slice of an object; the returned notifiers
    /// complete when the flushed slices have been dispatched.
    pub fn flush_object(&self, oid: u64) -> Vec<Arc<DoneNotify>> {
        let mut waiters = vec![];
        for block in self.obid.blocks_of(oid) {
            let notify = DoneNotify::new();
            if self.flush_block(&block, Some(Arc::clone(&notify))) {
                waiters.push(notify);
            }
        }
        waiters
    }

    /// Flush everything (shutdown path).
    pub fn flush_all(&self) -> Vec<Arc<DoneNotify>> {
        let mut waiters = vec![];
        for block in self.obid.all_blocks() {
            let notify = DoneNotify::new();
            if self.flush_block(&block, Some(Arc::clone(&notify))) {
                waiters.push(notify);
            }
        }
        waiters
    }

    // a slice stranded between ring and dispatch (shutdown race)
    fn abort_queued(&self, sid: SliceId) {
        if let Some(mut entry) = self.arena.take(sid) {
            let n = entry.notify.take();
            self.arena.release(entry);
            if let Some(n) = n {
                n.signal(Err(OpError::Io("combine ring stopped".to_owned())));
            }
        }
    }

    fn count_flush(&self, cause: FlushCause) {
        let c = match cause {
            FlushCause::Timer => &self.stats.flushed_by_timer,
            FlushCause::Size => &self.stats.flushed_by_size,
            FlushCause::Space => &self.stats.flushed_by_space,
            FlushCause::Adjacency => &self.stats.flushed_by_adjacency,
            FlushCause::Overflow => &self.stats.flushed_by_overflow,
            FlushCause::Explicit => &self.stats.flushed_explicit,
        };
        c.fetch_add(1, Ordering::AcqRel);
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// Spawn the drainer: a single worker moving queued slices from the ring
/// into the data-thread pool. Returns the pool handle; `join` it after
/// shutting the ring down.
pub fn start_drainer(core: Arc<CombineCore>, pool: Arc<DataThreadPool>) -> ThreadPool {
    let tp = ThreadPool::with_name("combine-drainer".to_owned(), 1);
    tp.execute(move || {
        while let Some(sid) = core.ring.pop() {
            dispatch_slice(&core, &pool, sid);
        }
    });
    tp
}

fn dispatch_slice(core: &CombineCore, pool: &DataThreadPool, sid: SliceId) {
    let Some(mut entry) = core.arena.take(sid) else {
        return;
    };
    entry.stage = SliceStage::Dispatching;
    let bs_key = entry.bs_key;
    let op = DataOperation {
        kind: OpKind::SliceWrite,
        source: OpSource::MasterService,
        bs_key,
        slice: Some(entry),
        notify: None,
    };
    // push reclaims the payload itself if the pool is already stopped
    let _ = pool.push(op);
}
