//!
//! Per-block data-thread pool.
//!
//! Operations are hash-partitioned over disjoint rings, one worker per
//! ring, so everything destined for a given block runs on a single thread
//! in arrival order. The pool is split into master and slave sub-pools;
//! the data group's `is_master` flag decides which one serves a block, so
//! replicated writes and forwarded reads never share a ring.
//!

#[cfg(test)]
mod test;

use crate::{
    binlog::BinlogSet,
    combine::CombineStats,
    common::{BlockKey, BlockSliceKey, DataThreadConfig},
    slice::{SliceArena, SliceEntry, SliceStage},
};
use blockwise_core::{CondQueue, OpError, OpResult};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    SliceRead,
    SliceWrite,
    SliceAllocate,
    SliceDelete,
    BlockDelete,
}

impl OpKind {
    pub fn caption(&self) -> &'static str {
        match self {
            Self::SliceRead => "slice read",
            Self::SliceWrite => "slice write",
            Self::SliceAllocate => "slice allocate",
            Self::SliceDelete => "slice delete",
            Self::BlockDelete => "block delete",
        }
    }

    /// Updates are logged to the replica binlog; reads are not.
    #[inline(always)]
    pub fn is_update(&self) -> bool {
        !matches!(self, Self::SliceRead)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpSource {
    MasterService,
    SlaveReplica,
    SlaveRecovery,
}

/// One unit of work for a data thread.
pub struct DataOperation {
    pub kind: OpKind,
    pub source: OpSource,
    pub bs_key: BlockSliceKey,
    /// Owned coalesced payload for dispatched slice writes.
    pub slice: Option<SliceEntry>,
    /// Completion hook for callers with nothing in `slice`.
    pub notify: Option<Arc<DoneNotify>>,
}

/// The opaque storage tier the pool dispatches into.
pub trait SliceStorage: Send + Sync + 'static {
    fn execute(&self, op: &DataOperation) -> OpResult<()>;
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// Completion signal: the worker flags done under the pair's lock, the
/// dispatcher waits on the condvar.
pub struct DoneNotify {
    state: Mutex<Option<OpResult<()>>>,
    cond: Condvar,
}

impl DoneNotify {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    pub fn signal(&self, result: OpResult<()>) {
        let mut st = self.state.lock();
        *st = Some(result);
        drop(st);
        self.cond.notify_all();
    }

    pub fn wait(&self) -> OpResult<()> {
        let mut st = self.state.lock();
        loop {
            if let Some(r) = st.take() {
                return r;
            }
            self.cond.wait(&mut st);
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// Per-data-group replica state.
pub struct DataGroup {
    pub id: u32,
    is_master: AtomicBool,
    data_version: AtomicU64,
}

impl DataGroup {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            is_master: AtomicBool::new(true),
            data_version: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::Relaxed)
    }

    pub fn set_master(&self, yes: bool) {
        self.is_master.store(yes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn data_version(&self) -> u64 {
        self.data_version.load(Ordering::Acquire)
    }

    /// Claim the next data version for a durable update.
    #[inline(always)]
    pub fn alloc_version(&self) -> u64 {
        self.data_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// CAS the version to an externally decided value (replica apply,
    /// startup recovery). Returns whether anything changed.
    pub fn set_data_version(&self, new_version: u64) -> bool {
        loop {
            let old = self.data_version.load(Ordering::Acquire);
            if old == new_version {
                return false;
            }
            if self
                .data_version
                .compare_exchange(old, new_version, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

pub struct DataGroupArray {
    groups: Vec<Arc<DataGroup>>,
}

impl DataGroupArray {
    pub fn new(count: usize) -> Self {
        Self {
            groups: (0..count.max(1) as u32).map(|i| Arc::new(DataGroup::new(i))).collect(),
        }
    }

    #[inline(always)]
    pub fn group_for(&self, block: &BlockKey) -> Arc<DataGroup> {
        Arc::clone(&self.groups[(block.hash_code() as usize) % self.groups.len()])
    }

    pub fn get(&self, id: u32) -> Option<Arc<DataGroup>> {
        self.groups.get(id as usize).map(Arc::clone)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DataGroup>> {
        self.groups.iter()
    }

    pub fn count(&self) -> usize {
        self.groups.len()
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

pub struct DataThreadPool {
    master: Vec<Arc<CondQueue<DataOperation>>>,
    slave: Vec<Arc<CondQueue<DataOperation>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    groups: Arc<DataGroupArray>,
    arena: Arc<SliceArena>,
}

impl DataThreadPool {
    pub fn new(
        cfg: &DataThreadConfig,
        backend: Arc<dyn SliceStorage>,
        groups: Arc<DataGroupArray>,
        binlogs: Arc<BinlogSet>,
        arena: Arc<SliceArena>,
        stats: Arc<CombineStats>,
    ) -> Self {
        let mut handles = vec![];
        let spawn_ring = |name: String, handles: &mut Vec<thread::JoinHandle<()>>| {
            let queue = Arc::new(CondQueue::new(cfg.queue_depth));
            let worker = Worker {
                queue: Arc::clone(&queue),
                backend: Arc::clone(&backend),
                groups: Arc::clone(&groups),
                binlogs: Arc::clone(&binlogs),
                arena: Arc::clone(&arena),
                stats: Arc::clone(&stats),
                retry_limit: cfg.retry_limit,
                retry_interval_ms: cfg.retry_interval_ms,
            };
            if let Ok(h) = thread::Builder::new().name(name).spawn(move || worker.run()) {
                handles.push(h);
            }
            queue
        };

        let master = (0..cfg.data_threads_master.max(1))
            .map(|i| spawn_ring(format!("data-master-{}", i), &mut handles))
            .collect();
        let slave = (0..cfg.data_threads_slave.max(1))
            .map(|i| spawn_ring(format!("data-slave-{}", i), &mut handles))
            .collect();

        Self {
            master,
            slave,
            handles: Mutex::new(handles),
            groups,
            arena,
        }
    }

    /// Route an operation onto its block's ring.
    pub fn push(&self, op: DataOperation) -> OpResult<()> {
        let group = self.groups.group_for(&op.bs_key.block);
        let rings = if group.is_master() {
            &self.master
        } else {
            &self.slave
        };
        let idx = (op.bs_key.block.hash_code() as usize) % rings.len();
        match rings[idx].push(op) {
            Ok(()) => Ok(()),
            Err(op) => {
                self.discard(op);
                Err(OpError::Io("data thread pool stopped".to_owned()))
            }
        }
    }

    // reclaim whatever a refused operation carried
    fn discard(&self, mut op: DataOperation) {
        let err = Err(OpError::Io("data thread pool stopped".to_owned()));
        if let Some(mut entry) = op.slice.take() {
            let n = entry.notify.take();
            self.arena.release(entry);
            if let Some(n) = n {
                n.signal(err);
            }
        } else if let Some(n) = op.notify.take() {
            n.signal(err);
        }
    }

    /// Stop every ring and join the workers; queued operations are drained
    /// first.
    pub fn shutdown(&self) {
        for q in self.master.iter().chain(self.slave.iter()) {
            q.shutdown();
        }
        for h in self.handles.lock().drain(..) {
            let _ = h.join();
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

struct Worker {
    queue: Arc<CondQueue<DataOperation>>,
    backend: Arc<dyn SliceStorage>,
    groups: Arc<DataGroupArray>,
    binlogs: Arc<BinlogSet>,
    arena: Arc<SliceArena>,
    stats: Arc<CombineStats>,
    retry_limit: u32,
    retry_interval_ms: u64,
}

impl Worker {
    fn run(&self) {
        while let Some(mut op) = self.queue.pop() {
            let result = self.execute_with_retry(&op);

            if result.is_ok() {
                if op.kind.is_update() {
                    let group = self.groups.group_for(&op.bs_key.block);
                    let version = group.alloc_version();
                    self.binlogs.append(group.id, version, op.kind, &op.bs_key);
                }
                self.stats.dispatched_ok.fetch_add(1, Ordering::AcqRel);
            } else {
                self.stats.storage_errors.fetch_add(1, Ordering::AcqRel);
            }

            if let Some(mut entry) = op.slice.take() {
                entry.stage = SliceStage::Done;
                let notify = entry.notify.take();
                self.arena.release(entry);
                if let Some(n) = notify {
                    n.signal(result);
                }
            } else if let Some(n) = op.notify.take() {
                n.signal(result);
            }
        }
    }

    // transient storage errors are retried per the configured policy
    fn execute_with_retry(&self, op: &DataOperation) -> OpResult<()> {
        let mut result = self.backend.execute(op);
        let mut attempt = 0;
        while let Err(OpError::Io(_)) = &result {
            if attempt >= self.retry_limit {
                break;
            }
            attempt += 1;
            thread::sleep(Duration::from_millis(self.retry_interval_ms));
            result = self.backend.execute(op);
        }
        result.map_err(|e| match e {
            OpError::Io(msg) => OpError::Io(format!("{}: {}", op.kind.caption(), msg)),
            e => e,
        })
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// In-memory storage tier: applies slice writes to per-block images and
/// keeps an operation journal. Supports transient-failure injection.
#[derive(Default)]
pub struct MemStorage {
    blocks: Mutex<HashMap<BlockKey, Vec<u8>>>,
    journal: Mutex<Vec<(OpKind, BlockSliceKey)>>,
    fail_times: AtomicU32,
}

impl MemStorage {
    /// Make the next `n` executions fail with a transient error.
    pub fn inject_failures(&self, n: u32) {
        self.fail_times.store(n, Ordering::Release);
    }

    pub fn journal(&self) -> Vec<(OpKind, BlockSliceKey)> {
        self.journal.lock().clone()
    }

    /// The bytes currently stored for a block.
    pub fn block_image(&self, block: &BlockKey) -> Option<Vec<u8>> {
        self.blocks.lock().get(block).cloned()
    }
}

impl SliceStorage for MemStorage {
    fn execute(&self, op: &DataOperation) -> OpResult<()> {
        loop {
            let left = self.fail_times.load(Ordering::Acquire);
            if left == 0 {
                break;
            }
            if self
                .fail_times
                .compare_exchange(left, left - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Err(OpError::Io("injected transient failure".to_owned()));
            }
        }

        if let (OpKind::SliceWrite, Some(entry)) = (op.kind, op.slice.as_ref()) {
            let mut blocks = self.blocks.lock();
            let img = blocks
                .entry(op.bs_key.block)
                .or_insert_with(|| vec![0; crate::common::BLOCK_SIZE]);
            let at = entry.bs_key.slice.offset as usize;
            let payload = entry.payload();
            img[at..at + payload.len()].copy_from_slice(payload);
        }
        self.journal.lock().push((op.kind, op.bs_key));
        Ok(())
    }
}
