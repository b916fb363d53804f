//!
//! API context: owns every subsystem of the combine engine and exposes the
//! surface the POSIX wrapper consumes.
//!
//! `write` returns `combined = true` when the payload was absorbed and
//! will be dispatched later; `false` sends the caller down the direct
//! path. `flush` drains an object's merging slices, `close` additionally
//! evicts its writer entries.
//!

#[cfg(test)]
mod test;

use crate::{
    binlog::BinlogSet,
    combine::{start_drainer, CombineCore, ExpireKey, StatsSnapshot},
    common::{ApiConfig, OperationContext, Oid, BLOCK_SIZE},
    data_thread::{DataGroupArray, DataThreadPool, SliceStorage},
    otid::OtidIndex,
    slice::SliceArena,
};
use blockwise_core::{
    slab_register, slab_unregister, BufferSlab, OpError, OpResult, TimerWheel,
};
use parking_lot::Mutex;
use ruc::*;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use threadpool::ThreadPool;

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

static CTX_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct ApiContext {
    cfg: ApiConfig,
    core: Arc<CombineCore>,
    otid: OtidIndex,
    wheel: Arc<TimerWheel<ExpireKey>>,
    pool: Arc<DataThreadPool>,
    groups: Arc<DataGroupArray>,
    binlogs: Arc<BinlogSet>,
    drainer: Mutex<Option<ThreadPool>>,
    slab_name: String,
    down: AtomicBool,
}

impl ApiContext {
    pub fn new(cfg: ApiConfig, backend: Arc<dyn SliceStorage>) -> Result<Self> {
        let slab = Arc::new(BufferSlab::new(BLOCK_SIZE, cfg.slice_slab_capacity, 8));
        let slab_name = format!(
            "blockwise-slice-{}",
            CTX_SEQ.fetch_add(1, Ordering::AcqRel)
        );
        slab_register(&slab_name, Arc::clone(&slab)).c(d!())?;

        let arena = Arc::new(SliceArena::new(cfg.slice_slab_capacity, slab));
        let wheel = Arc::new(TimerWheel::new(
            cfg.write_combine.timer_slot_count,
            cfg.write_combine.timer_precision_ms,
        ));
        let core = Arc::new(CombineCore::new(
            cfg.write_combine.clone(),
            Arc::clone(&arena),
            Arc::clone(&wheel),
        ));
        let otid = OtidIndex::new(&cfg.write_combine);

        let stats = Arc::clone(&core.stats);
        let binlogs = Arc::new(
            BinlogSet::new(&cfg.binlog, cfg.data_group_count, Arc::clone(&stats)).c(d!())?,
        );
        let groups = Arc::new(DataGroupArray::new(cfg.data_group_count));
        for g in groups.iter() {
            g.set_data_version(binlogs.recovered_version(g.id));
        }

        let pool = Arc::new(DataThreadPool::new(
            &cfg.data_threads,
            backend,
            Arc::clone(&groups),
            Arc::clone(&binlogs),
            Arc::clone(&arena),
            stats,
        ));

        let expirer = Arc::clone(&core);
        wheel.start(move |key| expirer.on_timeout(key));

        let drainer = start_drainer(Arc::clone(&core), Arc::clone(&pool));

        Ok(Self {
            cfg,
            core,
            otid,
            wheel,
            pool,
            groups,
            binlogs,
            drainer: Mutex::new(Some(drainer)),
            slab_name,
            down: AtomicBool::new(false),
        })
    }

    /// Route one write through the combine core. `Ok(true)` means the
    /// payload was absorbed and will be dispatched later; `Ok(false)` means
    /// the caller must issue the write through the direct path itself.
    pub fn write(&self, op: &OperationContext, buf: &[u8]) -> OpResult<bool> {
        let len = op.bs_key.slice.length as usize;
        if len == 0 || len != buf.len() {
            return Err(OpError::InvalidArg(format!(
                "buffer length {} vs slice length {}",
                buf.len(),
                len
            )));
        }

        self.core.stats.total_writes.fetch_add(1, Ordering::AcqRel);
        if !self.cfg.write_combine.enabled || self.down.load(Ordering::Acquire) {
            return Ok(false);
        }

        match self.otid.insert(&self.core, op, buf) {
            Ok(combined) => {
                if combined {
                    self.core
                        .stats
                        .combined_writes
                        .fetch_add(1, Ordering::AcqRel);
                }
                Ok(combined)
            }
            // combine-layer shortfalls degrade to the direct path
            Err(OpError::Overflow | OpError::NoMemory | OpError::Exists) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drain every merging slice of the object and wait for dispatch.
    pub fn flush(&self, oid: Oid) -> OpResult<()> {
        for w in self.core.flush_object(oid) {
            w.wait()?;
        }
        Ok(())
    }

    /// Flush, then evict the object's writer entries.
    pub fn close(&self, oid: Oid) -> OpResult<()> {
        self.flush(oid)?;
        self.otid.drop_object(oid);
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    pub fn config(&self) -> &ApiConfig {
        &self.cfg
    }

    pub fn data_groups(&self) -> &Arc<DataGroupArray> {
        &self.groups
    }

    pub fn binlogs(&self) -> &Arc<BinlogSet> {
        &self.binlogs
    }

    /// Stop accepting, flush everything, drain every thread. Idempotent.
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wheel.stop();
        for w in self.core.flush_all() {
            let _ = w.wait();
        }
        self.core.ring.shutdown();
        if let Some(tp) = self.drainer.lock().take() {
            tp.join();
        }
        self.pool.shutdown();
        self.binlogs.shutdown();
        slab_unregister(&self.slab_name);
    }
}

impl Drop for ApiContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
