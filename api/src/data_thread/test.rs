//!
//! # Test Cases
//!

use super::*;
use crate::{
    binlog::{self, BinlogSet},
    common::{BinlogConfig, BlockSliceKey, SliceRange, BLOCK_SIZE},
    slice::SliceArena,
};
use blockwise_core::BufferSlab;
use std::sync::atomic::AtomicU64 as StdAtomicU64;

fn tmp_dir(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "blockwise_dt_{}_{}_{}",
        tag,
        std::process::id(),
        rand::random::<u64>()
    ))
}

struct Rig {
    pool: DataThreadPool,
    backend: Arc<MemStorage>,
    groups: Arc<DataGroupArray>,
    binlogs: Arc<BinlogSet>,
    arena: Arc<SliceArena>,
    stats: Arc<crate::combine::CombineStats>,
    dir: std::path::PathBuf,
}

fn rig(tag: &str, tweak: impl FnOnce(&mut DataThreadConfig)) -> Rig {
    let dir = tmp_dir(tag);
    let mut cfg = DataThreadConfig {
        retry_interval_ms: 1,
        ..DataThreadConfig::default()
    };
    tweak(&mut cfg);

    let stats = Arc::new(crate::combine::CombineStats::default());
    let backend = Arc::new(MemStorage::default());
    let groups = Arc::new(DataGroupArray::new(2));
    let binlogs = Arc::new(
        BinlogSet::new(
            &BinlogConfig {
                base_dir: dir.clone(),
                segment_size: 64 << 20,
            },
            2,
            Arc::clone(&stats),
        )
        .unwrap(),
    );
    let arena = Arc::new(SliceArena::new(
        4,
        Arc::new(BufferSlab::new(BLOCK_SIZE, 4, 2)),
    ));
    let pool = DataThreadPool::new(
        &cfg,
        Arc::clone(&backend) as Arc<dyn SliceStorage>,
        Arc::clone(&groups),
        Arc::clone(&binlogs),
        Arc::clone(&arena),
        Arc::clone(&stats),
    );
    Rig {
        pool,
        backend,
        groups,
        binlogs,
        arena,
        stats,
        dir,
    }
}

fn bs_key(oid: u64, length: u32) -> BlockSliceKey {
    BlockSliceKey {
        block: BlockKey { oid, offset: 0 },
        slice: SliceRange { offset: 0, length },
    }
}

fn read_op(oid: u64, notify: Arc<DoneNotify>) -> DataOperation {
    DataOperation {
        kind: OpKind::SliceRead,
        source: OpSource::MasterService,
        bs_key: bs_key(oid, 1),
        slice: None,
        notify: Some(notify),
    }
}

#[test]
fn t_execute_and_notify() {
    let r = rig("exec", |_| {});

    let n = DoneNotify::new();
    r.pool.push(read_op(1, Arc::clone(&n))).unwrap();
    assert_eq!(n.wait(), Ok(()));

    let journal = r.backend.journal();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].0, OpKind::SliceRead);

    // reads produce no binlog record and no version bump
    let g = r.groups.group_for(&bs_key(1, 1).block);
    assert_eq!(g.data_version(), 0);

    r.pool.shutdown();
    r.binlogs.shutdown();
    let _ = std::fs::remove_dir_all(&r.dir);
}

#[test]
fn t_slice_write_logs_binlog() {
    let r = rig("binlog", |_| {});

    let cell = Arc::new(StdAtomicU64::new(0));
    let sid = r
        .arena
        .create(bs_key(1, 8192), &[5u8; 8192], cell)
        .unwrap();
    let mut entry = r.arena.take(sid).unwrap();
    entry.stage = crate::slice::SliceStage::Dispatching;
    let n = DoneNotify::new();
    entry.notify = Some(Arc::clone(&n));

    let op = DataOperation {
        kind: OpKind::SliceWrite,
        source: OpSource::MasterService,
        bs_key: entry.bs_key,
        slice: Some(entry),
        notify: None,
    };
    r.pool.push(op).unwrap();
    assert_eq!(n.wait(), Ok(()));

    // payload landed in the block image
    let img = r.backend.block_image(&bs_key(1, 8192).block).unwrap();
    assert_eq!(&img[..8192], &[5u8; 8192][..]);
    assert_eq!(r.arena.in_use(), 0);

    // version advanced and the record hit the group's binlog
    let g = r.groups.group_for(&bs_key(1, 8192).block);
    assert_eq!(g.data_version(), 1);

    r.pool.shutdown();
    r.binlogs.shutdown();

    let seg = binlog::segment_path(&r.binlogs.group_dir(g.id), 0);
    let rec = binlog::last_record_in(&seg).unwrap().unwrap();
    assert_eq!(rec.data_version, 1);
    assert_eq!(rec.op_type, binlog::RecordType::WriteSlice);
    assert_eq!(rec.block.oid, 1);
    assert_eq!(rec.slice.unwrap().length, 8192);

    let _ = std::fs::remove_dir_all(&r.dir);
}

#[test]
fn t_transient_errors_retried() {
    let r = rig("retry", |cfg| {
        cfg.retry_limit = 3;
    });

    r.backend.inject_failures(2);
    let n = DoneNotify::new();
    r.pool.push(read_op(1, Arc::clone(&n))).unwrap();
    assert_eq!(n.wait(), Ok(()));

    r.pool.shutdown();
    r.binlogs.shutdown();
    let _ = std::fs::remove_dir_all(&r.dir);
}

#[test]
fn t_retries_exhausted_surface() {
    let r = rig("exhaust", |cfg| {
        cfg.retry_limit = 1;
    });

    r.backend.inject_failures(10);
    let n = DoneNotify::new();
    r.pool.push(read_op(1, Arc::clone(&n))).unwrap();
    assert!(matches!(n.wait(), Err(OpError::Io(_))));
    assert_eq!(r.stats.snapshot().storage_errors, 1);

    r.pool.shutdown();
    r.binlogs.shutdown();
    let _ = std::fs::remove_dir_all(&r.dir);
}

#[test]
fn t_master_slave_split() {
    let r = rig("split", |_| {});

    let block = bs_key(1, 1).block;
    let g = r.groups.group_for(&block);
    assert!(g.is_master());

    g.set_master(false);
    let n = DoneNotify::new();
    r.pool.push(read_op(1, Arc::clone(&n))).unwrap();
    assert_eq!(n.wait(), Ok(()));
    g.set_master(true);

    r.pool.shutdown();
    r.binlogs.shutdown();
    let _ = std::fs::remove_dir_all(&r.dir);
}

#[test]
fn t_data_version_cas() {
    let g = DataGroup::new(0);
    assert_eq!(g.alloc_version(), 1);
    assert_eq!(g.alloc_version(), 2);

    assert!(g.set_data_version(10));
    assert!(!g.set_data_version(10));
    assert_eq!(g.data_version(), 10);
    assert_eq!(g.alloc_version(), 11);
}

#[test]
fn t_push_after_shutdown_reclaims() {
    let r = rig("stopped", |_| {});
    r.pool.shutdown();

    let n = DoneNotify::new();
    let err = r.pool.push(read_op(1, Arc::clone(&n)));
    assert!(matches!(err, Err(OpError::Io(_))));
    assert!(matches!(n.wait(), Err(OpError::Io(_))));

    r.binlogs.shutdown();
    let _ = std::fs::remove_dir_all(&r.dir);
}
