//!
//! # Test Cases
//!

use super::*;
use crate::{
    binlog::{replay_file, segment_path},
    common::{BlockKey, WriteCombineConfig},
    data_thread::MemStorage,
    data_thread::OpKind,
};
use ruc::*;
use std::path::PathBuf;

fn tmp_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "blockwise_ctx_{}_{}_{}",
        tag,
        std::process::id(),
        rand::random::<u64>()
    ))
}

fn test_ctx(
    tag: &str,
    tweak: impl FnOnce(&mut ApiConfig),
) -> (ApiContext, Arc<MemStorage>, PathBuf) {
    let dir = tmp_dir(tag);
    let mut cfg = ApiConfig {
        data_group_count: 2,
        slice_slab_capacity: 8,
        ..ApiConfig::default()
    };
    cfg.binlog.base_dir = dir.clone();
    cfg.write_combine = WriteCombineConfig {
        otid_shard_count: 8,
        obid_shard_count: 8,
        ..WriteCombineConfig::default()
    };
    tweak(&mut cfg);

    let backend = Arc::new(MemStorage::default());
    let ctx = pnk!(ApiContext::new(cfg, Arc::clone(&backend) as _));
    (ctx, backend, dir)
}

fn wait_until(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if f() {
            return true;
        }
        sleep_ms!(10);
    }
    false
}

fn w(oid: u64, soff: u32, len: u32) -> OperationContext {
    OperationContext::slice_write(oid, 0, soff, len, 7)
}

#[test]
fn t_pure_append_merges_and_times_out() {
    let (ctx, backend, dir) = test_ctx("append", |cfg| {
        // a window wide enough that the test thread never races the timer
        cfg.write_combine.min_wait_time_ms = 50;
    });

    assert_eq!(ctx.write(&w(1, 0, 4096), &vec![1u8; 4096]), Ok(false));
    assert_eq!(ctx.write(&w(1, 4096, 4096), &vec![2u8; 4096]), Ok(true));
    assert_eq!(ctx.write(&w(1, 8192, 4096), &vec![3u8; 4096]), Ok(true));

    // one coalesced 8 KiB dispatch arrives after the coalescing window
    assert!(wait_until(|| backend
        .journal()
        .iter()
        .any(|(k, bs)| *k == OpKind::SliceWrite && bs.slice.length == 8192)));

    let img = backend.block_image(&BlockKey { oid: 1, offset: 0 }).unwrap();
    assert_eq!(&img[4096..8192], &[2u8; 4096][..]);
    assert_eq!(&img[8192..12288], &[3u8; 4096][..]);

    let snap = ctx.stats();
    assert_eq!(snap.total_writes, 3);
    assert_eq!(snap.combined_writes, 2);
    assert_eq!(snap.flushed_by_timer, 1);
    assert!(ctx.core.obid.is_empty());

    ctx.shutdown();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn t_nonadjacent_break_then_flush() {
    let (ctx, backend, dir) = test_ctx("gap", |cfg| {
        // a long window so only the explicit flush dispatches
        cfg.write_combine.min_wait_time_ms = 2000;
        cfg.write_combine.max_wait_time_ms = 10_000;
    });

    assert_eq!(ctx.write(&w(1, 0, 4096), &vec![1u8; 4096]), Ok(false));
    assert_eq!(ctx.write(&w(1, 4096, 4096), &vec![2u8; 4096]), Ok(true));
    // the gap breaks the run; the slice stays resident
    assert_eq!(ctx.write(&w(1, 65536, 4096), &vec![3u8; 4096]), Ok(false));
    assert_eq!(ctx.core.obid.blocks_of(1).len(), 1);

    pnk!(ctx.flush(1));
    assert!(ctx.core.obid.is_empty());
    let journal = backend.journal();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].1.slice.length, 4096);
    assert_eq!(journal[0].1.slice.offset, 4096);

    ctx.shutdown();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn t_deadline_flush_then_fresh_slice() {
    let (ctx, backend, dir) = test_ctx("deadline", |cfg| {
        cfg.write_combine.min_wait_time_ms = 10;
        cfg.write_combine.max_wait_time_ms = 100;
    });

    assert_eq!(ctx.write(&w(1, 0, 4096), &vec![1u8; 4096]), Ok(false));
    assert_eq!(ctx.write(&w(1, 4096, 4096), &vec![2u8; 4096]), Ok(true));

    // silence beyond the deadline flushes by timer
    assert!(wait_until(|| ctx.core.obid.is_empty()));
    assert!(wait_until(|| !backend.journal().is_empty()));
    assert!(ctx.stats().flushed_by_timer >= 1);

    // the writer cell was cleared, so the next successive write opens a
    // fresh slice
    assert_eq!(ctx.write(&w(1, 8192, 4096), &vec![4u8; 4096]), Ok(true));
    assert_eq!(ctx.core.obid.blocks_of(1).len(), 1);

    ctx.shutdown();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn t_flush_waits_for_dispatch() {
    let (ctx, backend, dir) = test_ctx("flushwait", |cfg| {
        cfg.write_combine.min_wait_time_ms = 5000;
        cfg.write_combine.max_wait_time_ms = 20_000;
    });

    assert_eq!(ctx.write(&w(1, 0, 4096), &vec![1u8; 4096]), Ok(false));
    assert_eq!(ctx.write(&w(1, 4096, 8192), &vec![2u8; 8192]), Ok(true));

    pnk!(ctx.flush(1));
    // the payload is durable once flush returns
    let journal = backend.journal();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].1.slice.length, 8192);

    // nothing left, flushing again is a no-op
    pnk!(ctx.flush(1));
    assert_eq!(backend.journal().len(), 1);

    ctx.shutdown();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn t_close_evicts_writers() {
    let (ctx, _backend, dir) = test_ctx("close", |cfg| {
        cfg.write_combine.min_wait_time_ms = 5000;
        cfg.write_combine.max_wait_time_ms = 20_000;
    });

    assert_eq!(ctx.write(&w(1, 0, 4096), &vec![1u8; 4096]), Ok(false));
    assert_eq!(ctx.write(&w(1, 4096, 4096), &vec![2u8; 4096]), Ok(true));
    assert_eq!(ctx.write(&w(2, 0, 4096), &vec![1u8; 4096]), Ok(false));
    assert_eq!(ctx.otid.len(), 2);

    pnk!(ctx.close(1));
    assert_eq!(ctx.otid.len(), 1);
    assert!(ctx.core.obid.is_empty());

    pnk!(ctx.close(2));
    assert_eq!(ctx.otid.len(), 0);

    ctx.shutdown();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn t_binlog_versions_monotonic() {
    let (ctx, _backend, dir) = test_ctx("versions", |cfg| {
        cfg.write_combine.min_wait_time_ms = 5000;
        cfg.write_combine.max_wait_time_ms = 20_000;
    });

    // several objects, several coalesced dispatches
    for oid in 1..=6u64 {
        assert_eq!(ctx.write(&w(oid, 0, 4096), &vec![1u8; 4096]), Ok(false));
        assert_eq!(ctx.write(&w(oid, 4096, 4096), &vec![2u8; 4096]), Ok(true));
        pnk!(ctx.flush(oid));
    }

    let group_count = ctx.data_groups().count() as u32;
    ctx.shutdown();

    let mut total = 0;
    for gid in 0..group_count {
        let seg = segment_path(&ctx.binlogs().group_dir(gid), 0);
        if !seg.exists() {
            continue;
        }
        let mut last = 0;
        total += pnk!(replay_file(&seg, |rec| {
            assert!(rec.data_version > last);
            last = rec.data_version;
        }));
    }
    assert_eq!(total, 6);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn t_combine_disabled() {
    let (ctx, _backend, dir) = test_ctx("disabled", |cfg| {
        cfg.write_combine.enabled = false;
    });

    assert_eq!(ctx.write(&w(1, 0, 4096), &vec![1u8; 4096]), Ok(false));
    assert_eq!(ctx.write(&w(1, 4096, 4096), &vec![2u8; 4096]), Ok(false));
    assert!(ctx.core.obid.is_empty());
    assert_eq!(ctx.otid.len(), 0);

    ctx.shutdown();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn t_invalid_buffer_rejected() {
    let (ctx, _backend, dir) = test_ctx("invalid", |_| {});

    assert!(matches!(
        ctx.write(&w(1, 0, 4096), &[0u8; 100]),
        Err(OpError::InvalidArg(_))
    ));
    assert!(matches!(
        ctx.write(&w(1, 0, 0), &[]),
        Err(OpError::InvalidArg(_))
    ));

    ctx.shutdown();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn t_shutdown_flushes_and_is_idempotent() {
    let (ctx, backend, dir) = test_ctx("shutdown", |cfg| {
        cfg.write_combine.min_wait_time_ms = 5000;
        cfg.write_combine.max_wait_time_ms = 20_000;
    });

    assert_eq!(ctx.write(&w(1, 0, 4096), &vec![1u8; 4096]), Ok(false));
    assert_eq!(ctx.write(&w(1, 4096, 4096), &vec![2u8; 4096]), Ok(true));

    ctx.shutdown();
    ctx.shutdown();

    // the pending slice went out during shutdown
    let journal = backend.journal();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].0, OpKind::SliceWrite);

    // late writes degrade to the direct path
    assert_eq!(ctx.write(&w(1, 8192, 4096), &vec![3u8; 4096]), Ok(false));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn t_slab_exhaustion_degrades() {
    let (ctx, _backend, dir) = test_ctx("nomem", |cfg| {
        cfg.slice_slab_capacity = 1;
        cfg.write_combine.min_wait_time_ms = 5000;
        cfg.write_combine.max_wait_time_ms = 20_000;
    });

    // first writer owns the only buffer
    assert_eq!(ctx.write(&w(1, 0, 4096), &vec![1u8; 4096]), Ok(false));
    assert_eq!(ctx.write(&w(1, 4096, 4096), &vec![2u8; 4096]), Ok(true));

    // the second writer cannot get a slice and passes through
    assert_eq!(ctx.write(&w(2, 0, 4096), &vec![1u8; 4096]), Ok(false));
    assert_eq!(ctx.write(&w(2, 4096, 4096), &vec![2u8; 4096]), Ok(false));
    assert!(ctx.stats().alloc_failures >= 1);

    ctx.shutdown();
    let _ = std::fs::remove_dir_all(&dir);
}
