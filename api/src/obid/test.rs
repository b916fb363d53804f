//!
//! # Test Cases
//!

use super::*;
use crate::common::WriteCombineConfig;

fn key(oid: u64, offset: u64) -> BlockKey {
    BlockKey { oid, offset }
}

#[test]
fn t_insert_remove() {
    let idx = ObidIndex::new(&WriteCombineConfig::default());

    let k = key(1, 0);
    idx.with_entry(&k, |ent| {
        assert!(ent.get().is_none());
        assert!(ent.insert(ObidEntry { slice: 7 }).is_ok());
    });
    assert_eq!(idx.len(), 1);

    idx.with_entry(&k, |ent| {
        assert_eq!(ent.get().unwrap().slice, 7);
        assert!(ent.remove().is_some());
    });
    assert!(idx.is_empty());
}

#[test]
fn t_live_slice_not_displaced() {
    let idx = ObidIndex::new(&WriteCombineConfig::default());

    let k = key(1, 0);
    idx.with_entry(&k, |ent| {
        assert!(ent.insert(ObidEntry { slice: 1 }).is_ok());
        assert!(ent.insert(ObidEntry { slice: 2 }).is_err());
        assert_eq!(ent.get().unwrap().slice, 1);
    });
}

#[test]
fn t_blocks_of() {
    let idx = ObidIndex::new(&WriteCombineConfig::default());

    for (oid, off) in [(1, 0), (1, 4 << 20), (2, 0)] {
        idx.with_entry(&key(oid, off), |ent| {
            ent.insert(ObidEntry { slice: 9 }).unwrap();
        });
    }

    let mut of1 = idx.blocks_of(1);
    of1.sort_by_key(|k| k.offset);
    assert_eq!(of1.len(), 2);
    assert_eq!(of1[0].offset, 0);
    assert_eq!(of1[1].offset, 4 << 20);

    assert_eq!(idx.blocks_of(3).len(), 0);
    assert_eq!(idx.all_blocks().len(), 3);
}

#[test]
fn t_reclaim_guard() {
    let e = ObidEntry { slice: 5 };
    assert!(!e.accept_reclaim());
    let e = ObidEntry { slice: SLICE_NONE };
    assert!(e.accept_reclaim());
}
