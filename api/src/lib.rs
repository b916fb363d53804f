#![doc = include_str!("../README.md")]
#![deny(warnings)]
#![cfg_attr(test, allow(warnings))]

pub mod binlog;
pub mod combine;
pub mod common;
pub mod context;
pub mod data_thread;
pub mod obid;
pub mod otid;
pub mod slice;

pub use binlog::{BinlogReader, BinlogRecord, BinlogSet, RecordType};
pub use combine::{CombineStats, StatsSnapshot};
pub use common::{
    ApiConfig, BinlogConfig, BlockKey, BlockSliceKey, DataThreadConfig, OperationContext,
    SliceRange, WriteCombineConfig, BLOCK_SIZE,
};
pub use context::ApiContext;
pub use data_thread::{
    DataGroup, DataGroupArray, DataOperation, DoneNotify, MemStorage, OpKind, OpSource,
    SliceStorage,
};
pub use slice::{SliceEntry, SliceStage};

pub use blockwise_core::{OpError, OpResult};
