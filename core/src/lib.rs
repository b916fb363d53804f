#![doc = include_str!("../README.md")]
#![deny(warnings)]
#![cfg_attr(test, allow(warnings))]

pub mod arena;
pub mod common;
pub mod queue;
pub mod sharding;
pub mod slab;
pub mod timer;

pub use arena::{Arena, SlotId, SLOT_NONE};
pub use common::{now_ms, now_sec, OpError, OpResult, GB, KB, MB};
pub use queue::CondQueue;
pub use sharding::{EntryHandler, EntryRef, ShardedHtable, ShardedValue, ShardingConfig};
pub use slab::{slab_lookup, slab_register, slab_unregister, BufferSlab};
pub use timer::{TimerId, TimerWheel, TIMER_NONE};
