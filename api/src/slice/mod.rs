//!
//! In-flight coalesced slices.
//!
//! A [`SliceEntry`] owns a block-sized buffer from the slab and walks the
//! `MERGING → QUEUED → DISPATCHING → DONE` state machine. While `MERGING`
//! it is owned by its OBID shard; pushing to flush transfers it to the
//! combine ring, dispatch to the data-thread queue. Cross-references are
//! stable arena ids, never owning pointers.
//!


use crate::{
    common::{BlockSliceKey, BLOCK_SIZE},
    data_thread::DoneNotify,
};
use blockwise_core::{now_ms, Arena, BufferSlab, OpError, OpResult, SlotId, TimerId, TIMER_NONE};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

pub type SliceId = SlotId;

pub const SLICE_NONE: SliceId = 0;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SliceStage {
    Merging,
    Queued,
    Dispatching,
    Done,
}

pub struct SliceEntry {
    pub stage: SliceStage,
    /// Current extent; `slice.length` grows with every merge.
    pub bs_key: BlockSliceKey,
    pub buff: Box<[u8]>,
    /// Number of distinct writes folded in.
    pub merged_slices: u32,
    pub start_time_ms: i64,
    pub timer: TimerId,
    /// The owning writer's current-slice cell, CAS-cleared at flush.
    pub otid_slice: Arc<AtomicU64>,
    /// Armed by an explicit flush that wants to observe completion.
    pub notify: Option<Arc<DoneNotify>>,
}

impl SliceEntry {
    #[inline(always)]
    pub fn length(&self) -> u32 {
        self.bs_key.slice.length
    }

    /// Unused block space behind the slice extent; negative for a
    /// malformed extent.
    #[inline(always)]
    pub fn trailing_space(&self) -> i64 {
        BLOCK_SIZE as i64 - (self.bs_key.slice.offset as i64 + self.bs_key.slice.length as i64)
    }

    /// Append a successive payload and account the merge.
    pub fn absorb(&mut self, buf: &[u8]) {
        let at = self.bs_key.slice.length as usize;
        self.buff[at..at + buf.len()].copy_from_slice(buf);
        self.bs_key.slice.length += buf.len() as u32;
        self.merged_slices += 1;
    }

    /// The coalesced payload accumulated so far.
    #[inline(always)]
    pub fn payload(&self) -> &[u8] {
        &self.buff[..self.bs_key.slice.length as usize]
    }

    /// Drop the claim on the writer's current-slice cell if it still points
    /// at this slice.
    pub fn clear_writer_link(&self, my_id: SliceId) {
        let _ = self.otid_slice.compare_exchange(
            my_id,
            SLICE_NONE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// Slice slots plus the buffer slab behind them.
pub struct SliceArena {
    slots: Arena<SliceEntry>,
    buffers: Arc<BufferSlab>,
}

impl SliceArena {
    pub fn new(capacity: usize, buffers: Arc<BufferSlab>) -> Self {
        Self {
            slots: Arena::new(capacity),
            buffers,
        }
    }

    /// Open a fresh `MERGING` slice seeded with `buf`.
    pub fn create(
        &self,
        bs_key: BlockSliceKey,
        buf: &[u8],
        otid_slice: Arc<AtomicU64>,
    ) -> OpResult<SliceId> {
        let mut buffer = self.buffers.acquire()?;
        buffer[..buf.len()].copy_from_slice(buf);

        let entry = SliceEntry {
            stage: SliceStage::Merging,
            bs_key,
            buff: buffer,
            merged_slices: 1,
            start_time_ms: now_ms(),
            timer: TIMER_NONE,
            otid_slice,
            notify: None,
        };
        match self.slots.alloc(entry) {
            Ok(id) => Ok(id),
            Err(entry) => {
                self.buffers.release(entry.buff);
                Err(OpError::NoMemory)
            }
        }
    }

    #[inline(always)]
    pub fn with<R>(&self, id: SliceId, f: impl FnOnce(&mut SliceEntry) -> R) -> Option<R> {
        self.slots.with(id, f)
    }

    #[inline(always)]
    pub fn take(&self, id: SliceId) -> Option<SliceEntry> {
        self.slots.take(id)
    }

    /// Retire a slice that has left the arena, returning its buffer to the
    /// slab.
    pub fn release(&self, entry: SliceEntry) {
        self.buffers.release(entry.buff);
    }

    #[inline(always)]
    pub fn in_use(&self) -> usize {
        self.slots.in_use()
    }
}
