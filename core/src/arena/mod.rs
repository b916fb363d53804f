//!
//! Generation-checked slot arena.
//!
//! Hands out stable 64-bit ids (slot index in the high half, generation in
//! the low half) so cyclic structures can hold plain ids instead of owning
//! references. A stale id is simply a miss, never a dangling access.
//!


use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

pub type SlotId = u64;

pub const SLOT_NONE: SlotId = 0;

struct Slot<T> {
    gen: u32,
    val: Option<T>,
}

pub struct Arena<T> {
    slots: Vec<Mutex<Slot<T>>>,
    free: Mutex<Vec<u32>>,
    in_use: AtomicUsize,
}

impl<T> Arena<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity)
                .map(|_| Mutex::new(Slot { gen: 1, val: None }))
                .collect(),
            free: Mutex::new((0..capacity as u32).rev().collect()),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Place `val` into a free slot. A full arena hands the value back so
    /// the caller can reclaim whatever resources it carries.
    pub fn alloc(&self, val: T) -> Result<SlotId, T> {
        let idx = match self.free.lock().pop() {
            Some(i) => i as usize,
            None => return Err(val),
        };
        let mut slot = self.slots[idx].lock();
        slot.val = Some(val);
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Ok(((idx as u64) << 32) | slot.gen as u64)
    }

    /// Run `f` with the slot lock held. `None` for a stale or freed id.
    pub fn with<R>(&self, id: SlotId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let (idx, gen) = Self::split(id)?;
        let slot = self.slots.get(idx)?;
        let mut slot = slot.lock();
        if slot.gen != gen {
            return None;
        }
        slot.val.as_mut().map(f)
    }

    /// Move the value out, retiring the id.
    pub fn take(&self, id: SlotId) -> Option<T> {
        let (idx, gen) = Self::split(id)?;
        let slot = self.slots.get(idx)?;
        let val = {
            let mut slot = slot.lock();
            if slot.gen != gen || slot.val.is_none() {
                return None;
            }
            slot.gen = slot.gen.wrapping_add(1).max(1);
            slot.val.take()
        };
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.free.lock().push(idx as u32);
        val
    }

    #[inline(always)]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline(always)]
    fn split(id: SlotId) -> Option<(usize, u32)> {
        if id == SLOT_NONE {
            return None;
        }
        Some(((id >> 32) as usize, id as u32))
    }
}
