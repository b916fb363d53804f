//!
//! Fixed-size buffer slab.
//!
//! A process-wide pool of equally sized byte buffers. Freelists are striped
//! and a thread is routed to a stripe by its id hash, so release/acquire
//! pairs from the same thread rarely contend. Buffers are created lazily up
//! to the capacity cap; an exhausted slab reports `NoMemory` and the caller
//! is expected to degrade, not fail.
//!
//! Slabs can be published in a named registry with explicit
//! register/unregister, for tooling that wants to inspect live pools.
//!

#[cfg(test)]
mod test;

use crate::common::{OpError, OpResult};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

pub struct BufferSlab {
    buf_size: usize,
    capacity: usize,
    created: AtomicUsize,
    in_use: AtomicUsize,
    stripes: Vec<Mutex<Vec<Box<[u8]>>>>,
}

impl BufferSlab {
    pub fn new(buf_size: usize, capacity: usize, stripe_count: usize) -> Self {
        let stripe_count = stripe_count.max(1);
        Self {
            buf_size,
            capacity: capacity.max(1),
            created: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            stripes: (0..stripe_count).map(|_| Mutex::new(vec![])).collect(),
        }
    }

    #[inline(always)]
    fn home_stripe(&self) -> usize {
        let mut h = DefaultHasher::new();
        thread::current().id().hash(&mut h);
        (h.finish() as usize) % self.stripes.len()
    }

    /// Take a buffer, preferring the calling thread's stripe.
    pub fn acquire(&self) -> OpResult<Box<[u8]>> {
        let home = self.home_stripe();
        for i in 0..self.stripes.len() {
            let idx = (home + i) % self.stripes.len();
            if let Some(buf) = self.stripes[idx].lock().pop() {
                self.in_use.fetch_add(1, Ordering::AcqRel);
                return Ok(buf);
            }
        }

        loop {
            let cur = self.created.load(Ordering::Acquire);
            if cur >= self.capacity {
                return Err(OpError::NoMemory);
            }
            if self
                .created
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Ok(vec![0u8; self.buf_size].into_boxed_slice())
    }

    /// Return a buffer to the calling thread's stripe.
    pub fn release(&self, buf: Box<[u8]>) {
        debug_assert_eq!(buf.len(), self.buf_size);
        self.stripes[self.home_stripe()].lock().push(buf);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline(always)]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

static REGISTRY: Lazy<Mutex<HashMap<String, Arc<BufferSlab>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Publish a slab under a unique name.
pub fn slab_register(name: &str, slab: Arc<BufferSlab>) -> OpResult<()> {
    let mut reg = REGISTRY.lock();
    if reg.contains_key(name) {
        return Err(OpError::Exists);
    }
    reg.insert(name.to_owned(), slab);
    Ok(())
}

pub fn slab_lookup(name: &str) -> Option<Arc<BufferSlab>> {
    REGISTRY.lock().get(name).cloned()
}

pub fn slab_unregister(name: &str) -> Option<Arc<BufferSlab>> {
    REGISTRY.lock().remove(name)
}
