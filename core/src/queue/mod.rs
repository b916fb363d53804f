//!
//! Bounded MPMC condition-variable queue.
//!
//! Producers block while the queue is full; consumers block while it is
//! empty. `shutdown` wakes everyone: consumers keep draining whatever is
//! left and then receive `None`, producers are refused from that point on.
//!


use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

struct QueueInner<T> {
    items: VecDeque<T>,
    stopped: bool,
}

pub struct CondQueue<T> {
    inner: Mutex<QueueInner<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> CondQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                stopped: false,
            }),
            capacity: capacity.max(1),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Blocking push. A stopped queue refuses the item and hands it back so
    /// the caller can reclaim whatever resources it carries.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut g = self.inner.lock();
        loop {
            if g.stopped {
                return Err(item);
            }
            if g.items.len() < self.capacity {
                break;
            }
            self.not_full.wait(&mut g);
        }
        g.items.push_back(item);
        drop(g);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocking pop; `None` once the queue is stopped and drained.
    pub fn pop(&self) -> Option<T> {
        let mut g = self.inner.lock();
        loop {
            if let Some(item) = g.items.pop_front() {
                drop(g);
                self.not_full.notify_one();
                return Some(item);
            }
            if g.stopped {
                return None;
            }
            self.not_empty.wait(&mut g);
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let mut g = self.inner.lock();
        let item = g.items.pop_front();
        if item.is_some() {
            drop(g);
            self.not_full.notify_one();
        }
        item
    }

    pub fn shutdown(&self) {
        {
            let mut g = self.inner.lock();
            g.stopped = true;
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
