//!
//! Hashed timing wheel.
//!
//! Buckets are intrusive doubly-linked lists over a node slab, indexed by
//! `deadline / precision mod slot_count`. A dedicated tick thread walks the
//! buckets between the previous and the current tick and fires the expiry
//! handler for every node whose deadline has passed. Handlers run after the
//! wheel lock is released, so they may take locks that come later in the
//! global order without inversion.
//!


use crate::common::now_ms;
use crate::common::{OpError, OpResult};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// Stable timer handle: slot index in the high half, generation in the low
/// half. Never zero for a live timer.
pub type TimerId = u64;

pub const TIMER_NONE: TimerId = 0;

const NIL: i32 = -1;

#[inline(always)]
fn id_of(idx: usize, gen: u32) -> TimerId {
    ((idx as u64) << 32) | gen as u64
}

#[inline(always)]
fn split_id(id: TimerId) -> (usize, u32) {
    ((id >> 32) as usize, id as u32)
}

struct Node<T> {
    gen: u32,
    in_use: bool,
    deadline_ms: i64,
    payload: Option<T>,
    bucket: i32,
    prev: i32,
    next: i32,
}

struct WheelInner<T> {
    nodes: Vec<Node<T>>,
    free: Vec<u32>,
    buckets: Vec<i32>,
    cursor_ms: i64,
}

struct WheelShared<T> {
    inner: Mutex<WheelInner<T>>,
    slot_count: usize,
    precision_ms: i64,
    running: AtomicBool,
}

pub struct TimerWheel<T: Send + 'static> {
    shared: Arc<WheelShared<T>>,
    tick_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<T: Send + 'static> TimerWheel<T> {
    pub fn new(slot_count: usize, precision_ms: i64) -> Self {
        let slot_count = slot_count.max(2);
        Self {
            shared: Arc::new(WheelShared {
                inner: Mutex::new(WheelInner {
                    nodes: vec![],
                    free: vec![],
                    buckets: vec![NIL; slot_count],
                    cursor_ms: now_ms(),
                }),
                slot_count,
                precision_ms: precision_ms.max(1),
                running: AtomicBool::new(false),
            }),
            tick_thread: Mutex::new(None),
        }
    }

    /// Arm a timer; O(1).
    pub fn add(&self, payload: T, timeout_ms: i64) -> TimerId {
        self.shared.add(payload, timeout_ms)
    }

    /// Detach and re-insert with a new deadline; O(1).
    pub fn modify(&self, id: TimerId, new_timeout_ms: i64) -> OpResult<()> {
        self.shared.modify(id, new_timeout_ms)
    }

    /// Cancel a timer, returning its payload if it had not fired yet.
    pub fn remove(&self, id: TimerId) -> Option<T> {
        self.shared.remove(id)
    }

    pub fn live_count(&self) -> usize {
        let g = self.shared.inner.lock();
        g.nodes.iter().filter(|n| n.in_use).count()
    }

    /// Spawn the tick thread. `on_expire` is called once per expired node,
    /// outside the wheel lock.
    pub fn start<F>(&self, on_expire: F)
    where
        F: Fn(T) + Send + 'static,
    {
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("timer-tick".to_owned())
            .spawn(move || {
                while shared.running.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(shared.precision_ms as u64));
                    for payload in shared.collect_expired(now_ms()) {
                        on_expire(payload);
                    }
                }
            });
        *self.tick_thread.lock() = handle.ok();
    }

    /// Stop and join the tick thread. Armed timers stay put and simply
    /// never fire.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(h) = self.tick_thread.lock().take() {
            let _ = h.join();
        }
    }
}

impl<T: Send + 'static> WheelShared<T> {
    fn add(&self, payload: T, timeout_ms: i64) -> TimerId {
        let deadline = now_ms() + timeout_ms.max(0);
        let mut g = self.inner.lock();

        let idx = match g.free.pop() {
            Some(i) => i as usize,
            None => {
                g.nodes.push(Node {
                    gen: 1,
                    in_use: false,
                    deadline_ms: 0,
                    payload: None,
                    bucket: NIL,
                    prev: NIL,
                    next: NIL,
                });
                g.nodes.len() - 1
            }
        };
        let n = &mut g.nodes[idx];
        n.in_use = true;
        n.deadline_ms = deadline;
        n.payload = Some(payload);
        let gen = n.gen;
        self.link(&mut g, idx, deadline);
        id_of(idx, gen)
    }

    fn modify(&self, id: TimerId, new_timeout_ms: i64) -> OpResult<()> {
        let (idx, gen) = split_id(id);
        let deadline = now_ms() + new_timeout_ms.max(0);
        let mut g = self.inner.lock();
        match g.nodes.get(idx) {
            Some(n) if n.in_use && n.gen == gen => {}
            _ => return Err(OpError::NotFound),
        }
        self.unlink(&mut g, idx);
        g.nodes[idx].deadline_ms = deadline;
        self.link(&mut g, idx, deadline);
        Ok(())
    }

    fn remove(&self, id: TimerId) -> Option<T> {
        let (idx, gen) = split_id(id);
        let mut g = self.inner.lock();
        match g.nodes.get(idx) {
            Some(n) if n.in_use && n.gen == gen => {}
            _ => return None,
        }
        self.unlink(&mut g, idx);
        let payload = g.nodes[idx].payload.take();
        Self::release(&mut g, idx);
        payload
    }

    // collect every payload whose deadline has passed
    fn collect_expired(&self, now: i64) -> Vec<T> {
        let mut g = self.inner.lock();
        let mut out = vec![];

        let start_tick = g.cursor_ms / self.precision_ms;
        let end_tick = now / self.precision_ms;
        if end_tick <= start_tick {
            return out;
        }
        let span = ((end_tick - start_tick) as usize).min(self.slot_count);

        for step in 1..=span {
            let b = ((start_tick as usize).wrapping_add(step)) % self.slot_count;
            let mut idx = g.buckets[b];
            while idx != NIL {
                let next = g.nodes[idx as usize].next;
                if g.nodes[idx as usize].deadline_ms <= now {
                    self.unlink(&mut g, idx as usize);
                    if let Some(p) = g.nodes[idx as usize].payload.take() {
                        out.push(p);
                    }
                    Self::release(&mut g, idx as usize);
                }
                idx = next;
            }
        }
        g.cursor_ms = now;
        out
    }

    fn link(&self, g: &mut WheelInner<T>, idx: usize, deadline: i64) {
        // a deadline at or behind the cursor lands in the next tick's bucket
        let mut tick = deadline / self.precision_ms;
        let cursor_tick = g.cursor_ms / self.precision_ms;
        if tick <= cursor_tick {
            tick = cursor_tick + 1;
        }
        let b = (tick as usize) % self.slot_count;
        let head = g.buckets[b];
        {
            let n = &mut g.nodes[idx];
            n.bucket = b as i32;
            n.prev = NIL;
            n.next = head;
        }
        if head != NIL {
            g.nodes[head as usize].prev = idx as i32;
        }
        g.buckets[b] = idx as i32;
    }

    fn unlink(&self, g: &mut WheelInner<T>, idx: usize) {
        let (prev, next, bucket) = {
            let n = &g.nodes[idx];
            (n.prev, n.next, n.bucket)
        };
        if bucket == NIL {
            return;
        }
        if prev != NIL {
            g.nodes[prev as usize].next = next;
        } else {
            g.buckets[bucket as usize] = next;
        }
        if next != NIL {
            g.nodes[next as usize].prev = prev;
        }
        let n = &mut g.nodes[idx];
        n.prev = NIL;
        n.next = NIL;
        n.bucket = NIL;
    }

    fn release(g: &mut WheelInner<T>, idx: usize) {
        let n = &mut g.nodes[idx];
        n.in_use = false;
        n.gen = n.gen.wrapping_add(1).max(1);
        g.free.push(idx as u32);
    }
}
