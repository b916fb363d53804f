//!
//! Two-level sharded hash container.
//!
//! The hash of the key selects a shard; each shard is a mutex-guarded map
//! with a creation-ordered reclamation list and a capacity cap. `insert` is
//! an atomic get-or-create-then-callback: the caller's handler runs with
//! the shard lock held, so it must not acquire any lock that precedes the
//! shard lock in the global order.
//!


use crate::common::{now_ms, OpError, OpResult};
use parking_lot::Mutex;
use std::{
    collections::{hash_map::DefaultHasher, HashMap, VecDeque},
    hash::{Hash, Hasher},
};

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// A value resident in a [`ShardedHtable`].
pub trait ShardedValue: Send + 'static {
    type Key: Eq + Hash + Clone + Send;

    /// Default-construct the entry for a newly created key. The insert
    /// handler is responsible for filling in the real fields.
    fn new(key: &Self::Key) -> Self;

    /// Whether the reclaim scan may free this entry.
    fn accept_reclaim(&self) -> bool;
}

/// Runs under the shard lock during [`ShardedHtable::insert`].
///
/// `new_create` is true when the entry was created by this very call. A
/// returned error surfaces to the caller; the entry is NOT rolled back, its
/// fields are assumed valid on any return.
pub trait EntryHandler<E, A> {
    fn on_entry(&self, entry: &mut E, arg: &mut A, new_create: bool) -> OpResult<()>;
}

#[derive(Clone, Copy, Debug)]
pub struct ShardingConfig {
    pub shard_count: usize,
    /// Per-shard resident cap; exceeding it triggers a reclaim scan.
    pub element_limit: usize,
    /// Entries younger than this are never reclaimed.
    pub min_ttl_ms: i64,
    /// Entries older than this are reclaimed opportunistically on every
    /// insert, not only when the shard is over capacity.
    pub max_ttl_ms: i64,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shard_count: 163,
            element_limit: 16384,
            min_ttl_ms: 600_000,
            max_ttl_ms: 86_400_000,
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

struct Tracked<E> {
    val: E,
    create_ms: i64,
}

struct ShardData<E: ShardedValue> {
    map: HashMap<E::Key, Tracked<E>>,
    // (key, create_ms) in creation order; stale markers are dropped lazily
    order: VecDeque<(E::Key, i64)>,
    element_limit: usize,
    min_ttl_ms: i64,
    max_ttl_ms: i64,
}

impl<E: ShardedValue> ShardData<E> {
    fn new(cfg: &ShardingConfig) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            element_limit: cfg.element_limit.max(1),
            min_ttl_ms: cfg.min_ttl_ms,
            max_ttl_ms: cfg.max_ttl_ms,
        }
    }

    // Pop entries from the head of the creation list whose max TTL has
    // elapsed. Bounded so a single insert never stalls.
    fn expire_front(&mut self, now: i64) {
        for _ in 0..2 {
            let Some((key, created)) = self.order.front().cloned() else {
                return;
            };
            if now - created < self.max_ttl_ms {
                return;
            }
            self.order.pop_front();
            match self.map.get(&key) {
                None => {}
                Some(tr) if tr.create_ms != created => {}
                Some(tr) if tr.val.accept_reclaim() => {
                    self.map.remove(&key);
                }
                Some(_) => {
                    // pinned; rotate to the tail and retry later
                    self.order.push_back((key, created));
                    return;
                }
            }
        }
    }

    // Capacity-triggered scan: free reclaimable entries older than the min
    // TTL, oldest first.
    fn reclaim(&mut self, now: i64) {
        let mut remaining = self.order.len();
        while remaining > 0 && self.map.len() >= self.element_limit {
            remaining -= 1;
            let Some((key, created)) = self.order.pop_front() else {
                break;
            };
            if now - created < self.min_ttl_ms {
                self.order.push_front((key, created));
                break;
            }
            match self.map.get(&key) {
                None => {}
                Some(tr) if tr.create_ms != created => {}
                Some(tr) if tr.val.accept_reclaim() => {
                    self.map.remove(&key);
                }
                Some(_) => {
                    self.order.push_back((key, created));
                }
            }
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// A looked-up map slot, exposed while the shard lock is held.
pub struct EntryRef<'a, E: ShardedValue> {
    shard: &'a mut ShardData<E>,
    key: &'a E::Key,
}

impl<E: ShardedValue> EntryRef<'_, E> {
    #[inline(always)]
    pub fn get(&mut self) -> Option<&mut E> {
        self.shard.map.get_mut(self.key).map(|tr| &mut tr.val)
    }

    /// Insert a fully built entry; refuses to displace a resident one.
    pub fn insert(&mut self, val: E) -> OpResult<()> {
        if self.shard.map.contains_key(self.key) {
            return Err(OpError::Exists);
        }
        let now = now_ms();
        if self.shard.map.len() >= self.shard.element_limit {
            self.shard.reclaim(now);
        }
        self.shard
            .map
            .insert(self.key.clone(), Tracked { val, create_ms: now });
        self.shard.order.push_back((self.key.clone(), now));
        Ok(())
    }

    pub fn remove(&mut self) -> Option<E> {
        self.shard.map.remove(self.key).map(|tr| tr.val)
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

pub struct ShardedHtable<E: ShardedValue> {
    shards: Vec<Mutex<ShardData<E>>>,
}

impl<E: ShardedValue> ShardedHtable<E> {
    pub fn new(cfg: ShardingConfig) -> Self {
        let n = cfg.shard_count.max(1);
        Self {
            shards: (0..n).map(|_| Mutex::new(ShardData::new(&cfg))).collect(),
        }
    }

    #[inline(always)]
    fn shard_of(&self, key: &E::Key) -> &Mutex<ShardData<E>> {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        &self.shards[(h.finish() as usize) % self.shards.len()]
    }

    /// Atomic get-or-create-then-callback under the shard lock.
    pub fn insert<A, H>(&self, key: &E::Key, handler: &H, arg: &mut A) -> OpResult<()>
    where
        H: EntryHandler<E, A>,
    {
        let mut sd = self.shard_of(key).lock();
        let now = now_ms();
        sd.expire_front(now);

        let new_create = !sd.map.contains_key(key);
        if new_create {
            if sd.map.len() >= sd.element_limit {
                sd.reclaim(now);
            }
            sd.map.insert(
                key.clone(),
                Tracked {
                    val: E::new(key),
                    create_ms: now,
                },
            );
            sd.order.push_back((key.clone(), now));
        }
        let Some(tr) = sd.map.get_mut(key) else {
            return Err(OpError::NotFound);
        };
        handler.on_entry(&mut tr.val, arg, new_create)
    }

    /// Run `f` against the slot for `key` with the shard lock held; `f` may
    /// read, mutate, create or remove the entry through the [`EntryRef`].
    pub fn with_entry<R>(&self, key: &E::Key, f: impl FnOnce(&mut EntryRef<'_, E>) -> R) -> R {
        let mut sd = self.shard_of(key).lock();
        let mut ent = EntryRef {
            shard: &mut *sd,
            key,
        };
        f(&mut ent)
    }

    /// Read/mutate an existing entry without structural changes.
    pub fn visit<R>(&self, key: &E::Key, f: impl FnOnce(&mut E) -> R) -> Option<R> {
        let mut sd = self.shard_of(key).lock();
        sd.map.get_mut(key).map(|tr| f(&mut tr.val))
    }

    pub fn delete(&self, key: &E::Key) -> OpResult<()> {
        let mut sd = self.shard_of(key).lock();
        match sd.map.remove(key) {
            Some(_) => Ok(()),
            None => Err(OpError::NotFound),
        }
    }

    /// Keys matching a predicate, collected shard by shard. The result is a
    /// snapshot; entries may come and go before the caller re-locks them.
    pub fn keys_matching(&self, pred: impl Fn(&E::Key) -> bool) -> Vec<E::Key> {
        let mut ret = vec![];
        for sd in self.shards.iter() {
            let sd = sd.lock();
            ret.extend(sd.map.keys().filter(|k| pred(k)).cloned());
        }
        ret
    }

    /// Keep only entries for which `f` returns true.
    pub fn retain(&self, mut f: impl FnMut(&E::Key, &mut E) -> bool) {
        for sd in self.shards.iter() {
            let mut sd = sd.lock();
            sd.map.retain(|k, tr| f(k, &mut tr.val));
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|sd| sd.lock().map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
