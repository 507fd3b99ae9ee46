//! Concurrent resizable hash table
//!
//! Maps a 64-bit key space to clonable items. Ordinary operations take the
//! table-wide lock in read mode and a single bucket lock; growth briefly
//! takes the table-wide lock in write mode to link a fresh generation with
//! double the buckets in front of the old one. Old generations stay
//! searchable until they drain, so a resize never invalidates a lookup in
//! flight.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

#[cfg(test)]
mod tests;

/// Key type for all tables: an opaque 64-bit value.
pub type Key = u64;

/// Pluggable hash and equality functions for a table.
///
/// `hash` must be deterministic and return a value in `[0, 2^bits)`. The
/// 64-bit width is used as a cheap pre-check before `equal` is consulted, so
/// keys larger than their 64-bit handle only pay for a full comparison on a
/// 64-bit hash collision.
pub trait KeyOps: Send + Sync {
    /// Hash `key` down to `bits` bits.
    fn hash(&self, key: Key, bits: u32) -> u64;

    /// Full equality check.
    #[inline]
    fn equal(&self, a: Key, b: Key) -> bool {
        a == b
    }
}

/// Key functions for keys that fit directly in 64 bits.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityKeys;

impl KeyOps for IdentityKeys {
    #[inline]
    fn hash(&self, key: Key, bits: u32) -> u64 {
        fold_key(key, bits)
    }
}

/// Fold a 64-bit key down to `bits` bits.
///
/// Every bit of the key participates, so keys that differ only in their high
/// bits still spread across buckets. The frequent `bits == 64` case returns
/// the key verbatim.
pub fn fold_key(key: u64, bits: u32) -> u64 {
    debug_assert!((1..=64).contains(&bits));
    if bits == 64 {
        return key;
    }
    let mut folded = key;
    let mut width = 64u32;
    while width >= bits * 2 {
        width /= 2;
        folded ^= folded >> width;
    }
    folded & ((1u64 << bits) - 1)
}

/// One stored entry.
struct Entry<V> {
    key: Key,
    hash64: u64,
    value: V,
}

/// One lockable chain of entries.
struct Bucket<V> {
    items: Mutex<Vec<Entry<V>>>,
}

impl<V> Bucket<V> {
    fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }
}

/// One full bucket array produced by a resize.
///
/// Older generations remain searchable until their live count reaches zero;
/// their storage is retired only once every outstanding reference drops.
struct Generation<V> {
    /// log2 of the bucket count.
    bits: u32,
    buckets: Box<[CachePadded<Bucket<V>>]>,
    /// Number of live entries across all buckets.
    live: AtomicI64,
}

impl<V> Generation<V> {
    fn new(bits: u32) -> Self {
        let buckets = (0..1usize << bits)
            .map(|_| CachePadded::new(Bucket::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            bits,
            buckets,
            live: AtomicI64::new(0),
        }
    }

    #[inline]
    fn live(&self) -> i64 {
        self.live.load(Ordering::SeqCst)
    }
}

/// Thread-safe resizable map from [`Key`] to clonable items.
///
/// Concurrent operations on different keys only contend on the table-wide
/// read lock and their own bucket lock; the write lock is held just long
/// enough to swap in a new head generation.
pub struct ConcurrentTable<V, K: KeyOps = IdentityKeys> {
    /// Generations, newest first. Only mutated under the write lock.
    generations: RwLock<Vec<Arc<Generation<V>>>>,
    keys: K,
    collision_hint: usize,
}

impl<V: Clone> ConcurrentTable<V, IdentityKeys> {
    /// Create a table with `2^bits` buckets and identity key functions.
    #[inline]
    pub fn new(bits: u32, collision_hint: usize) -> Self {
        Self::with_keys(bits, collision_hint, IdentityKeys)
    }
}

impl<V: Clone, K: KeyOps> ConcurrentTable<V, K> {
    /// Create a table with `2^bits` buckets and the given key functions.
    ///
    /// `bits` must be in `1..=16`.
    pub fn with_keys(bits: u32, collision_hint: usize, keys: K) -> Self {
        assert!(
            (1..=16).contains(&bits),
            "table bits out of range: {bits} (expected 1..=16)"
        );
        Self {
            generations: RwLock::new(vec![Arc::new(Generation::new(bits))]),
            keys,
            collision_hint,
        }
    }

    #[inline]
    fn matches(&self, entry: &Entry<V>, key: Key, hash64: u64) -> bool {
        entry.key == key || (entry.hash64 == hash64 && self.keys.equal(entry.key, key))
    }

    /// Insert `value` under `key`.
    ///
    /// An existing entry under the same key is shadowed until removed; the
    /// most recent insertion wins lookups.
    pub fn insert(&self, key: Key, value: V) {
        let observed_head;
        let needs_resize;
        {
            let generations = self.generations.read();
            let head = &generations[0];
            observed_head = Arc::clone(head);
            let hash = self.keys.hash(key, head.bits);
            let mut items = head.buckets[hash as usize].items.lock();
            items.push(Entry {
                key,
                hash64: self.keys.hash(key, 64),
                value,
            });
            head.live.fetch_add(1, Ordering::SeqCst);
            needs_resize = items.len() > self.collision_hint;
        }
        if needs_resize {
            self.grow(&observed_head);
        }
    }

    /// Return the value under `key`, creating it with `create` if absent.
    ///
    /// The existence check and the insertion happen in the head bucket's lock
    /// scope (falling through older generations), so two racing creators for
    /// the same key observe a single winner.
    pub fn get_or_insert_with(&self, key: Key, create: impl FnOnce() -> V) -> V {
        let observed_head;
        let value;
        let needs_resize;
        {
            let generations = self.generations.read();
            let head = &generations[0];
            observed_head = Arc::clone(head);
            let hash64 = self.keys.hash(key, 64);
            let hash = self.keys.hash(key, head.bits);
            let mut items = head.buckets[hash as usize].items.lock();
            if let Some(entry) = items.iter().rev().find(|e| self.matches(e, key, hash64)) {
                return entry.value.clone();
            }
            // The key may still live in a generation that predates the last
            // resize.
            for generation in generations[1..].iter() {
                let hash = self.keys.hash(key, generation.bits);
                let old_items = generation.buckets[hash as usize].items.lock();
                if let Some(entry) = old_items.iter().rev().find(|e| self.matches(e, key, hash64))
                {
                    return entry.value.clone();
                }
            }
            let created = create();
            value = created.clone();
            items.push(Entry {
                key,
                hash64,
                value: created,
            });
            head.live.fetch_add(1, Ordering::SeqCst);
            needs_resize = items.len() > self.collision_hint;
        }
        if needs_resize {
            self.grow(&observed_head);
        }
        value
    }

    /// Look up `key`, searching the generation chain front-to-back.
    pub fn find(&self, key: Key) -> Option<V> {
        let generations = self.generations.read();
        let hash64 = self.keys.hash(key, 64);
        for generation in generations.iter() {
            let hash = self.keys.hash(key, generation.bits);
            let items = generation.buckets[hash as usize].items.lock();
            if let Some(entry) = items.iter().rev().find(|e| self.matches(e, key, hash64)) {
                return Some(entry.value.clone());
            }
        }
        None
    }

    /// Remove and return the value under `key`, if present.
    pub fn remove(&self, key: Key) -> Option<V> {
        let mut drained_old = false;
        let removed = {
            let generations = self.generations.read();
            let hash64 = self.keys.hash(key, 64);
            let mut removed = None;
            for (depth, generation) in generations.iter().enumerate() {
                let hash = self.keys.hash(key, generation.bits);
                let mut items = generation.buckets[hash as usize].items.lock();
                if let Some(pos) = items.iter().rposition(|e| self.matches(e, key, hash64)) {
                    let entry = items.remove(pos);
                    let live = generation.live.fetch_sub(1, Ordering::SeqCst) - 1;
                    if depth > 0 && live == 0 {
                        drained_old = true;
                    }
                    removed = Some(entry.value);
                    break;
                }
            }
            removed
        };
        if drained_old {
            self.prune();
        }
        removed
    }

    /// Visit every live entry. Diagnostics and teardown only, not a hot path.
    pub fn for_each(&self, mut visit: impl FnMut(Key, &V)) {
        let generations = self.generations.read();
        for generation in generations.iter() {
            for bucket in generation.buckets.iter() {
                let items = bucket.items.lock();
                for entry in items.iter() {
                    visit(entry.key, &entry.value);
                }
            }
        }
    }

    /// Number of live entries across all generations.
    pub fn len(&self) -> usize {
        let generations = self.generations.read();
        generations
            .iter()
            .map(|g| g.live().max(0) as usize)
            .sum()
    }

    /// Whether the table holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of generations currently linked (tests and diagnostics).
    pub fn nb_generations(&self) -> usize {
        self.generations.read().len()
    }

    /// Log the per-generation bucket length distribution.
    pub fn log_stats(&self) {
        let generations = self.generations.read();
        for (depth, generation) in generations.iter().enumerate() {
            let mut min = usize::MAX;
            let mut max = 0usize;
            let mut total = 0usize;
            for bucket in generation.buckets.iter() {
                let len = bucket.items.lock().len();
                min = min.min(len);
                max = max.max(len);
                total += len;
            }
            let count = generation.buckets.len();
            debug!(
                depth,
                bits = generation.bits,
                min,
                max,
                mean = total as f64 / count as f64,
                "table generation stats"
            );
        }
    }

    /// Link a new head generation with double the buckets.
    ///
    /// `observed_head` is the head seen by the triggering operation; if it no
    /// longer matches, another writer resized first and there is nothing to
    /// do. Generations are never freed while reachable, so the pointer
    /// comparison cannot be fooled by reuse.
    fn grow(&self, observed_head: &Arc<Generation<V>>) {
        let mut generations = self.generations.write();
        if !Arc::ptr_eq(&generations[0], observed_head) {
            return;
        }
        let bits = generations[0].bits + 1;
        assert!(bits < 32, "table grew past 2^31 buckets");
        debug!(bits, "growing table");
        generations.insert(0, Arc::new(Generation::new(bits)));
        // Drop generations that drained while we were not looking.
        let head = Arc::clone(&generations[0]);
        generations.retain(|g| Arc::ptr_eq(g, &head) || g.live() > 0);
    }

    /// Unlink fully drained old generations. Best effort: if the write lock
    /// is contended the next resize or removal picks the work up.
    fn prune(&self) {
        if let Some(mut generations) = self.generations.try_write() {
            let head = Arc::clone(&generations[0]);
            generations.retain(|g| Arc::ptr_eq(g, &head) || g.live() > 0);
        }
    }
}

impl<V, K: KeyOps> fmt::Debug for ConcurrentTable<V, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let generations = self.generations.read();
        let mut d = f.debug_struct("ConcurrentTable");
        d.field("generations", &generations.len());
        if let Some(head) = generations.first() {
            d.field("bits", &head.bits);
        }
        d.field("collision_hint", &self.collision_hint);
        d.finish()
    }
}
