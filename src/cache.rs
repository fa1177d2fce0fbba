//! LRU cache for decoded chunks.
//!
//! Recency is an intrusive doubly-linked list threaded through a slab,
//! with a hash map from key to slab index, so every operation is O(1).
//! The chunk fetcher owns two of these (on-demand and prefetch) and
//! serializes all access, so there is no interior locking.
//!
//! `next_nth_eviction` exists for the fetcher's pollution guard: before
//! scheduling a prefetch it asks which entry the n-th upcoming insertion
//! would push out, and skips the prefetch if that victim is still wanted.

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    /// Entries that left the cache without ever being hit.
    pub unused_entries: u64,
    pub max_fill: usize,
    pub capacity: usize,
}

#[derive(Debug)]
struct Slot<K, V> {
    key: K,
    value: V,
    /// Towards the head (more recently used).
    newer: usize,
    /// Towards the tail (less recently used).
    older: usize,
    used: bool,
}

#[derive(Debug)]
pub struct Cache<K, V> {
    capacity: usize,
    map: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    stats: CacheStatistics,
}

impl<K: Eq + Hash + Clone, V> Cache<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            stats: CacheStatistics {
                capacity,
                ..CacheStatistics::default()
            },
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn statistics(&self) -> CacheStatistics {
        self.stats
    }

    /// Look up and touch. Counts a hit or a miss.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        match self.map.get(key).copied() {
            Some(index) => {
                self.stats.hits += 1;
                self.detach(index);
                self.push_front(index);
                let slot = self.slots[index].as_mut().expect("mapped slot is live");
                slot.used = true;
                Some(&slot.value)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Presence check without touching recency or statistics.
    pub fn test(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Move an entry to most-recently-used without counting a hit.
    pub fn touch(&mut self, key: &K) -> bool {
        match self.map.get(key).copied() {
            Some(index) => {
                self.detach(index);
                self.push_front(index);
                true
            }
            None => false,
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if let Some(index) = self.map.get(&key).copied() {
            let slot = self.slots[index].as_mut().expect("mapped slot is live");
            slot.value = value;
            self.detach(index);
            self.push_front(index);
            return;
        }

        if self.map.len() >= self.capacity {
            self.evict_lru();
        }

        let slot = Slot {
            key: key.clone(),
            value,
            newer: NIL,
            older: NIL,
            used: false,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.map.insert(key, index);
        self.push_front(index);
        self.stats.max_fill = self.stats.max_fill.max(self.map.len());
    }

    /// Remove a specific entry, returning its value.
    pub fn evict(&mut self, key: &K) -> Option<V> {
        let index = self.map.remove(key)?;
        self.detach(index);
        let slot = self.slots[index].take().expect("mapped slot is live");
        self.free.push(index);
        if !slot.used {
            self.stats.unused_entries += 1;
        }
        Some(slot.value)
    }

    pub fn clear(&mut self) {
        let keys: Vec<K> = self.map.keys().cloned().collect();
        for key in keys {
            self.evict(&key);
        }
    }

    /// Evict least-recently-used entries until at most `count` remain.
    pub fn shrink_to(&mut self, count: usize) {
        while self.map.len() > count {
            self.evict_lru();
        }
    }

    /// The key that the `n`-th future insertion (1-based) would evict,
    /// assuming no intervening lookups. `None` while there is still room.
    pub fn next_nth_eviction(&self, n: usize) -> Option<&K> {
        if self.map.len() + n <= self.capacity {
            return None;
        }
        let steps = self.map.len() + n - self.capacity;
        let mut index = self.tail;
        for _ in 1..steps {
            index = self.slots[index].as_ref()?.newer;
            if index == NIL {
                return None;
            }
        }
        self.slots
            .get(index)?
            .as_ref()
            .map(|slot| &slot.key)
    }

    fn evict_lru(&mut self) {
        if self.tail == NIL {
            return;
        }
        let key = self.slots[self.tail]
            .as_ref()
            .expect("tail slot is live")
            .key
            .clone();
        self.evict(&key);
    }

    fn detach(&mut self, index: usize) {
        let (newer, older) = {
            let slot = self.slots[index].as_ref().expect("detaching live slot");
            (slot.newer, slot.older)
        };
        match newer {
            NIL => self.head = older,
            _ => self.slots[newer].as_mut().expect("linked slot").older = older,
        }
        match older {
            NIL => self.tail = newer,
            _ => self.slots[older].as_mut().expect("linked slot").newer = newer,
        }
    }

    fn push_front(&mut self, index: usize) {
        {
            let slot = self.slots[index].as_mut().expect("attaching live slot");
            slot.newer = NIL;
            slot.older = self.head;
        }
        match self.head {
            NIL => self.tail = index,
            old_head => self.slots[old_head].as_mut().expect("linked slot").newer = index,
        }
        self.head = index;
    }
}
