//! Capacity-bounded LRU cache with per-key locking.
//!
//! Recency is tracked by an index-based doubly linked list stored in a slab:
//! nodes live in a `Vec`, link to each other by slot index, and freed slots are
//! reused. Every structural change (map + list) happens under one short-lived
//! mutex; a per-key mutex serializes operations on the same key.

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;

use tokio::sync::Mutex;
use tracing::debug;

use crate::locks::KeyedLocks;

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Key index plus recency list. `head` is the most recently used entry.
#[derive(Debug)]
struct Recency<K, V> {
    capacity: usize,
    index: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K, V> Recency<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match &self.slots[idx] {
            Some(node) => (node.prev, node.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.slots[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.slots[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = self.slots[idx].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.slots[idx].as_mut() {
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(h) => {
                if let Some(node) = self.slots[h].as_mut() {
                    node.prev = Some(idx);
                }
            }
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    /// Promote `key` to most recently used and return its value.
    fn touch(&mut self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.unlink(idx);
        self.push_front(idx);
        self.slots[idx].as_ref().map(|node| &node.value)
    }

    /// Insert or overwrite `key` as most recently used, then evict least
    /// recently used entries until back within capacity. Returns evicted keys.
    fn insert(&mut self, key: K, value: V) -> Vec<K> {
        if let Some(&idx) = self.index.get(&key) {
            if let Some(node) = self.slots[idx].as_mut() {
                node.value = value;
            }
            self.unlink(idx);
            self.push_front(idx);
            return Vec::new();
        }

        let node = Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);

        let mut evicted = Vec::new();
        while self.len() > self.capacity {
            match self.pop_back() {
                Some(key) => evicted.push(key),
                None => break,
            }
        }
        evicted
    }

    fn pop_back(&mut self) -> Option<K> {
        let idx = self.tail?;
        self.unlink(idx);
        let node = self.slots[idx].take()?;
        self.free.push(idx);
        self.index.remove(&node.key);
        Some(node.key)
    }

    fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            match &self.slots[idx] {
                Some(node) => {
                    keys.push(node.key.clone());
                    cursor = node.next;
                }
                None => break,
            }
        }
        keys
    }
}

/// A thread-safe LRU cache.
///
/// Values are cloned out on `get`, so callers never hold references into the
/// cache across await points.
#[derive(Debug)]
pub struct LruCache<K, V> {
    key_locks: KeyedLocks<K>,
    recency: Mutex<Recency<K, V>>,
    capacity: NonZeroUsize,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            key_locks: KeyedLocks::new(),
            recency: Mutex::new(Recency::new(capacity.get())),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Look up `key`, promoting it to most recently used on a hit.
    /// A miss leaves the cache untouched.
    pub async fn get(&self, key: &K) -> Option<V> {
        let lock = self.key_locks.get(key);
        let _guard = lock.lock().await;

        let mut recency = self.recency.lock().await;
        recency.touch(key).cloned()
    }

    /// Insert or overwrite `key` as most recently used, evicting least
    /// recently used entries beyond capacity.
    pub async fn put(&self, key: K, value: V) {
        let lock = self.key_locks.get(&key);
        let _guard = lock.lock().await;

        let evicted = self.recency.lock().await.insert(key, value);
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "cache over capacity, evicted lru entries");
        }
    }

    pub async fn len(&self) -> usize {
        self.recency.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Keys from most to least recently used.
    pub async fn keys(&self) -> Vec<K> {
        self.recency.lock().await.keys()
    }
}
