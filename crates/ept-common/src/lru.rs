//! Fixed-capacity LRU cache with name-indexed invalidation.
//!
//! Entries live in an arena (`Vec` of slots addressed by index) threaded on a
//! doubly linked recency list; a `HashMap` maps each key to its slot. Hits,
//! inserts and evictions are O(1). Freed slots are recycled through a free
//! list so the arena never grows past `capacity + 1`.
//!
//! # Not-found vs. cached null
//!
//! [`LruCache::search`] returns `None` when the key is not cached. Callers
//! that need to remember "confirmed absent" store an explicit null value
//! (for example `Option<T>::None` or `serde_json::Value::Null`), which comes
//! back as `Some(&null)` and is counted as a hit.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use tracing::warn;

/// Callback invoked with every entry evicted for capacity.
///
/// A returned error is logged and swallowed; the eviction still happens.
pub type EvictCallback<K, V> = Box<dyn FnMut(&K, &V) -> Result<(), String> + Send>;

/// Counters for a single cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Successful lookups
    pub hits: u64,
    /// Lookups that returned the not-found sentinel
    pub misses: u64,
    /// Entries dropped to stay within capacity
    pub evictions: u64,
    /// Number of full flushes
    pub flushes: u64,
    /// Current entry count
    pub len: usize,
    /// Configured capacity
    pub capacity: usize,
}

impl CacheStats {
    /// Hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
}

struct Entry<K, V> {
    key: K,
    value: V,
    names: Vec<String>,
}

/// Fixed-capacity key/value cache, head = most recently used.
pub struct LruCache<K, V> {
    name: String,
    capacity: usize,
    entries: Vec<Option<Entry<K, V>>>,
    links: Vec<Link>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    on_evict: Option<EvictCallback<K, V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    flushes: u64,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty cache. A capacity of zero is treated as one.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            entries: Vec::new(),
            links: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            on_evict: None,
            hits: 0,
            misses: 0,
            evictions: 0,
            flushes: 0,
        }
    }

    /// Installs the callback invoked for entries evicted by capacity.
    pub fn with_evict_callback(mut self, callback: EvictCallback<K, V>) -> Self {
        self.on_evict = Some(callback);
        self
    }

    /// Returns the cache name (used in logs).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns the configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns a snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            flushes: self.flushes,
            len: self.len(),
            capacity: self.capacity,
        }
    }

    /// Looks up a key, promoting it to most recently used.
    ///
    /// Returns `None` (the not-found sentinel) on a miss.
    pub fn search<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.index.get(key).copied() {
            Some(idx) => {
                self.hits += 1;
                self.detach(idx);
                self.attach_front(idx);
                self.entries[idx].as_ref().map(|e| &e.value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Looks up a key without touching recency or counters.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = *self.index.get(key)?;
        self.entries[idx].as_ref().map(|e| &e.value)
    }

    /// Returns true if the key is cached.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    /// Inserts or replaces a value and makes it most recently used.
    pub fn push(&mut self, key: K, value: V) {
        self.push_named(key, value, Vec::new());
    }

    /// Inserts or replaces a value together with its reverse-lookup names.
    pub fn push_named(&mut self, key: K, value: V, names: Vec<String>) {
        if let Some(idx) = self.index.get(&key).copied() {
            if let Some(entry) = self.entries[idx].as_mut() {
                entry.value = value;
                entry.names = names;
            }
            self.detach(idx);
            self.attach_front(idx);
            return;
        }

        let entry = Entry {
            key: key.clone(),
            value,
            names,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.entries[idx] = Some(entry);
                self.links[idx] = Link::default();
                idx
            }
            None => {
                self.entries.push(Some(entry));
                self.links.push(Link::default());
                self.entries.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.attach_front(idx);

        if self.index.len() > self.capacity {
            self.evict_tail();
        }
    }

    /// Removes a single key, returning its value.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.index.get(key).copied()?;
        self.take(idx).map(|(_, value)| value)
    }

    /// Removes every entry whose name list contains `name`.
    pub fn remove_by_name(&mut self, name: &str) -> Vec<(K, V)> {
        let matched: Vec<usize> = self
            .index
            .values()
            .copied()
            .filter(|&idx| {
                self.entries[idx]
                    .as_ref()
                    .is_some_and(|e| e.names.iter().any(|n| n == name))
            })
            .collect();
        matched.into_iter().filter_map(|idx| self.take(idx)).collect()
    }

    /// Keeps only the entries for which `keep` returns true.
    ///
    /// Returns the removed entries. This is a linear scan.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let dropped: Vec<usize> = self
            .index
            .values()
            .copied()
            .filter(|&idx| {
                self.entries[idx]
                    .as_ref()
                    .is_some_and(|e| !keep(&e.key, &e.value))
            })
            .collect();
        dropped.into_iter().filter_map(|idx| self.take(idx)).collect()
    }

    /// Drops every entry without invoking the eviction callback.
    pub fn flush(&mut self) {
        self.entries.clear();
        self.links.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        self.flushes += 1;
    }

    /// Evicts every entry through the eviction callback, oldest first.
    pub fn evict_all(&mut self) {
        while self.tail.is_some() {
            self.evict_tail();
        }
    }

    /// Keys ordered from most to least recently used.
    pub fn keys_by_recency(&self) -> Vec<&K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            if let Some(entry) = self.entries[idx].as_ref() {
                keys.push(&entry.key);
            }
            cursor = self.links[idx].next;
        }
        keys
    }

    fn evict_tail(&mut self) {
        let Some(idx) = self.tail else {
            return;
        };
        let Some((key, value)) = self.take(idx) else {
            return;
        };
        self.evictions += 1;
        if let Some(callback) = self.on_evict.as_mut() {
            if let Err(e) = callback(&key, &value) {
                warn!(cache = %self.name, error = %e, "eviction callback failed");
            }
        }
    }

    fn take(&mut self, idx: usize) -> Option<(K, V)> {
        let entry = self.entries[idx].take()?;
        self.detach(idx);
        self.index.remove(&entry.key);
        self.free.push(idx);
        Some((entry.key, entry.value))
    }

    fn detach(&mut self, idx: usize) {
        let Link { prev, next } = self.links[idx];
        match prev {
            Some(p) => self.links[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.links[n].prev = prev,
            None => self.tail = prev,
        }
        self.links[idx] = Link::default();
    }

    fn attach_front(&mut self, idx: usize) {
        self.links[idx] = Link {
            prev: None,
            next: self.head,
        };
        if let Some(old_head) = self.head {
            self.links[old_head].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}

impl<K, V> std::fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.index.len())
            .finish()
    }
}
