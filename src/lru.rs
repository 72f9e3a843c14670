// Copyright (c) 2019 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
//! A bounded map whose entries expire.

use std::hash::Hash;
use std::time::{Duration, Instant};

use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Least-recently-used cache with a per-entry deadline. Expired entries are
/// never returned.
pub struct TtlCache<K: Hash + Eq, V> {
    map: Mutex<LinkedHashMap<K, Entry<V>>>,
    capacity: usize,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        TtlCache {
            map: Mutex::new(LinkedHashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut map = self.map.lock();

        let expired = map.get(key)?.expires_at <= Instant::now();
        if expired {
            map.remove(key);
            return None;
        }

        map.get_refresh(key).map(|e| e.value.clone())
    }

    /// Inserts `value` for `ttl`. A zero TTL stores nothing.
    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }

        let mut map = self.map.lock();
        map.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );

        while map.len() > self.capacity {
            map.pop_front();
        }
    }

    pub fn remove(&self, key: &K) {
        self.map.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let cache = TtlCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.insert("a", 1, ttl);
        cache.insert("b", 2, ttl);

        // Touch "a" so "b" becomes the oldest.
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3, ttl);

        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = TtlCache::new(8);
        cache.insert("a", 1, Duration::from_millis(1));
        cache.insert("z", 0, Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"z"), None);
        assert!(cache.is_empty());
    }
}
