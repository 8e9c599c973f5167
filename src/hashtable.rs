// Copyright 2025 The microcache Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Sharded concurrent hash tables and LRUs

use lru::LruCache;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::num::NonZeroUsize;

/// The shard count used by the per-key state tables in this crate.
pub(crate) const N_SHARDS: usize = 16;

#[inline]
fn shard_of(key: u128, n_shards: usize) -> usize {
    (key % n_shards as u128) as usize
}

/// A hash table sharded to a constant number of tables to reduce lock
/// contention.
pub(crate) struct ConcurrentHashTable<V, const N: usize> {
    tables: [RwLock<HashMap<u128, V>>; N],
}

impl<V, const N: usize> ConcurrentHashTable<V, N> {
    pub fn new() -> Self {
        ConcurrentHashTable {
            tables: std::array::from_fn(|_| RwLock::new(HashMap::new())),
        }
    }

    #[allow(dead_code)]
    pub fn read(&self, key: u128) -> RwLockReadGuard<HashMap<u128, V>> {
        self.tables[shard_of(key, N)].read()
    }

    pub fn write(&self, key: u128) -> RwLockWriteGuard<HashMap<u128, V>> {
        self.tables[shard_of(key, N)].write()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(|t| t.read().is_empty())
    }
}

/// Sharded concurrent structure over [LruCache], each shard bounded
/// independently.
pub(crate) struct ConcurrentLruCache<V, const N: usize> {
    shards: [RwLock<LruCache<u128, V>>; N],
}

impl<V, const N: usize> ConcurrentLruCache<V, N> {
    pub fn new(shard_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(shard_capacity).unwrap_or(NonZeroUsize::MIN);
        ConcurrentLruCache {
            shards: std::array::from_fn(|_| RwLock::new(LruCache::new(capacity))),
        }
    }

    pub fn write(&self, key: u128) -> RwLockWriteGuard<LruCache<u128, V>> {
        self.shards[shard_of(key, N)].write()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hash_table_sharding() {
        let table: ConcurrentHashTable<u32, 4> = ConcurrentHashTable::new();
        for key in 0..64u128 {
            table.write(key).insert(key, key as u32);
        }
        for key in 0..64u128 {
            assert_eq!(table.read(key).get(&key), Some(&(key as u32)));
        }
        assert!(!table.is_empty());
    }

    #[test]
    fn test_lru_shard_bound() {
        let cache: ConcurrentLruCache<u32, 1> = ConcurrentLruCache::new(2);
        cache.write(1).push(1, 1);
        cache.write(2).push(2, 2);
        cache.write(3).push(3, 3);
        // the single shard holds at most 2 entries, the oldest is evicted
        assert_eq!(cache.len(), 2);
        assert!(cache.write(1).get(&1).is_none());
    }
}
