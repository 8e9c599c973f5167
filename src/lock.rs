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

//! Per-key in-flight state
//!
//! Two structures with different contention rules. [CollapseMap] serializes
//! collapsible requests per request key: waiters queue on a keyed mutex and
//! re-read the cache once they acquire it. [RevalidateSet] is a single-flight
//! set per object key: contenders abandon instead of waiting, because the
//! stale reply has already been sent.

use crate::hashtable::{ConcurrentHashTable, N_SHARDS};
use crate::key::{self, HashBinary};

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// The per-request-key mutex table for collapsed forwarding.
pub(crate) struct CollapseMap {
    table: ConcurrentHashTable<Arc<Mutex<()>>, N_SHARDS>,
}

impl CollapseMap {
    pub fn new() -> Self {
        CollapseMap {
            table: ConcurrentHashTable::new(),
        }
    }

    /// Acquire the lock for `key`, inserting its entry if needed.
    ///
    /// The returned guard holds the lock until dropped. Dropping also removes
    /// the map entry once no other waiter references it, so the table stays
    /// bounded by the number of keys currently in flight.
    pub async fn acquire(&self, key: &HashBinary) -> CollapseGuard<'_> {
        let key = key::to_u128(key);
        let mutex = {
            let mut shard = self.table.write(key);
            shard.entry(key).or_default().clone()
        };
        // the shard lock is not held while waiting
        let held = mutex.clone().lock_owned().await;
        CollapseGuard {
            table: &self.table,
            key,
            mutex,
            held: Some(held),
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

pub(crate) struct CollapseGuard<'a> {
    table: &'a ConcurrentHashTable<Arc<Mutex<()>>, N_SHARDS>,
    key: u128,
    mutex: Arc<Mutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for CollapseGuard<'_> {
    fn drop(&mut self) {
        // release first, then decide whether the entry can go away
        self.held.take();
        let mut shard = self.table.write(self.key);
        if let Some(entry) = shard.get(&self.key) {
            // two references left means the table's and ours: no waiter holds
            // a clone, so nobody can be queued on this mutex
            if Arc::ptr_eq(entry, &self.mutex) && Arc::strong_count(entry) <= 2 {
                shard.remove(&self.key);
            }
        }
    }
}

/// The single-flight set for background revalidations, keyed by object key.
pub(crate) struct RevalidateSet {
    table: ConcurrentHashTable<(), N_SHARDS>,
}

impl RevalidateSet {
    pub fn new() -> Self {
        RevalidateSet {
            table: ConcurrentHashTable::new(),
        }
    }

    /// Reserve `key`, or return `None` when a revalidation is already in
    /// flight for it. The reservation is released when the guard drops.
    pub fn try_reserve(&self, key: &HashBinary) -> Option<RevalidateGuard<'_>> {
        let key = key::to_u128(key);
        let mut shard = self.table.write(key);
        if shard.contains_key(&key) {
            return None;
        }
        shard.insert(key, ());
        Some(RevalidateGuard {
            table: &self.table,
            key,
        })
    }
}

pub(crate) struct RevalidateGuard<'a> {
    table: &'a ConcurrentHashTable<(), N_SHARDS>,
    key: u128,
}

impl Drop for RevalidateGuard<'_> {
    fn drop(&mut self) {
        self.table.write(self.key).remove(&self.key);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key(byte: u8) -> HashBinary {
        [byte; 16]
    }

    #[tokio::test]
    async fn test_collapse_reentry_after_release() {
        let map = CollapseMap::new();
        let guard = map.acquire(&key(1)).await;
        drop(guard);
        // the entry was cleaned up and the key can be taken again
        assert!(map.is_empty());
        let _guard = map.acquire(&key(1)).await;
    }

    #[tokio::test]
    async fn test_independent_keys_do_not_block() {
        let map = CollapseMap::new();
        let _a = map.acquire(&key(1)).await;
        // a different key must be acquirable while the first is held
        let _b = map.acquire(&key(2)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_collapse_serializes_holders() {
        let _ = env_logger::builder().is_test(true).try_init();
        let map = Arc::new(CollapseMap::new());
        let inside = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..16 {
            let map = map.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = map.acquire(&key(7)).await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(1)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(map.is_empty());
    }

    #[test]
    fn test_revalidate_single_flight() {
        let set = RevalidateSet::new();
        let first = set.try_reserve(&key(3));
        assert!(first.is_some());
        assert!(set.try_reserve(&key(3)).is_none());
        // other keys are unaffected
        assert!(set.try_reserve(&key(4)).is_some());
        drop(first);
        assert!(set.try_reserve(&key(3)).is_some());
    }
}
