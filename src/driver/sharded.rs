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

//! A sharded LRU driver for contended workloads

use super::{Driver, DriverError};
use crate::hashtable::{ConcurrentLruCache, N_SHARDS};
use crate::key::{self, HashBinary};
use crate::policy::RequestOpts;
use crate::response::Response;

/// Like [super::LruDriver] but sharded 16 ways per map, trading exact global
/// LRU order for per-shard locks.
///
/// Each shard is bounded independently, so the effective capacity is
/// `capacity` rounded up to a multiple of the shard count and a hot shard can
/// evict before the total bound is reached.
pub struct ShardedLruDriver {
    opts: ConcurrentLruCache<RequestOpts, N_SHARDS>,
    objects: ConcurrentLruCache<Response, N_SHARDS>,
}

impl ShardedLruDriver {
    /// Create a new [ShardedLruDriver] bounded to roughly `capacity` entries
    /// per map.
    pub fn new(capacity: usize) -> Self {
        let shard_capacity = capacity.div_ceil(N_SHARDS);
        ShardedLruDriver {
            opts: ConcurrentLruCache::new(shard_capacity),
            objects: ConcurrentLruCache::new(shard_capacity),
        }
    }
}

impl Driver for ShardedLruDriver {
    fn set_request_opts(&self, key: HashBinary, opts: RequestOpts) -> Result<(), DriverError> {
        let key = key::to_u128(&key);
        self.opts.write(key).push(key, opts);
        Ok(())
    }

    fn get_request_opts(&self, key: &HashBinary) -> Option<RequestOpts> {
        let key = key::to_u128(key);
        self.opts.write(key).get(&key).cloned()
    }

    fn set(&self, key: HashBinary, response: Response) -> Result<(), DriverError> {
        let key = key::to_u128(&key);
        self.objects.write(key).push(key, response);
        Ok(())
    }

    fn get(&self, key: &HashBinary) -> Option<Response> {
        let key = key::to_u128(key);
        self.objects.write(key).get(&key).cloned()
    }

    fn remove(&self, key: &HashBinary) -> Result<(), DriverError> {
        let key = key::to_u128(key);
        self.objects.write(key).pop(&key);
        Ok(())
    }

    fn get_size(&self) -> usize {
        self.objects.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::response::ResponseWriter;
    use http::StatusCode;

    #[test]
    fn test_set_get_remove() {
        let driver = ShardedLruDriver::new(64);
        let key = [9u8; 16];
        assert!(driver.get(&key).is_none());

        let mut response = Response::new();
        response.set_status(StatusCode::OK);
        response.append_body(b"sharded");
        driver.set(key, response).unwrap();

        assert_eq!(driver.get(&key).unwrap().body(), b"sharded");
        assert_eq!(driver.get_size(), 1);
        driver.remove(&key).unwrap();
        assert!(driver.get(&key).is_none());
    }

    #[test]
    fn test_keys_spread_over_shards() {
        let driver = ShardedLruDriver::new(64);
        for byte in 0..32u8 {
            let mut key = [0u8; 16];
            key[15] = byte;
            driver.set(key, Response::new()).unwrap();
        }
        assert_eq!(driver.get_size(), 32);
    }
}
