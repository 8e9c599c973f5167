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

//! The default LRU driver, built on the `lru` crate

use super::{Driver, DriverError};
use crate::key::HashBinary;
use crate::policy::RequestOpts;
use crate::response::Response;

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// A driver holding both maps in globally locked [LruCache]s.
///
/// `capacity` bounds each map by entry count. Memory use is roughly
/// `capacity * average response size`, so size it with the workload's bodies
/// in mind.
pub struct LruDriver {
    opts: Mutex<LruCache<HashBinary, RequestOpts>>,
    objects: Mutex<LruCache<HashBinary, Response>>,
}

impl LruDriver {
    /// Create a new [LruDriver] bounded to `capacity` entries per map.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        LruDriver {
            opts: Mutex::new(LruCache::new(capacity)),
            objects: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl Driver for LruDriver {
    fn set_request_opts(&self, key: HashBinary, opts: RequestOpts) -> Result<(), DriverError> {
        self.opts.lock().put(key, opts);
        Ok(())
    }

    fn get_request_opts(&self, key: &HashBinary) -> Option<RequestOpts> {
        self.opts.lock().get(key).cloned()
    }

    fn set(&self, key: HashBinary, response: Response) -> Result<(), DriverError> {
        self.objects.lock().put(key, response);
        Ok(())
    }

    fn get(&self, key: &HashBinary) -> Option<Response> {
        self.objects.lock().get(key).cloned()
    }

    fn remove(&self, key: &HashBinary) -> Result<(), DriverError> {
        self.objects.lock().pop(key);
        Ok(())
    }

    fn get_size(&self) -> usize {
        self.objects.lock().len()
    }
}
