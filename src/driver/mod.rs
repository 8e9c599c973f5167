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

//! Cache storage abstraction
//!
//! A driver backs two bounded associative maps: request options per request
//! key and response objects per object key. Drivers may evict at will under
//! pressure; the engine tolerates any entry disappearing. Driver errors never
//! propagate to clients, the engine degrades to a miss instead.

use crate::key::HashBinary;
use crate::policy::RequestOpts;
use crate::response::Response;

use thiserror::Error;

mod lru;
mod sharded;

pub use lru::LruDriver;
pub use sharded::ShardedLruDriver;

/// Error reported by a driver operation.
#[derive(Debug, Error)]
#[error("cache driver: {0}")]
pub struct DriverError(String);

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        DriverError(message.into())
    }
}

/// Bounded storage interface.
///
/// Implementations are internally synchronized. Lookups return `None` both
/// on a true miss and on any internal failure.
pub trait Driver: Send + Sync {
    /// Store the resolved options for a request key.
    fn set_request_opts(&self, key: HashBinary, opts: RequestOpts) -> Result<(), DriverError>;

    /// Fetch the options for a request key.
    fn get_request_opts(&self, key: &HashBinary) -> Option<RequestOpts>;

    /// Store a response object under its object key.
    fn set(&self, key: HashBinary, response: Response) -> Result<(), DriverError>;

    /// Fetch the response object for an object key.
    fn get(&self, key: &HashBinary) -> Option<Response>;

    /// Remove the response object for an object key.
    fn remove(&self, key: &HashBinary) -> Result<(), DriverError>;

    /// The number of response objects currently stored. May approximate if an
    /// exact count is expensive; only the monitor reads it.
    fn get_size(&self) -> usize;
}
