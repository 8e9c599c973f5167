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

//! Owned request representation

use http::{HeaderMap, Method, Uri};
use std::borrow::Cow;

/// The request view the cache operates on: method, target and headers.
///
/// The body is never consulted, so it stays with the caller. The type is
/// `Clone` because a background revalidation outlives the request that
/// triggered it and must own its copy.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl Request {
    /// Create a [Request] with no headers.
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            headers: HeaderMap::new(),
        }
    }

    /// The URI path.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// The raw query string, empty when absent.
    pub fn query(&self) -> &str {
        self.uri.query().unwrap_or("")
    }

    // First value of the given header, empty when absent.
    pub(crate) fn header_value(&self, name: &str) -> &[u8] {
        self.headers
            .get(name)
            .map(|v| v.as_bytes())
            .unwrap_or(b"")
    }

    // Decoded query pairs in transport order.
    pub(crate) fn query_pairs(&self) -> impl Iterator<Item = (Cow<'_, str>, Cow<'_, str>)> {
        url::form_urlencoded::parse(self.query().as_bytes())
    }
}

impl From<http::request::Parts> for Request {
    fn from(parts: http::request::Parts) -> Self {
        Request {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
        }
    }
}
