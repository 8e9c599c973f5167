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

//! Buffered responses and the writer surface

use crate::policy::RESERVED_PREFIX;

use http::{HeaderMap, StatusCode};
use std::time::SystemTime;

/// The capability set of an HTTP response writer.
///
/// The wrapped origin handler writes through this trait. The cache hands it
/// either a [Response] buffer to capture the reply, or the caller's real
/// writer when the request passes through uncached.
pub trait ResponseWriter: Send {
    /// The headers written so far.
    fn headers(&self) -> &HeaderMap;

    /// Mutable access to the headers.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Record the response status. A later call overwrites an earlier one.
    fn set_status(&mut self, status: StatusCode);

    /// Append a chunk of body. Writing a body before any status records an
    /// implicit 200.
    fn append_body(&mut self, data: &[u8]);
}

/// A buffered response.
///
/// Doubles as the cache object: captured from the origin handler, stored in
/// the driver, replayed to clients. Once stored it is only ever mutated by
/// the stale-recache path, which rewrites `expires` on an owned copy.
#[derive(Debug, Clone)]
pub struct Response {
    // when the object was stored
    pub(crate) date: SystemTime,
    // when the object stops being fresh
    pub(crate) expires: SystemTime,
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Response {
    /// Create an empty response buffer.
    pub fn new() -> Self {
        Response {
            date: SystemTime::UNIX_EPOCH,
            expires: SystemTime::UNIX_EPOCH,
            status: None,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// The recorded status, 200 when the handler never set one.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    /// The body written so far.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replace the body. Compressors use this to swap the stored bytes.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    // The sentinel reply for an origin handler that overran its timeout.
    pub(crate) fn timed_out() -> Self {
        let mut response = Response::new();
        response.set_status(StatusCode::SERVICE_UNAVAILABLE);
        response.append_body(b"Timed out");
        response
    }

    // Copy the reply to a downstream writer. Directive headers under the
    // reserved prefix stay inside the cache.
    pub(crate) fn replay(&self, w: &mut (dyn ResponseWriter + Send)) {
        for (name, value) in self.headers.iter() {
            if name.as_str().starts_with(RESERVED_PREFIX) {
                continue;
            }
            w.headers_mut().append(name.clone(), value.clone());
        }
        w.set_status(self.status());
        w.append_body(&self.body);
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseWriter for Response {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    fn append_body(&mut self, data: &[u8]) {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.body.extend_from_slice(data);
    }
}

/// Forwards everything to a real writer while remembering the last status
/// set. Used when an unsafe method must stream the origin reply and the
/// cache still needs the status for its purge decision.
pub(crate) struct PassthroughWriter<'a> {
    inner: &'a mut (dyn ResponseWriter + Send),
    status: Option<StatusCode>,
}

impl<'a> PassthroughWriter<'a> {
    pub fn new(inner: &'a mut (dyn ResponseWriter + Send)) -> Self {
        PassthroughWriter {
            inner,
            status: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }
}

impl ResponseWriter for PassthroughWriter<'_> {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
        self.inner.set_status(status);
    }

    fn append_body(&mut self, data: &[u8]) {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.inner.append_body(data);
    }
}
