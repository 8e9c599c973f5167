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

//! Stored-body compression

use crate::response::Response;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::warn;
use std::io::{Read, Write};

/// Compresses response bodies on store and expands them on fetch, reducing
/// the memory the driver holds per entry.
///
/// Status, headers and expiry metadata pass through untouched. An `expand`
/// that cannot decode its input must leave the response usable; the shipped
/// implementations log and return the input unchanged.
pub trait Compressor: Send + Sync {
    /// Compress a response before it is saved in the cache.
    fn compress(&self, response: Response) -> Response;

    /// Expand a response after it is retrieved from the cache.
    fn expand(&self, response: Response) -> Response;
}

/// A gzip [Compressor].
pub struct GzipCompressor {
    level: flate2::Compression,
}

impl GzipCompressor {
    /// Create a [GzipCompressor] with the given compression level (0-9).
    pub fn new(level: u32) -> Self {
        GzipCompressor {
            level: flate2::Compression::new(level),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        GzipCompressor {
            level: flate2::Compression::default(),
        }
    }
}

impl Compressor for GzipCompressor {
    fn compress(&self, mut response: Response) -> Response {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder.write_all(response.body()).unwrap(); // write to vec, never fails
        let body = encoder.finish().unwrap(); // ditto
        response.set_body(body);
        response
    }

    fn expand(&self, mut response: Response) -> Response {
        let mut decoder = GzDecoder::new(response.body());
        let mut body = Vec::new();
        match decoder.read_to_end(&mut body) {
            Ok(_) => response.set_body(body),
            Err(e) => warn!("gzip expand failed, serving stored bytes: {e}"),
        }
        response
    }
}

/// A zstd [Compressor].
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    /// Create a [ZstdCompressor] with the given compression level.
    pub fn new(level: i32) -> Self {
        ZstdCompressor { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        ZstdCompressor {
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, mut response: Response) -> Response {
        match zstd::stream::encode_all(response.body(), self.level) {
            Ok(body) => response.set_body(body),
            Err(e) => warn!("zstd compress failed, storing raw bytes: {e}"),
        }
        response
    }

    fn expand(&self, mut response: Response) -> Response {
        match zstd::stream::decode_all(response.body()) {
            Ok(body) => response.set_body(body),
            Err(e) => warn!("zstd expand failed, serving stored bytes: {e}"),
        }
        response
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::response::ResponseWriter;
    use http::StatusCode;

    fn sample() -> Response {
        let mut response = Response::new();
        response.set_status(StatusCode::OK);
        response
            .headers_mut()
            .insert("content-type", "text/plain".parse().unwrap());
        response.append_body(b"the same phrase over and over and over again");
        response
    }

    #[test]
    fn test_gzip_preserves_metadata() {
        let compressor = GzipCompressor::default();
        let stored = compressor.compress(sample());
        assert_ne!(stored.body(), sample().body());
        assert_eq!(stored.status(), StatusCode::OK);
        assert_eq!(stored.headers().get("content-type").unwrap(), "text/plain");

        let expanded = compressor.expand(stored);
        assert_eq!(expanded.body(), sample().body());
    }

    #[test]
    fn test_zstd_restores_body() {
        let compressor = ZstdCompressor::default();
        let expanded = compressor.expand(compressor.compress(sample()));
        assert_eq!(expanded.body(), sample().body());
        assert_eq!(expanded.headers().get("content-type").unwrap(), "text/plain");
    }
}
