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

//! Cache key fingerprints
//!
//! Two digests per request. The request key buckets requests by path, the
//! globally configured vary headers and the query policy. The object key
//! extends it with the vary terms the first response dictated, so it can only
//! be computed once the fingerprint's [RequestOpts] are known.

use crate::policy::RequestOpts;
use crate::request::Request;
use crate::Microcache;

use blake2::{Blake2b, Digest};

// 16-byte / 128-bit key: large enough to avoid collision
const KEY_SIZE: usize = 16;

/// A 128 bit hash binary
pub type HashBinary = [u8; KEY_SIZE];

// We keep blake2 for key hashing like the rest of our caching stack.
// Collision resistance matters more than raw speed here, and hashes with
// machine-dependent output would break nothing but are pointless to risk.
pub(crate) type Blake2b128 = Blake2b<blake2::digest::consts::U16>;

// Hex rendering for log lines.
pub(crate) fn hex(key: &HashBinary) -> String {
    hex::encode(key)
}

// The shard key used by the per-key state tables.
pub(crate) fn to_u128(key: &HashBinary) -> u128 {
    // endianness doesn't matter
    u128::from_be_bytes(*key)
}

/// Digest identifying the coarse cache bucket for a request.
pub(crate) fn request_key(cache: &Microcache, req: &Request) -> HashBinary {
    let mut hasher = Blake2b128::new();
    hasher.update(req.path().as_bytes());
    for name in &cache.defaults.vary {
        hasher.update(b"&");
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(req.header_value(name));
    }
    if cache.hash_query {
        if cache.query_ignore.is_empty() {
            hasher.update(req.query().as_bytes());
        } else {
            // Decoded pairs, ignored names dropped, stable-sorted by name so
            // that parameter order on the wire cannot split the bucket.
            let mut pairs: Vec<(String, String)> = req
                .query_pairs()
                .filter(|(name, _)| !cache.query_ignore.contains(name.as_ref()))
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            for (name, value) in &pairs {
                hasher.update(b"&");
                hasher.update(name.as_bytes());
                hasher.update(b"=");
                hasher.update(value.as_bytes());
            }
        }
    }
    hasher.finalize().into()
}

/// Digest uniquely identifying a stored response: the request key extended
/// with the response-dictated vary terms.
pub(crate) fn object_key(
    request_key: &HashBinary,
    opts: &RequestOpts,
    req: &Request,
) -> HashBinary {
    let mut hasher = Blake2b128::new();
    hasher.update(request_key);
    for name in &opts.vary {
        hasher.update(b"&");
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(req.header_value(name));
    }
    for param in &opts.vary_query {
        // every value of the param, in transport order
        for (name, value) in req.query_pairs() {
            if name.as_ref() == param {
                hasher.update(b"&");
                hasher.update(name.as_bytes());
                hasher.update(b"=");
                hasher.update(value.as_bytes());
            }
        }
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Config;
    use http::Method;
    use std::sync::Arc;
    use std::time::Duration;

    fn get(uri: &str) -> Request {
        Request::new(Method::GET, uri.parse().unwrap())
    }

    fn get_with(uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut req = get(uri);
        for (name, value) in headers {
            req.headers.append(
                http::HeaderName::try_from(*name).unwrap(),
                value.parse().unwrap(),
            );
        }
        req
    }

    fn engine(config: Config) -> Arc<Microcache> {
        Microcache::new(config)
    }

    #[test]
    fn test_query_ignored_without_hash_query() {
        let cache = engine(Config::default());
        assert_eq!(
            request_key(&cache, &get("/a")),
            request_key(&cache, &get("/a?x=1"))
        );
        assert_ne!(
            request_key(&cache, &get("/a")),
            request_key(&cache, &get("/b"))
        );
    }

    #[test]
    fn test_raw_query_is_order_sensitive() {
        let cache = engine(Config {
            hash_query: true,
            ..Config::default()
        });
        assert_ne!(
            request_key(&cache, &get("/")),
            request_key(&cache, &get("/?a=1"))
        );
        assert_ne!(
            request_key(&cache, &get("/?a=1&b=2")),
            request_key(&cache, &get("/?b=2&a=1"))
        );
    }

    #[test]
    fn test_filtered_query_is_sorted() {
        let cache = engine(Config {
            hash_query: true,
            query_ignore: vec!["utm".to_string()],
            ..Config::default()
        });
        // deterministic across wire order once a filter set is configured
        assert_eq!(
            request_key(&cache, &get("/?a=1&b=2")),
            request_key(&cache, &get("/?b=2&a=1"))
        );
        // ignored params do not split the bucket
        assert_eq!(
            request_key(&cache, &get("/?a=1")),
            request_key(&cache, &get("/?a=1&utm=9"))
        );
        assert_ne!(
            request_key(&cache, &get("/?a=1")),
            request_key(&cache, &get("/?a=2"))
        );
    }

    #[test]
    fn test_global_vary_headers() {
        let cache = engine(Config {
            vary: vec!["accept-language".to_string()],
            ..Config::default()
        });
        let en = get_with("/", &[("accept-language", "en")]);
        let de = get_with("/", &[("accept-language", "de")]);
        assert_ne!(request_key(&cache, &en), request_key(&cache, &de));
        assert_eq!(
            request_key(&cache, &en),
            request_key(&cache, &get_with("/", &[("accept-language", "en")]))
        );
    }

    #[test]
    fn test_object_key_varies_on_headers() {
        let cache = engine(Config::default());
        let opts = RequestOpts {
            ttl: Duration::from_secs(30),
            vary: vec!["x-tenant".to_string()],
            ..RequestOpts::default()
        };
        let base = request_key(&cache, &get("/"));
        let a = object_key(&base, &opts, &get_with("/", &[("x-tenant", "a")]));
        let b = object_key(&base, &opts, &get_with("/", &[("x-tenant", "b")]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_object_key_varies_on_query_params() {
        let cache = engine(Config::default());
        let opts = RequestOpts {
            vary_query: vec!["q".to_string()],
            ..RequestOpts::default()
        };
        let base = request_key(&cache, &get("/"));
        let q1 = object_key(&base, &opts, &get("/?q=1"));
        let q2 = object_key(&base, &opts, &get("/?q=2"));
        let none = object_key(&base, &opts, &get("/?other=1"));
        assert_ne!(q1, q2);
        // params outside the vary-query list contribute nothing
        assert_eq!(none, object_key(&base, &opts, &get("/")));
        // repeated values are position sensitive
        assert_ne!(
            object_key(&base, &opts, &get("/?q=1&q=2")),
            object_key(&base, &opts, &get("/?q=2&q=1"))
        );
    }

    #[test]
    fn test_object_key_with_default_opts_is_stable() {
        let cache = engine(Config::default());
        let base = request_key(&cache, &get("/"));
        assert_eq!(
            object_key(&base, &RequestOpts::default(), &get("/")),
            object_key(&base, &RequestOpts::default(), &get("/"))
        );
        assert_ne!(base, object_key(&base, &RequestOpts::default(), &get("/")));
    }
}
