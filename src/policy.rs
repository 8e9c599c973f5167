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

//! Per-fingerprint cache policy and its derivation from directive headers

use http::header::VARY;
use http::HeaderMap;
use std::time::Duration;

/// The directive-header namespace. Headers with this prefix configure the
/// cache and are stripped before any reply reaches a client.
pub const RESERVED_PREFIX: &str = "microcache-";

// Directive header names. All values are set by the origin on its response.
const CACHE: &str = "microcache-cache";
const NOCACHE: &str = "microcache-nocache";
const TTL: &str = "microcache-ttl";
const STALE_IF_ERROR: &str = "microcache-stale-if-error";
const STALE_WHILE_REVALIDATE: &str = "microcache-stale-while-revalidate";
const COLLAPSED_FORWARDING: &str = "microcache-collapsed-forwarding";
const NO_COLLAPSED_FORWARDING: &str = "microcache-no-collapsed-forwarding";
const STALE_RECACHE: &str = "microcache-stale-recache";
const NO_STALE_RECACHE: &str = "microcache-no-stale-recache";
const VARY_QUERY: &str = "microcache-vary-query";
const VARY_DIRECTIVE: &str = "microcache-vary";

/// Cache policy for one request fingerprint.
///
/// Resolved once, from the first successful response observed for the
/// fingerprint, and cached in the driver so later requests can compute their
/// object key and branch without consulting the origin. An absent record
/// behaves as all zeroes: no freshness, no stale windows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOpts {
    pub nocache: bool,
    pub ttl: Duration,
    pub stale_if_error: Duration,
    pub stale_while_revalidate: Duration,
    pub stale_recache: bool,
    pub collapsed_forwarding: bool,
    /// Request headers the object key varies on, in digest order.
    pub vary: Vec<String>,
    /// Query params the object key varies on, in digest order.
    pub vary_query: Vec<String>,
}

impl RequestOpts {
    /// Overlay the directive headers of a captured origin response on the
    /// global defaults.
    ///
    /// Toggles apply in a fixed order with later directives winning. Numeric
    /// directives that fail to parse or are not positive are ignored.
    pub(crate) fn from_response(defaults: &RequestOpts, headers: &HeaderMap) -> RequestOpts {
        let mut opts = defaults.clone();

        if present(headers, CACHE) {
            opts.nocache = false;
        }
        if present(headers, NOCACHE) {
            opts.nocache = true;
        }
        if let Some(ttl) = seconds(headers, TTL) {
            opts.ttl = ttl;
        }
        if let Some(window) = seconds(headers, STALE_IF_ERROR) {
            opts.stale_if_error = window;
        }
        if let Some(window) = seconds(headers, STALE_WHILE_REVALIDATE) {
            opts.stale_while_revalidate = window;
        }
        if present(headers, COLLAPSED_FORWARDING) {
            opts.collapsed_forwarding = true;
        }
        if present(headers, NO_COLLAPSED_FORWARDING) {
            opts.collapsed_forwarding = false;
        }
        if present(headers, STALE_RECACHE) {
            opts.stale_recache = true;
        }
        if present(headers, NO_STALE_RECACHE) {
            opts.stale_recache = false;
        }

        opts.vary_query.extend(list_values(headers, VARY_QUERY));
        opts.vary.extend(list_values(headers, VARY_DIRECTIVE));
        // the standard Vary header contributes to the effective vary as well
        opts.vary.extend(list_values(headers, VARY.as_str()));

        opts
    }
}

fn present(headers: &HeaderMap, name: &str) -> bool {
    headers.get(name).is_some_and(|v| !v.as_bytes().is_empty())
}

fn seconds(headers: &HeaderMap, name: &str) -> Option<Duration> {
    let value = headers.get(name)?.to_str().ok()?;
    let secs: u64 = value.trim().parse().ok()?;
    (secs > 0).then(|| Duration::from_secs(secs))
}

// All values of a comma-list header, trimmed, empty entries dropped.
fn list_values<'a>(headers: &'a HeaderMap, name: &str) -> impl Iterator<Item = String> + 'a {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
}

#[cfg(test)]
mod test {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                http::HeaderName::try_from(*name).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    fn defaults() -> RequestOpts {
        RequestOpts {
            ttl: Duration::from_secs(10),
            vary: vec!["accept-encoding".to_string()],
            ..RequestOpts::default()
        }
    }

    #[test]
    fn test_defaults_pass_through() {
        let opts = RequestOpts::from_response(&defaults(), &headers(&[]));
        assert_eq!(opts, defaults());
    }

    #[test]
    fn test_nocache_toggles() {
        let base = RequestOpts {
            nocache: true,
            ..defaults()
        };
        let opts = RequestOpts::from_response(&base, &headers(&[("microcache-cache", "1")]));
        assert!(!opts.nocache);

        // nocache wins over cache when both are present
        let opts = RequestOpts::from_response(
            &defaults(),
            &headers(&[("microcache-cache", "1"), ("microcache-nocache", "1")]),
        );
        assert!(opts.nocache);
    }

    #[test]
    fn test_empty_directive_ignored() {
        let opts = RequestOpts::from_response(&defaults(), &headers(&[("microcache-nocache", "")]));
        assert!(!opts.nocache);
    }

    #[test]
    fn test_numeric_directives() {
        let opts = RequestOpts::from_response(
            &defaults(),
            &headers(&[
                ("microcache-ttl", "30"),
                ("microcache-stale-if-error", " 600 "),
                ("microcache-stale-while-revalidate", "20"),
            ]),
        );
        assert_eq!(opts.ttl, Duration::from_secs(30));
        assert_eq!(opts.stale_if_error, Duration::from_secs(600));
        assert_eq!(opts.stale_while_revalidate, Duration::from_secs(20));
    }

    #[test]
    fn test_bad_numeric_directives_ignored() {
        let opts = RequestOpts::from_response(
            &defaults(),
            &headers(&[
                ("microcache-ttl", "0"),
                ("microcache-stale-if-error", "-5"),
                ("microcache-stale-while-revalidate", "soon"),
            ]),
        );
        assert_eq!(opts.ttl, Duration::from_secs(10));
        assert_eq!(opts.stale_if_error, Duration::ZERO);
        assert_eq!(opts.stale_while_revalidate, Duration::ZERO);
    }

    #[test]
    fn test_boolean_toggles() {
        let opts = RequestOpts::from_response(
            &defaults(),
            &headers(&[
                ("microcache-collapsed-forwarding", "1"),
                ("microcache-stale-recache", "1"),
            ]),
        );
        assert!(opts.collapsed_forwarding);
        assert!(opts.stale_recache);

        let opts = RequestOpts::from_response(
            &opts,
            &headers(&[
                ("microcache-no-collapsed-forwarding", "1"),
                ("microcache-no-stale-recache", "1"),
            ]),
        );
        assert!(!opts.collapsed_forwarding);
        assert!(!opts.stale_recache);
    }

    #[test]
    fn test_vary_append_order() {
        let opts = RequestOpts::from_response(
            &defaults(),
            &headers(&[
                ("microcache-vary", "x-tenant, x-region"),
                ("vary", "accept-language"),
            ]),
        );
        assert_eq!(
            opts.vary,
            vec!["accept-encoding", "x-tenant", "x-region", "accept-language"]
        );
    }

    #[test]
    fn test_vary_query_comma_list() {
        let opts = RequestOpts::from_response(
            &defaults(),
            &headers(&[
                ("microcache-vary-query", "q, page"),
                ("microcache-vary-query", "limit,,"),
            ]),
        );
        assert_eq!(opts.vary_query, vec!["q", "page", "limit"]);
    }
}
