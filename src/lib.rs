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

//! An in-process HTTP microcache middleware.
//!
//! The cache wraps an origin [Handler] and serves fresh, stale or freshly
//! fetched responses according to a per-fingerprint policy that the origin
//! negotiates through directive response headers. It collapses concurrent
//! misses into a single origin call, refreshes stale entries in the
//! background while replying immediately, and falls back to stale copies
//! when the origin fails. It is not a general HTTP/1.1 conditional cache:
//! there is no `ETag` or `Cache-Control` negotiation with the upstream, and
//! bodies are buffered whole.
//!
//! ```ignore
//! let cache = Microcache::new(Config {
//!     ttl: Duration::from_secs(10),
//!     stale_while_revalidate: Duration::from_secs(20),
//!     ..Config::default()
//! });
//! let handler = cache.clone().middleware(origin);
//! ```

use async_trait::async_trait;
use http::{header, HeaderName, HeaderValue, Method};
use log::warn;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

mod clock;
pub mod compression;
pub mod driver;
mod hashtable;
pub mod key;
mod lock;
pub mod monitor;
pub mod policy;
pub mod request;
pub mod response;

use clock::Clock;
use lock::{CollapseMap, RevalidateSet};
use response::PassthroughWriter;

pub use compression::{Compressor, GzipCompressor, ZstdCompressor};
pub use driver::{Driver, DriverError, LruDriver, ShardedLruDriver};
pub use key::HashBinary;
pub use monitor::{Monitor, MonitorFunc, Stats};
pub use policy::{RequestOpts, RESERVED_PREFIX};
pub use request::Request;
pub use response::{Response, ResponseWriter};

/// The response header exposing the cache outcome (`HIT`, `MISS`, `STALE`)
/// when [Config::exposed] is on.
pub const EXPOSURE_HEADER: &str = "microcache";

const DEFAULT_DRIVER_CAPACITY: usize = 10_000;

/// An origin handler the cache can wrap.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, req: &Request, w: &mut (dyn ResponseWriter + Send));
}

/// Wrap a plain function as a [Handler].
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&Request, &mut (dyn ResponseWriter + Send)) + Send + Sync + 'static,
{
    struct HandlerFn<F>(F);

    #[async_trait]
    impl<F> Handler for HandlerFn<F>
    where
        F: Fn(&Request, &mut (dyn ResponseWriter + Send)) + Send + Sync,
    {
        async fn serve(&self, req: &Request, w: &mut (dyn ResponseWriter + Send)) {
            (self.0)(req, w)
        }
    }

    Arc::new(HandlerFn(f))
}

/// Cache configuration. Every field has a zero-ish default; start from
/// `Config::default()` and override what the deployment needs.
pub struct Config {
    /// Do not cache responses unless the origin opts in with the
    /// `microcache-cache` directive header.
    pub nocache: bool,

    /// Maximum origin execution time. A handler exceeding it is cancelled
    /// and its reply treated as a 503.
    pub timeout: Option<Duration>,

    /// Default freshness duration for cacheable responses. Overridable per
    /// fingerprint via the `microcache-ttl` directive.
    pub ttl: Duration,

    /// Window after expiry during which a stale object may serve immediately
    /// while a background fetch refreshes it.
    pub stale_while_revalidate: Duration,

    /// Window after expiry during which a stale object may serve when the
    /// origin fails with a 5xx or times out.
    pub stale_if_error: Duration,

    /// When serving stale on origin error, push `expires` forward by the
    /// ttl so followers hit instead of retrying the failing origin.
    pub stale_recache: bool,

    /// Collapse concurrent requests with the same request key into a single
    /// origin call.
    pub collapsed_forwarding: bool,

    /// Include the query string in the request key.
    pub hash_query: bool,

    /// Query parameter names excluded from the request key when
    /// [Config::hash_query] is on. Empty means no filtering.
    pub query_ignore: Vec<String>,

    /// Request headers all requests are differentiated by, in order.
    /// Consider normalizing these upstream.
    pub vary: Vec<String>,

    /// Storage backing both cache maps. `None` disables caching entirely.
    pub driver: Option<Arc<dyn Driver>>,

    /// Optional body compression applied on store and undone on fetch.
    pub compressor: Option<Arc<dyn Compressor>>,

    /// Optional periodic statistics sink.
    pub monitor: Option<Arc<dyn Monitor>>,

    /// Emit the [EXPOSURE_HEADER] on every cached-path response.
    pub exposed: bool,

    /// Omit the `Age` header on hits and stale serves.
    pub suppress_age_header: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            nocache: false,
            timeout: None,
            ttl: Duration::ZERO,
            stale_while_revalidate: Duration::ZERO,
            stale_if_error: Duration::ZERO,
            stale_recache: false,
            collapsed_forwarding: false,
            hash_query: false,
            query_ignore: Vec::new(),
            vary: Vec::new(),
            driver: Some(Arc::new(LruDriver::new(DEFAULT_DRIVER_CAPACITY))),
            compressor: None,
            monitor: None,
            exposed: false,
            suppress_age_header: false,
        }
    }
}

struct MonitorLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// The microcache engine.
///
/// One instance serves any number of wrapped handlers and any number of
/// concurrent requests. Obtain handlers via [Microcache::middleware].
pub struct Microcache {
    timeout: Option<Duration>,
    pub(crate) hash_query: bool,
    pub(crate) query_ignore: HashSet<String>,
    collapsed_forwarding: bool,
    exposed: bool,
    suppress_age_header: bool,
    // global defaults each fingerprint's policy resolution starts from
    pub(crate) defaults: RequestOpts,
    driver: Option<Arc<dyn Driver>>,
    compressor: Option<Arc<dyn Compressor>>,
    monitor: Option<Arc<dyn Monitor>>,
    pub(crate) clock: Clock,
    collapse: CollapseMap,
    revalidating: RevalidateSet,
    monitor_loop: Mutex<Option<MonitorLoop>>,
}

impl Microcache {
    /// Create a new [Microcache] from `config`.
    pub fn new(config: Config) -> Arc<Microcache> {
        let defaults = RequestOpts {
            nocache: config.nocache,
            ttl: config.ttl,
            stale_if_error: config.stale_if_error,
            stale_while_revalidate: config.stale_while_revalidate,
            stale_recache: config.stale_recache,
            collapsed_forwarding: config.collapsed_forwarding,
            vary: config.vary,
            vary_query: Vec::new(),
        };
        Arc::new(Microcache {
            timeout: config.timeout,
            hash_query: config.hash_query,
            query_ignore: config.query_ignore.into_iter().collect(),
            collapsed_forwarding: config.collapsed_forwarding,
            exposed: config.exposed,
            suppress_age_header: config.suppress_age_header,
            defaults,
            driver: config.driver,
            compressor: config.compressor,
            monitor: config.monitor,
            clock: Clock::new(),
            collapse: CollapseMap::new(),
            revalidating: RevalidateSet::new(),
            monitor_loop: Mutex::new(None),
        })
    }

    /// Wrap `inner` with caching. The returned [CachedHandler] implements
    /// [Handler] itself, so wrapped handlers compose like any other.
    pub fn middleware(self: Arc<Self>, inner: Arc<dyn Handler>) -> CachedHandler {
        CachedHandler { cache: self, inner }
    }

    /// Launch the monitor loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut slot = self.monitor_loop.lock();
        if slot.is_some() {
            return;
        }
        let (stop, mut stopped) = watch::channel(false);
        let monitor = self.monitor.clone();
        let driver = self.driver.clone();
        let handle = tokio::spawn(async move {
            let Some(monitor) = monitor else {
                // nothing to report, hold the loop open for stop()
                let _ = stopped.changed().await;
                return;
            };
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(monitor.interval()) => {
                        let size = driver.as_ref().map(|d| d.get_size()).unwrap_or(0);
                        monitor.log(Stats { size, ..Stats::default() });
                    }
                    _ = stopped.changed() => return,
                }
            }
        });
        *slot = Some(MonitorLoop { stop, handle });
    }

    /// Signal the monitor loop to terminate and wait until it has. Completes
    /// cleanly when no monitor is attached or the loop never started.
    pub async fn stop(&self) {
        let running = self.monitor_loop.lock().take();
        if let Some(running) = running {
            let _ = running.stop.send(true);
            let _ = running.handle.await;
        }
    }

    /// Shift the cache's clock forward by `delta`.
    ///
    /// All expiration math reads from this clock, so tests can walk entries
    /// through their freshness windows without sleeping.
    pub fn advance_clock(&self, delta: Duration) {
        self.clock.advance(delta);
    }

    fn store(&self, driver: &dyn Driver, key: HashBinary, response: Response) {
        let response = match &self.compressor {
            Some(compressor) => compressor.compress(response),
            None => response,
        };
        if let Err(e) = driver.set(key, response) {
            warn!("failed to store response for {}: {e}", key::hex(&key));
        }
    }

    fn fetch(&self, driver: &dyn Driver, key: &HashBinary) -> Option<Response> {
        let response = driver.get(key)?;
        Some(match &self.compressor {
            Some(compressor) => compressor.expand(response),
            None => response,
        })
    }

    fn expose(&self, w: &mut (dyn ResponseWriter + Send), state: &'static str) {
        if self.exposed {
            w.headers_mut().insert(
                HeaderName::from_static(EXPOSURE_HEADER),
                HeaderValue::from_static(state),
            );
        }
    }

    fn set_age(&self, obj: &Response, now: SystemTime, w: &mut (dyn ResponseWriter + Send)) {
        if self.suppress_age_header {
            return;
        }
        let age = now.duration_since(obj.date).unwrap_or_default().as_secs();
        w.headers_mut().insert(header::AGE, HeaderValue::from(age));
    }

    fn tick_hit(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.hit();
        }
    }

    fn tick_miss(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.miss();
        }
    }

    fn tick_stale(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.stale();
        }
    }

    fn tick_backend(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.backend();
        }
    }

    fn tick_error(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.error();
        }
    }
}

/// A [Handler] that consults the cache before, and instead of, its wrapped
/// origin.
#[derive(Clone)]
pub struct CachedHandler {
    cache: Arc<Microcache>,
    inner: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for CachedHandler {
    async fn serve(&self, req: &Request, w: &mut (dyn ResponseWriter + Send)) {
        let cache = self.cache.as_ref();

        // Websocket upgrades and a disabled driver pass straight through
        let upgrade = req
            .headers
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("upgrade"));
        let driver = match cache.driver.as_ref() {
            Some(driver) if !upgrade => driver,
            _ => {
                cache.tick_miss();
                self.inner.serve(req, w).await;
                return;
            }
        };

        let req_key = key::request_key(cache, req);
        let mut opts = driver.get_request_opts(&req_key);

        // Hard passthrough once the fingerprint is known uncacheable
        if opts.as_ref().is_some_and(|o| o.nocache) {
            cache.tick_miss();
            self.inner.serve(req, w).await;
            return;
        }

        // Collapse gate: serialize per request key, then re-read the opts a
        // predecessor may have just installed
        let _collapse = if cache.collapsed_forwarding {
            let guard = cache.collapse.acquire(&req_key).await;
            if opts.is_none() {
                opts = driver.get_request_opts(&req_key);
            }
            Some(guard)
        } else {
            None
        };

        let (obj_key, obj) = match opts.as_ref() {
            Some(o) => {
                let obj_key = key::object_key(&req_key, o, req);
                (obj_key, cache.fetch(driver.as_ref(), &obj_key))
            }
            // tentative key, nothing is stored under it until opts resolve
            None => (
                key::object_key(&req_key, &RequestOpts::default(), req),
                None,
            ),
        };
        let now = cache.clock.now();

        // Unsafe methods bypass the cache, and a successful one must purge
        // the object so later reads cannot observe the overwritten state
        if req.method != Method::GET && req.method != Method::HEAD {
            cache.tick_miss();
            if obj.is_some() {
                let mut ptw = PassthroughWriter::new(w);
                self.inner.serve(req, &mut ptw).await;
                let status = ptw.status();
                if status.is_success() || status.is_redirection() {
                    if let Err(e) = driver.remove(&obj_key) {
                        warn!("purge failed for {}: {e}", key::hex(&obj_key));
                    }
                }
            } else {
                self.inner.serve(req, w).await;
            }
            return;
        }

        if let Some(obj_ref) = obj.as_ref() {
            // Fresh hit
            if obj_ref.expires > now {
                cache.tick_hit();
                cache.expose(w, "HIT");
                cache.set_age(obj_ref, now, w);
                obj_ref.replay(w);
                return;
            }

            // Stale while revalidate: reply immediately and refresh in the
            // background. The task owns its copies, so finishing or dropping
            // this request cannot cancel the refresh.
            let swr = opts
                .as_ref()
                .map(|o| o.stale_while_revalidate)
                .unwrap_or_default();
            if !swr.is_zero() && now < obj_ref.expires + swr {
                cache.tick_stale();
                cache.expose(w, "STALE");
                cache.set_age(obj_ref, now, w);
                obj_ref.replay(w);

                let this = self.clone();
                let req = req.clone();
                let opts = opts.clone();
                let old = obj_ref.clone();
                tokio::spawn(async move {
                    this.run_backend(&req, req_key, opts, obj_key, Some(old), None)
                        .await;
                });
                return;
            }
        }

        self.run_backend(req, req_key, opts, obj_key, obj, Some(w))
            .await;
    }
}

impl CachedHandler {
    // The origin-facing path, either on behalf of a waiting request
    // (`foreground` set) or as a detached revalidation (`foreground` empty).
    async fn run_backend(
        &self,
        req: &Request,
        req_key: HashBinary,
        opts: Option<RequestOpts>,
        obj_key: HashBinary,
        old: Option<Response>,
        mut foreground: Option<&mut (dyn ResponseWriter + Send)>,
    ) {
        let cache = self.cache.as_ref();
        let revalidating = foreground.is_none();

        // Revalidation is single flight per object key. Contenders abandon:
        // their stale reply is already out, nobody is waiting on them.
        let _flight = if revalidating {
            match cache.revalidating.try_reserve(&obj_key) {
                Some(guard) => Some(guard),
                None => return,
            }
        } else {
            None
        };
        let Some(driver) = cache.driver.as_ref() else {
            return;
        };

        cache.tick_backend();

        // Execute the wrapped handler into a fresh buffer, bounded by the
        // configured timeout. On expiry the handler future is dropped and
        // the reply becomes the 503 sentinel.
        let mut beres = Response::new();
        let completed = match cache.timeout {
            Some(limit) if !limit.is_zero() => {
                tokio::time::timeout(limit, self.inner.serve(req, &mut beres))
                    .await
                    .is_ok()
            }
            _ => {
                self.inner.serve(req, &mut beres).await;
                true
            }
        };
        if !completed {
            warn!("backend timed out for {}", req.path());
            beres = Response::timed_out();
        }

        let now = cache.clock.now();
        let status = beres.status();

        // Origin failure: serve the old object while its stale-if-error
        // window holds, optionally pushing its expiry forward
        if status.as_u16() >= 500 {
            cache.tick_error();
            if let (Some(old_obj), Some(o)) = (old.as_ref(), opts.as_ref()) {
                let serve_stale = now < old_obj.expires + o.stale_if_error;
                if serve_stale && o.stale_recache {
                    let mut recached = old_obj.clone();
                    recached.expires = now + o.ttl;
                    cache.store(driver.as_ref(), obj_key, recached);
                }
                if serve_stale {
                    if let Some(w) = foreground.take() {
                        cache.tick_stale();
                        cache.expose(w, "STALE");
                        cache.set_age(old_obj, now, w);
                        old_obj.replay(w);
                        return;
                    }
                }
            }
        }

        // Success: resolve the fingerprint's policy on first sight, then
        // cache the reply under the (possibly recomputed) object key
        let mut obj_key = obj_key;
        if status.is_success() || status.is_redirection() {
            let resolved = match opts {
                Some(o) => o,
                None => {
                    let o = RequestOpts::from_response(&cache.defaults, beres.headers());
                    // opts persist before the object they key
                    if let Err(e) = driver.set_request_opts(req_key, o.clone()) {
                        warn!(
                            "failed to store request opts for {}: {e}",
                            key::hex(&req_key)
                        );
                    }
                    obj_key = key::object_key(&req_key, &o, req);
                    o
                }
            };
            if !resolved.nocache {
                beres.date = now;
                beres.expires = now + resolved.ttl;
                cache.store(driver.as_ref(), obj_key, beres.clone());
            }
        }

        if let Some(w) = foreground {
            cache.tick_miss();
            cache.expose(w, "MISS");
            beres.replay(w);
        }
    }
}
