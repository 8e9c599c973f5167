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

//! Cache statistics collection

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A statistics snapshot handed to the monitor on every reporting tick.
///
/// Counter fields cover traffic since the previous tick; `size` is the
/// driver's current object count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub stales: u64,
    pub backend: u64,
    pub errors: u64,
}

/// Periodic statistics sink.
///
/// The engine ticks the counter methods from the request path and calls
/// [Monitor::log] from its monitor loop every [Monitor::interval], with
/// `Stats::size` already filled in. Implementations are expected to drain
/// their counters into the snapshot on each `log` call.
pub trait Monitor: Send + Sync {
    /// How often [Monitor::log] is invoked.
    fn interval(&self) -> Duration;

    /// Report a snapshot. Called from the monitor loop only.
    fn log(&self, stats: Stats);

    fn hit(&self);
    fn miss(&self);
    fn stale(&self);
    fn backend(&self);
    fn error(&self);
}

/// Adapts a plain function into a [Monitor].
///
/// Counters are atomics; `log` drains them with a swap to zero, so sums
/// across ticks equal total traffic.
pub struct MonitorFunc {
    interval: Duration,
    log_fn: Box<dyn Fn(Stats) + Send + Sync>,
    hits: AtomicU64,
    misses: AtomicU64,
    stales: AtomicU64,
    backend: AtomicU64,
    errors: AtomicU64,
}

impl MonitorFunc {
    /// Create a [MonitorFunc] reporting to `log_fn` every `interval`.
    pub fn new(interval: Duration, log_fn: impl Fn(Stats) + Send + Sync + 'static) -> Self {
        MonitorFunc {
            interval,
            log_fn: Box::new(log_fn),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stales: AtomicU64::new(0),
            backend: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
impl MonitorFunc {
    // Non-draining view of the counters.
    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            size: 0,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stales: self.stales.load(Ordering::Relaxed),
            backend: self.backend.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

impl Monitor for MonitorFunc {
    fn interval(&self) -> Duration {
        self.interval
    }

    fn log(&self, mut stats: Stats) {
        stats.hits = self.hits.swap(0, Ordering::Relaxed);
        stats.misses = self.misses.swap(0, Ordering::Relaxed);
        stats.stales = self.stales.swap(0, Ordering::Relaxed);
        stats.backend = self.backend.swap(0, Ordering::Relaxed);
        stats.errors = self.errors.swap(0, Ordering::Relaxed);
        (self.log_fn)(stats);
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn stale(&self) {
        self.stales.fetch_add(1, Ordering::Relaxed);
    }

    fn backend(&self) {
        self.backend.fetch_add(1, Ordering::Relaxed);
    }

    fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_log_drains_counters() {
        let reports: Arc<Mutex<Vec<Stats>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let monitor = MonitorFunc::new(Duration::from_secs(1), move |stats| {
            sink.lock().push(stats);
        });

        monitor.hit();
        monitor.hit();
        monitor.miss();
        monitor.stale();
        monitor.backend();
        monitor.error();

        monitor.log(Stats {
            size: 7,
            ..Stats::default()
        });
        // a second tick with no traffic reports zeroes
        monitor.log(Stats::default());

        let reports = reports.lock();
        assert_eq!(
            reports[0],
            Stats {
                size: 7,
                hits: 2,
                misses: 1,
                stales: 1,
                backend: 1,
                errors: 1,
            }
        );
        assert_eq!(reports[1], Stats::default());
    }
}
