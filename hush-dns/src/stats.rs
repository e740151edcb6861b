//! Rolling per-minute statistics
//!
//! Sixty buckets cover the trailing hour. Advancing time zeroes the buckets
//! between the previous update and now, so stale minutes never leak into
//! the aggregate. A reporter task logs the aggregate once per minute.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;

/// Number of per-minute buckets
pub const STAT_BUCKETS: usize = 60;

/// How often the aggregate is logged
pub const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// How a request was satisfied, for accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the cache
    Hit,
    /// Not in the cache; went upstream
    Miss,
    /// In the cache but expired; went upstream
    Expired,
    /// Type never cached; went upstream
    Bypass,
    /// Sinkholed by the filter
    Blocked,
}

impl CacheStatus {
    /// Fixed-width label used in per-request log lines
    pub fn label(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Expired => "EXPIR",
            CacheStatus::Bypass => "NOCACHE",
            CacheStatus::Blocked => "BLOCK",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    hits: u64,
    misses: u64,
    expired: u64,
    uncached: u64,
    blocked: u64,
    cached_ms: u64,
    uncached_ms: u64,
}

impl Bucket {
    fn clear(&mut self) {
        *self = Bucket::default();
    }
}

/// Aggregate over the trailing hour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatTotals {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub uncached: u64,
    pub blocked: u64,
    pub cached_ms: u64,
    pub uncached_ms: u64,
}

impl StatTotals {
    pub fn cached_responses(&self) -> u64 {
        self.hits + self.blocked
    }

    pub fn uncached_responses(&self) -> u64 {
        self.misses + self.expired + self.uncached
    }

    pub fn total_responses(&self) -> u64 {
        self.cached_responses() + self.uncached_responses()
    }
}

struct RingInner {
    last_update: u64,
    buckets: [Bucket; STAT_BUCKETS],
}

/// Rolling 60-bucket counter ring
pub struct StatRing {
    inner: Mutex<RingInner>,
}

impl Default for StatRing {
    fn default() -> Self {
        StatRing {
            inner: Mutex::new(RingInner {
                last_update: 0,
                buckets: [Bucket::default(); STAT_BUCKETS],
            }),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

impl StatRing {
    pub fn new() -> Self {
        StatRing::default()
    }

    /// Record one request outcome with its response time
    pub fn record(&self, status: CacheStatus, elapsed_ms: u64) {
        self.record_at(unix_now(), status, elapsed_ms);
    }

    fn record_at(&self, now: u64, status: CacheStatus, elapsed_ms: u64) {
        let mut inner = self.inner.lock().expect("stat lock poisoned");
        Self::advance(&mut inner, now);

        let bucket = &mut inner.buckets[(now / 60) as usize % STAT_BUCKETS];
        match status {
            CacheStatus::Hit => {
                bucket.hits += 1;
                bucket.cached_ms += elapsed_ms;
            }
            CacheStatus::Blocked => {
                bucket.blocked += 1;
                bucket.cached_ms += elapsed_ms;
            }
            CacheStatus::Miss => {
                bucket.misses += 1;
                bucket.uncached_ms += elapsed_ms;
            }
            CacheStatus::Expired => {
                bucket.expired += 1;
                bucket.uncached_ms += elapsed_ms;
            }
            CacheStatus::Bypass => {
                bucket.uncached += 1;
                bucket.uncached_ms += elapsed_ms;
            }
        }
    }

    /// Zero every bucket whose minute falls in `(last_update, now]`
    fn advance(inner: &mut RingInner, now: u64) {
        let elapsed = now.saturating_sub(inner.last_update);
        if elapsed == 0 {
            return;
        }
        if elapsed >= 3600 {
            for bucket in inner.buckets.iter_mut() {
                bucket.clear();
            }
        } else {
            let mut minute = inner.last_update / 60 + 1;
            let end = now / 60;
            while minute <= end {
                inner.buckets[minute as usize % STAT_BUCKETS].clear();
                minute += 1;
            }
        }
        inner.last_update = now;
    }

    /// Aggregate the trailing hour
    pub fn totals(&self) -> StatTotals {
        self.totals_at(unix_now())
    }

    fn totals_at(&self, now: u64) -> StatTotals {
        let mut inner = self.inner.lock().expect("stat lock poisoned");
        Self::advance(&mut inner, now);

        let mut totals = StatTotals::default();
        for bucket in inner.buckets.iter() {
            totals.hits += bucket.hits;
            totals.misses += bucket.misses;
            totals.expired += bucket.expired;
            totals.uncached += bucket.uncached;
            totals.blocked += bucket.blocked;
            totals.cached_ms += bucket.cached_ms;
            totals.uncached_ms += bucket.uncached_ms;
        }
        totals
    }

    /// Log the trailing-hour aggregate
    pub fn print(&self) {
        let totals = self.totals();
        log::info!(
            "responses last hour: {} total ({} cached, {} uncached, {} blocked, {} expired)",
            totals.total_responses(),
            totals.cached_responses(),
            totals.uncached_responses(),
            totals.blocked,
            totals.expired,
        );
        if totals.cached_responses() > 0 {
            log::info!(
                "mean cached response time: {} ms",
                totals.cached_ms / totals.cached_responses()
            );
        }
        if totals.uncached_responses() > 0 {
            log::info!(
                "mean uncached response time: {} ms",
                totals.uncached_ms / totals.uncached_responses()
            );
        }
    }
}

/// Periodically log the aggregate until shutdown
pub async fn report_loop(ring: Arc<StatRing>, mut shutdown: broadcast::Receiver<()>) {
    let mut tick = tokio::time::interval_at(
        tokio::time::Instant::now() + REPORT_INTERVAL,
        REPORT_INTERVAL,
    );
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tick.tick() => ring.print(),
        }
    }
}
