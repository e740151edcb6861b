//! Ad-block filter with periodic refresh and atomic hot-swap
//!
//! The filter is a set of canonical names consulted by suffix-ancestor
//! stripping: a hit on any ancestor of the queried name blocks it. Refreshes
//! build a complete replacement set off to the side and swap it in only when
//! the fetched list actually changed (content hash). Readers snapshot the
//! published set once per lookup; single-domain promotions are the only
//! in-place growth.

use std::hash::Hasher;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use hickory_proto::rr::Name;
use rustc_hash::{FxHashSet, FxHasher};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{Error, Result};
use crate::fetch::BootstrapHttpPool;
use crate::name::{canonical_name, suffix_ancestors};

/// Wait between refreshes after a successful fetch
pub const REFRESH_OK_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Wait before retrying after a failed fetch
pub const REFRESH_RETRY_INTERVAL: Duration = Duration::from_secs(3600);

type FilterSet = FxHashSet<String>;

type RefreshRequest = oneshot::Sender<Result<bool>>;

/// Suffix-matching domain filter
pub struct AdBlockFilter {
    set: RwLock<Arc<FilterSet>>,
    content_hash: AtomicU64,
    refresh_tx: mpsc::Sender<RefreshRequest>,
}

impl AdBlockFilter {
    /// Create the filter and its refresher task.
    ///
    /// The refresher owns the single consumer end of the refresh channel so
    /// at most one refresh runs at a time; it must be spawned by the caller.
    pub fn new(filter_url: String, http: BootstrapHttpPool) -> (Arc<AdBlockFilter>, Refresher) {
        let (refresh_tx, refresh_rx) = mpsc::channel(8);
        let filter = Arc::new(AdBlockFilter {
            set: RwLock::new(Arc::new(FilterSet::default())),
            content_hash: AtomicU64::new(0),
            refresh_tx,
        });
        let refresher = Refresher {
            filter: filter.clone(),
            http,
            url: filter_url,
            refresh_rx,
        };
        (filter, refresher)
    }

    /// Whether the name or any suffix ancestor is in the filter
    pub fn is_blocked(&self, name: &str) -> bool {
        let cname = canonical_name(name);
        let snapshot = self.set.read().expect("filter lock poisoned").clone();
        let blocked = suffix_ancestors(&cname).any(|ancestor| snapshot.contains(ancestor));
        blocked
    }

    /// Promote a single domain into the live set (not persisted)
    pub fn block(&self, name: &str) -> Result<()> {
        let cname = canonical_name(name);
        if Name::from_str(&cname).is_err() || cname == "." {
            return Err(Error::InvalidDomain(name.to_string()));
        }
        let mut set = self.set.write().expect("filter lock poisoned");
        Arc::make_mut(&mut set).insert(cname);
        Ok(())
    }

    /// Request a refresh from the refresher task and wait for its outcome.
    ///
    /// Returns whether the set actually changed.
    pub async fn refresh(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.refresh_tx
            .send(tx)
            .await
            .map_err(|_| Error::Fetch("filter refresher is gone".into()))?;
        rx.await
            .map_err(|_| Error::Fetch("filter refresher dropped the request".into()))?
    }

    /// Number of entries in the current set
    pub fn len(&self) -> usize {
        self.set.read().expect("filter lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn install(&self, set: FilterSet, hash: u64) {
        let mut guard = self.set.write().expect("filter lock poisoned");
        *guard = Arc::new(set);
        self.content_hash.store(hash, Ordering::Release);
    }
}

/// Single consumer of refresh requests plus the periodic schedule
pub struct Refresher {
    filter: Arc<AdBlockFilter>,
    http: BootstrapHttpPool,
    url: String,
    refresh_rx: mpsc::Receiver<RefreshRequest>,
}

impl Refresher {
    /// Run until shutdown: refresh immediately, then on the success/failure
    /// schedule, serving external refresh requests in between
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut deadline = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep_until(deadline) => {
                    let interval = match self.do_refresh().await {
                        Ok(true) => {
                            log::info!("ad-block filter updated with {} entries", self.filter.len());
                            REFRESH_OK_INTERVAL
                        }
                        Ok(false) => {
                            log::debug!("ad-block filter unchanged");
                            REFRESH_OK_INTERVAL
                        }
                        Err(e) => {
                            log::warn!("ad-block filter refresh failed: {}", e);
                            REFRESH_RETRY_INTERVAL
                        }
                    };
                    deadline = tokio::time::Instant::now() + interval;
                }
                Some(reply) = self.refresh_rx.recv() => {
                    let _ = reply.send(self.do_refresh().await);
                }
            }
        }
    }

    async fn do_refresh(&self) -> Result<bool> {
        let body = self.http.get(&self.url).await?;

        let mut hasher = FxHasher::default();
        hasher.write(body.as_bytes());
        let hash = hasher.finish();
        if hash == self.filter.content_hash.load(Ordering::Acquire) && !self.filter.is_empty() {
            return Ok(false);
        }

        let entries = parse_abp_list(&body)?;
        let mut set = FilterSet::default();
        set.reserve(entries.len());
        set.extend(entries);
        self.filter.install(set, hash);
        Ok(true)
    }
}

/// Parse an Adblock Plus-style filter list into canonical block entries.
///
/// Blank lines and `!` comments are skipped, `[...]` section headers are
/// skipped, and block entries have the exact form `||host.name^`. Anything
/// else is a syntax error attributed to its line.
pub fn parse_abp_list(list: &str) -> Result<Vec<String>> {
    let mut entries = Vec::new();
    for (idx, line) in list.lines().enumerate() {
        let trimmed = line.trim_end_matches([' ', '\t']);
        if trimmed.is_empty() || trimmed.starts_with('!') {
            continue;
        }
        if trimmed.starts_with('[') {
            if !trimmed.ends_with(']') {
                return Err(Error::FilterSyntax {
                    line: idx + 1,
                    text: line.to_string(),
                });
            }
            continue;
        }
        let entry = trimmed
            .strip_prefix("||")
            .and_then(|rest| rest.strip_suffix('^'))
            .filter(|host| !host.is_empty());
        match entry {
            Some(host) => entries.push(canonical_name(host)),
            None => {
                return Err(Error::FilterSyntax {
                    line: idx + 1,
                    text: line.to_string(),
                })
            }
        }
    }
    Ok(entries)
}
