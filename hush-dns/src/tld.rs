//! IANA TLD table
//!
//! The classifier keeps intranet names local by checking the rightmost label
//! against the published IANA TLD list. The table refreshes daily; a failed
//! fetch keeps the previous table. Until the first successful fetch the
//! table is empty and recognizes every label, so startup cannot blackhole
//! upstream traffic.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::broadcast;

use crate::fetch::BootstrapHttpPool;

/// Published IANA TLD list
pub const TLD_LIST_URL: &str = "https://data.iana.org/TLD/tlds-alpha-by-domain.txt";

/// Wait between refreshes after a successful fetch
pub const TLD_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Wait before retrying after a failed fetch
pub const TLD_RETRY_INTERVAL: Duration = Duration::from_secs(3600);

/// Hot-swapped set of recognized top-level domains
#[derive(Default)]
pub struct TldTable {
    tlds: RwLock<Arc<FxHashSet<String>>>,
}

impl TldTable {
    pub fn new() -> Self {
        TldTable::default()
    }

    /// Whether the label is a recognized TLD. An unpopulated table
    /// recognizes everything.
    pub fn is_recognized(&self, label: &str) -> bool {
        let snapshot = self.tlds.read().expect("TLD lock poisoned").clone();
        snapshot.is_empty() || snapshot.contains(&label.to_ascii_lowercase())
    }

    /// Swap in a freshly parsed table
    pub fn replace(&self, tlds: FxHashSet<String>) {
        *self.tlds.write().expect("TLD lock poisoned") = Arc::new(tlds);
    }

    pub fn len(&self) -> usize {
        self.tlds.read().expect("TLD lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse the IANA list: one TLD per line, `#` comments and blanks ignored
pub fn parse_tld_list(body: &str) -> FxHashSet<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_ascii_lowercase)
        .collect()
}

/// Daily refresh of the TLD table
pub struct TldRefresher {
    pub table: Arc<TldTable>,
    pub http: BootstrapHttpPool,
}

impl TldRefresher {
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut deadline = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep_until(deadline) => {
                    let interval = match self.http.get(TLD_LIST_URL).await {
                        Ok(body) => {
                            let tlds = parse_tld_list(&body);
                            if tlds.is_empty() {
                                log::warn!("fetched TLD list was empty, keeping previous table");
                                TLD_RETRY_INTERVAL
                            } else {
                                log::info!("TLD table updated with {} entries", tlds.len());
                                self.table.replace(tlds);
                                TLD_REFRESH_INTERVAL
                            }
                        }
                        Err(e) => {
                            log::warn!("TLD list fetch failed, keeping previous table: {}", e);
                            TLD_RETRY_INTERVAL
                        }
                    };
                    deadline = tokio::time::Instant::now() + interval;
                }
            }
        }
    }
}
