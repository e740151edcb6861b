//! hush-dns - caching, ad-blocking DNS forwarder
//!
//! The data plane of a recursive DNS forwarder:
//! - UDP, TCP, and DNS-over-TLS upstream clients with round-robin dispatch
//!   and persistent-connection renewal
//! - Session-keyed response caching with TTL clamping, negative caching,
//!   and background compaction
//! - An Adblock Plus-style suffix filter with periodic refresh and atomic
//!   hot-swap, answering blocked names from a sinkhole address
//! - Coalescing of concurrent duplicate queries into one upstream call
//! - Query classification that keeps intranet names and reverse lookups for
//!   special address space on a separate local resolver pool
//!
//! # Example
//!
//! ```no_run
//! use hush_dns::config::Config;
//! use hush_dns::proxy::Server;
//!
//! # async fn example() -> hush_dns::Result<()> {
//! let config = Config::from_json(&Config::sample())?;
//! let server = Server::new(config)?;
//! let shutdown = server.shutdown_handle();
//! tokio::spawn(server.run());
//! // ... later ...
//! let _ = shutdown.send(());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod classify;
pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod handler;
pub mod inflight;
pub mod lru;
pub mod name;
pub mod proxy;
pub mod reply;
pub mod stats;
pub mod tld;

pub use cache::{CacheSettings, ResponseCache};
pub use classify::{Classifier, Destination};
pub use client::{ClientPool, UpstreamClient};
pub use config::Config;
pub use error::{Error, Result};
pub use filter::AdBlockFilter;
pub use handler::Handler;
pub use inflight::InflightManager;
pub use proxy::Server;
pub use stats::StatRing;
pub use tld::TldTable;
