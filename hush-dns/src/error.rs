//! Error types for DNS forwarding operations

use thiserror::Error;

/// Result type alias for DNS forwarding operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling, caching, or forwarding queries
#[derive(Debug, Error)]
pub enum Error {
    /// The message failed a structural check (question count, class, flags)
    #[error("malformed DNS message: {0}")]
    Malformed(String),

    /// A non-response message was offered to the cache
    #[error("attempted to cache a message that is not a response")]
    NotAResponse,

    /// The query type is outside the configured cacheable set
    #[error("record type {0} is not cached")]
    UncachedRecordType(hickory_proto::rr::RecordType),

    /// A name could not be promoted into the block filter
    #[error("invalid domain name: {0}")]
    InvalidDomain(String),

    /// Upstream exchange failed after connection renewal retries
    #[error("upstream exchange failed: {0}")]
    Upstream(String),

    /// A list fetch over HTTPS failed (transport or status)
    #[error("list fetch failed: {0}")]
    Fetch(String),

    /// The ABP filter source contained an unparseable line
    #[error("filter list syntax error at line {line}: {text}")]
    FilterSyntax { line: usize, text: String },

    /// Fatal configuration problem detected at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// The coalescing leader vanished before publishing a response
    #[error("inflight leader dropped before publishing a response")]
    LeaderDropped,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// DNS wire-format error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),
}
