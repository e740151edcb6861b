//! Response cache with TTL clamping
//!
//! A keyed wrapper over the LRU slot store. Records are keyed by
//! (canonical name, record type, session tag) so one client's answers are
//! never served to another. TTLs are clamped on insert and rewritten to the
//! remaining lifetime on every hit; non-success responses are cached briefly
//! as negative records. A background task purges expired records and
//! periodically compacts the slot array.

use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::RecordType;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{broadcast, mpsc};

use crate::error::{Error, Result};
use crate::lru::LruStore;
use crate::name::canonical_from;

/// Floor applied to reported TTLs on insert
pub const DEFAULT_MIN_TTL: u64 = 600;

/// Ceiling applied to reported TTLs on insert
pub const DEFAULT_MAX_TTL: u64 = 86_400;

/// Lifetime of cached non-success responses
pub const NEGATIVE_CACHE_TTL: u64 = 10;

/// How often expired records are purged
pub const PURGE_INTERVAL: Duration = Duration::from_secs(600);

/// How often the slot array is compacted
pub const COMPACT_INTERVAL: Duration = Duration::from_secs(1800);

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

/// Cache key: canonical name, query type, and the client session tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    cname: String,
    rtype: RecordType,
    session: String,
}

impl CacheKey {
    fn from_message(msg: &Message, session: &str) -> Result<Self> {
        let questions = msg.queries();
        if questions.len() != 1 {
            return Err(Error::Malformed(format!(
                "{} questions in message (expected 1)",
                questions.len()
            )));
        }
        Ok(CacheKey {
            cname: canonical_from(questions[0].name()),
            rtype: questions[0].query_type(),
            session: session.to_string(),
        })
    }
}

/// A cached response and its absolute expiry
#[derive(Debug, Clone)]
pub struct CachedRecord {
    response: Message,
    /// Unix seconds
    expiry: u64,
    session: String,
}

impl CachedRecord {
    fn is_expired(&self, now: u64) -> bool {
        self.expiry <= now
    }

    fn key(&self) -> Result<CacheKey> {
        CacheKey::from_message(&self.response, &self.session)
    }

    fn cname(&self) -> Option<String> {
        self.response
            .queries()
            .first()
            .map(|q| canonical_from(q.name()))
    }

    /// Clone of the response with every record TTL rewritten to the
    /// remaining lifetime
    fn ttl_adjusted(&self, now: u64) -> Message {
        let remaining = self.expiry.saturating_sub(now).min(u64::from(u32::MAX)) as u32;
        let mut msg = self.response.clone();
        for record in msg.answers_mut() {
            record.set_ttl(remaining);
        }
        for record in msg.name_servers_mut() {
            record.set_ttl(remaining);
        }
        for record in msg.additionals_mut() {
            record.set_ttl(remaining);
        }
        msg
    }
}

/// Outcome of a cache lookup for a supported query
#[derive(Debug)]
pub enum Lookup {
    /// A live record was found; the message has TTLs rewritten
    Hit(Message),
    /// No record for the key
    Miss,
    /// A record exists but its TTL ran out
    Expired,
}

struct CacheInner {
    map: FxHashMap<CacheKey, usize>,
    lru: LruStore<CachedRecord>,
}

impl CacheInner {
    fn purge_if<F>(&mut self, pred: F) -> usize
    where
        F: FnMut(&CachedRecord) -> bool,
    {
        let purged = self.lru.purge(pred);
        for record in &purged {
            if let Ok(key) = record.key() {
                self.map.remove(&key);
            }
        }
        purged.len()
    }
}

/// Cache configuration resolved from the config file
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub capacity: usize,
    pub min_ttl: u64,
    pub max_ttl: u64,
    pub cached_types: FxHashSet<RecordType>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let cached_types = [
            RecordType::A,
            RecordType::AAAA,
            RecordType::CNAME,
            RecordType::Unknown(39), // DNAME (RFC 2672) has no named variant in hickory-proto
            RecordType::PTR,
            RecordType::SRV,
            RecordType::TXT,
        ]
        .into_iter()
        .collect();
        CacheSettings {
            capacity: 4096,
            min_ttl: DEFAULT_MIN_TTL,
            max_ttl: DEFAULT_MAX_TTL,
            cached_types,
        }
    }
}

/// Session-keyed response cache
pub struct ResponseCache {
    inner: RwLock<CacheInner>,
    settings: CacheSettings,
    flush_tx: mpsc::Sender<()>,
}

impl ResponseCache {
    /// Create the cache and the maintenance task driving its timers.
    ///
    /// The task must be spawned by the caller; dropping it leaves the cache
    /// fully functional but unmaintained (useful in tests).
    pub fn new(settings: CacheSettings) -> (std::sync::Arc<ResponseCache>, Maintenance) {
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let cache = std::sync::Arc::new(ResponseCache {
            inner: RwLock::new(CacheInner {
                map: FxHashMap::default(),
                lru: LruStore::new(settings.capacity),
            }),
            settings,
            flush_tx,
        });
        let maintenance = Maintenance {
            cache: cache.clone(),
            flush_rx,
        };
        (cache, maintenance)
    }

    fn check_type(&self, rtype: RecordType) -> Result<()> {
        if self.settings.cached_types.contains(&rtype) {
            Ok(())
        } else {
            Err(Error::UncachedRecordType(rtype))
        }
    }

    /// Look up a cached response for the query under the given session tag
    pub fn query(&self, msg: &Message, session: &str) -> Result<Lookup> {
        let key = CacheKey::from_message(msg, session)?;
        self.check_type(key.rtype)?;

        let now = unix_now();
        let inner = self.inner.read().expect("cache lock poisoned");
        let Some(&idx) = inner.map.get(&key) else {
            return Ok(Lookup::Miss);
        };
        let Some(record) = inner.lru.get(idx) else {
            return Ok(Lookup::Miss);
        };
        if record.is_expired(now) {
            return Ok(Lookup::Expired);
        }
        Ok(Lookup::Hit(record.ttl_adjusted(now)))
    }

    /// Insert a response, replacing any previous record for its key.
    ///
    /// The effective TTL is the reported TTL clamped into the configured
    /// bounds; non-success responses get the negative-cache TTL. The OPT
    /// pseudo-section is stripped first (it is hop-scoped, RFC 6891).
    pub fn update(&self, mut msg: Message, session: &str) -> Result<()> {
        if msg.message_type() != MessageType::Response {
            return Err(Error::NotAResponse);
        }
        let key = CacheKey::from_message(&msg, session)?;
        self.check_type(key.rtype)?;

        *msg.extensions_mut() = None;
        msg.additionals_mut()
            .retain(|r| r.record_type() != RecordType::OPT);

        let ttl = if msg.response_code() != ResponseCode::NoError {
            NEGATIVE_CACHE_TTL
        } else {
            self.clamp_ttl(reported_ttl(&msg))
        };
        let record = CachedRecord {
            response: msg,
            expiry: unix_now() + ttl,
            session: session.to_string(),
        };

        let mut inner = self.inner.write().expect("cache lock poisoned");
        if let Some(old_idx) = inner.map.remove(&key) {
            inner.lru.delete(old_idx);
        }
        let (idx, evicted) = inner.lru.add(record);
        if let Some(old) = evicted {
            if let Ok(old_key) = old.key() {
                inner.map.remove(&old_key);
            }
        }
        inner.map.insert(key, idx);
        Ok(())
    }

    fn clamp_ttl(&self, reported: Option<u64>) -> u64 {
        reported
            .unwrap_or(self.settings.min_ttl)
            .clamp(self.settings.min_ttl, self.settings.max_ttl)
    }

    /// Remove every record whose question name equals the canonical name
    pub fn purge_domain(&self, name: &str) -> usize {
        let cname = crate::name::canonical_name(name);
        let mut inner = self.inner.write().expect("cache lock poisoned");
        inner.purge_if(|record| record.cname().as_deref() == Some(cname.as_str()))
    }

    /// Remove every record whose expiry has passed
    pub fn purge_expired(&self) -> usize {
        let now = unix_now();
        let mut inner = self.inner.write().expect("cache lock poisoned");
        inner.purge_if(|record| record.is_expired(now))
    }

    /// Drop every record
    pub fn flush(&self) -> usize {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        inner.map.clear();
        inner.lru.flush()
    }

    /// Purge expired records, then rewrite slot indices and rebuild the key
    /// map from a full traversal
    pub fn compact(&self) {
        let now = unix_now();
        let mut inner = self.inner.write().expect("cache lock poisoned");
        inner.purge_if(|record| record.is_expired(now));

        let mut rebuilt = FxHashMap::default();
        inner.lru.compact_and_sort(|idx, record| {
            if let Ok(key) = record.key() {
                rebuilt.insert(key, idx);
            }
        });
        inner.map = rebuilt;
    }

    /// Ask the maintenance task to compact immediately
    pub fn force_flush(&self) {
        let _ = self.flush_tx.try_send(());
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.inner.read().expect("cache lock poisoned").lru.len()
    }

    /// Whether the cache holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Minimum TTL reported across the answer and authority sections
fn reported_ttl(msg: &Message) -> Option<u64> {
    msg.answers()
        .iter()
        .chain(msg.name_servers().iter())
        .map(|record| u64::from(record.ttl()))
        .min()
}

/// Background maintenance: periodic expiry purge, periodic compaction, and
/// immediate compaction on a force-flush signal
pub struct Maintenance {
    cache: std::sync::Arc<ResponseCache>,
    flush_rx: mpsc::Receiver<()>,
}

impl Maintenance {
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut purge = tokio::time::interval_at(
            tokio::time::Instant::now() + PURGE_INTERVAL,
            PURGE_INTERVAL,
        );
        let mut compact = tokio::time::interval_at(
            tokio::time::Instant::now() + COMPACT_INTERVAL,
            COMPACT_INTERVAL,
        );
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                Some(()) = self.flush_rx.recv() => {
                    self.cache.compact();
                    purge.reset();
                    compact.reset();
                }
                _ = compact.tick() => {
                    self.cache.compact();
                    purge.reset();
                }
                _ = purge.tick() => {
                    let purged = self.cache.purge_expired();
                    if purged > 0 {
                        log::debug!("purged {} expired cache records", purged);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    const SESSION: &str = "127.0.0.1:53\t127.0.0.1:40000";

    fn make_query(name: &str, rtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(7);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
        msg
    }

    fn make_response(name: &str, ttl: u32) -> Message {
        let mut msg = make_query(name, RecordType::A);
        msg.set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::NoError);
        msg.add_answer(Record::from_rdata(
            Name::from_str(name).unwrap(),
            ttl,
            RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
        ));
        msg
    }

    fn test_cache(capacity: usize) -> std::sync::Arc<ResponseCache> {
        let (cache, _maintenance) = ResponseCache::new(CacheSettings {
            capacity,
            ..CacheSettings::default()
        });
        cache
    }

    #[test]
    fn test_miss_then_hit_roundtrip() {
        let cache = test_cache(8);
        let query = make_query("example.com.", RecordType::A);

        assert!(matches!(cache.query(&query, SESSION), Ok(Lookup::Miss)));

        cache.update(make_response("example.com.", 1200), SESSION).unwrap();
        match cache.query(&query, SESSION).unwrap() {
            Lookup::Hit(msg) => {
                assert_eq!(msg.answers().len(), 1);
                assert!(msg.answers()[0].ttl() <= 1200);
            }
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[test]
    fn test_sessions_are_isolated() {
        let cache = test_cache(8);
        cache.update(make_response("example.com.", 1200), SESSION).unwrap();

        let query = make_query("example.com.", RecordType::A);
        let other = "127.0.0.1:53\t10.0.0.9:5000";
        assert!(matches!(cache.query(&query, other), Ok(Lookup::Miss)));
    }

    #[test]
    fn test_ttl_clamped_to_floor() {
        let cache = test_cache(8);
        cache.update(make_response("example.com.", 5), SESSION).unwrap();

        match cache.query(&make_query("example.com.", RecordType::A), SESSION).unwrap() {
            Lookup::Hit(msg) => {
                let ttl = msg.answers()[0].ttl();
                // 5s reported, clamped up to the 600s floor.
                assert!(ttl > 500, "ttl {} should be near the floor", ttl);
                assert!(ttl <= 600);
            }
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_response_short_ttl() {
        let cache = test_cache(8);
        let mut resp = make_query("missing.example.com.", RecordType::A);
        resp.set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::NXDomain);
        cache.update(resp, SESSION).unwrap();

        match cache
            .query(&make_query("missing.example.com.", RecordType::A), SESSION)
            .unwrap()
        {
            Lookup::Hit(msg) => {
                assert_eq!(msg.response_code(), ResponseCode::NXDomain);
            }
            other => panic!("expected negative hit, got {:?}", other),
        }
    }

    #[test]
    fn test_update_rejects_non_response() {
        let cache = test_cache(8);
        let query = make_query("example.com.", RecordType::A);
        assert!(matches!(
            cache.update(query, SESSION),
            Err(Error::NotAResponse)
        ));
    }

    #[test]
    fn test_unsupported_type_is_error() {
        let cache = test_cache(8);
        let query = make_query("example.com.", RecordType::MX);
        assert!(matches!(
            cache.query(&query, SESSION),
            Err(Error::UncachedRecordType(RecordType::MX))
        ));
    }

    #[test]
    fn test_malformed_question_count() {
        let cache = test_cache(8);
        let mut msg = Message::new();
        msg.add_query(Query::query(Name::from_str("a.com.").unwrap(), RecordType::A));
        msg.add_query(Query::query(Name::from_str("b.com.").unwrap(), RecordType::A));
        assert!(matches!(cache.query(&msg, SESSION), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_opt_stripped_before_caching() {
        use hickory_proto::op::Edns;

        let cache = test_cache(8);
        let mut resp = make_response("example.com.", 1200);
        resp.extensions_mut()
            .get_or_insert_with(Edns::new)
            .set_max_payload(4096);
        cache.update(resp, SESSION).unwrap();

        match cache.query(&make_query("example.com.", RecordType::A), SESSION).unwrap() {
            Lookup::Hit(msg) => assert!(msg.extensions().is_none()),
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[test]
    fn test_update_replaces_previous_record() {
        let cache = test_cache(8);
        cache.update(make_response("example.com.", 700), SESSION).unwrap();
        cache.update(make_response("example.com.", 900), SESSION).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_removes_key_map_entry() {
        let cache = test_cache(2);
        cache.update(make_response("one.com.", 700), SESSION).unwrap();
        cache.update(make_response("two.com.", 700), SESSION).unwrap();
        cache.update(make_response("three.com.", 700), SESSION).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(matches!(
            cache.query(&make_query("one.com.", RecordType::A), SESSION),
            Ok(Lookup::Miss)
        ));
        assert!(matches!(
            cache.query(&make_query("three.com.", RecordType::A), SESSION),
            Ok(Lookup::Hit(_))
        ));
    }

    #[test]
    fn test_purge_domain() {
        let cache = test_cache(8);
        cache.update(make_response("gone.com.", 700), SESSION).unwrap();
        cache.update(make_response("kept.com.", 700), SESSION).unwrap();

        assert_eq!(cache.purge_domain("Gone.COM"), 1);
        assert!(matches!(
            cache.query(&make_query("gone.com.", RecordType::A), SESSION),
            Ok(Lookup::Miss)
        ));
        assert!(matches!(
            cache.query(&make_query("kept.com.", RecordType::A), SESSION),
            Ok(Lookup::Hit(_))
        ));
    }

    #[test]
    fn test_flush() {
        let cache = test_cache(8);
        cache.update(make_response("a.com.", 700), SESSION).unwrap();
        cache.update(make_response("b.com.", 700), SESSION).unwrap();
        assert_eq!(cache.flush(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_compact_keeps_records_queryable() {
        let cache = test_cache(8);
        cache.update(make_response("a.com.", 700), SESSION).unwrap();
        cache.update(make_response("b.com.", 700), SESSION).unwrap();
        cache.update(make_response("c.com.", 700), SESSION).unwrap();
        cache.purge_domain("b.com.");

        cache.compact();

        assert_eq!(cache.len(), 2);
        for name in ["a.com.", "c.com."] {
            assert!(matches!(
                cache.query(&make_query(name, RecordType::A), SESSION),
                Ok(Lookup::Hit(_))
            ));
        }
    }

    #[test]
    fn test_purge_expired_leaves_live_records() {
        let cache = test_cache(8);
        cache.update(make_response("live.com.", 700), SESSION).unwrap();
        // Nothing can have expired yet; purge must be a no-op.
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_reported_ttl_takes_minimum() {
        let mut msg = make_response("example.com.", 300);
        msg.add_answer(Record::from_rdata(
            Name::from_str("example.com.").unwrap(),
            120,
            RData::A(A(Ipv4Addr::new(93, 184, 216, 35))),
        ));
        assert_eq!(reported_ttl(&msg), Some(120));
    }
}
