//! The query-handling pipeline
//!
//! One entry point, `serve`: guard, classify, block check, inflight
//! coalescing, cache lookup, upstream exchange, post-processing of indirect
//! answers, cache write, reply. Every path produces a well-formed reply
//! whose ID matches the request, records its outcome in the stat ring, and
//! releases its inflight reservation.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::{RData, RecordType};

use crate::cache::{Lookup, ResponseCache};
use crate::classify::{Classifier, Destination};
use crate::client::ClientPool;
use crate::error::Error;
use crate::filter::AdBlockFilter;
use crate::inflight::{self, InflightManager, ReleaseGuard, ResponseSlot};
use crate::name::canonical_from;
use crate::reply;
use crate::stats::{CacheStatus, StatRing};

/// The assembled data plane
pub struct Handler {
    cache: Arc<ResponseCache>,
    filter: Arc<AdBlockFilter>,
    inflight: InflightManager,
    upstream_pool: ClientPool,
    local_pool: ClientPool,
    classifier: Classifier,
    stats: Arc<StatRing>,
    sink4: Ipv4Addr,
    sink6: Ipv6Addr,
}

impl Handler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<ResponseCache>,
        filter: Arc<AdBlockFilter>,
        upstream_pool: ClientPool,
        local_pool: ClientPool,
        classifier: Classifier,
        stats: Arc<StatRing>,
        sink4: Ipv4Addr,
        sink6: Ipv6Addr,
    ) -> Self {
        Handler {
            cache,
            filter,
            inflight: InflightManager::new(),
            upstream_pool,
            local_pool,
            classifier,
            stats,
            sink4,
            sink6,
        }
    }

    /// Handle one query and produce the reply to send back
    pub async fn serve(&self, req: Message, local: SocketAddr, peer: SocketAddr) -> Message {
        let started = Instant::now();

        if req.message_type() != MessageType::Query || req.queries().len() != 1 {
            log::warn!("rejecting malformed request from {}", peer);
            return reply::servfail(&req);
        }
        let question = req.queries()[0].clone();
        let cname = canonical_from(question.name());
        let qtype = question.query_type();

        let destination = self.classifier.classify(&req);
        let pool = match destination {
            Destination::Upstream => &self.upstream_pool,
            Destination::Local => &self.local_pool,
            Destination::RejectMalformed => {
                log::warn!("rejecting unclassifiable request for {} from {}", cname, peer);
                return reply::servfail(&req);
            }
        };
        let is_local = destination == Destination::Local;

        if self.filter.is_blocked(&cname) {
            let resp = reply::blocked(&req, self.sink4, self.sink6);
            self.finish(
                started, is_local, CacheStatus::Blocked, &cname, qtype, &resp,
            );
            return resp;
        }

        let key = inflight::session_key(local, peer, &question);
        let (session, mut slot) = self.inflight.reserve(&key);
        let _release = ReleaseGuard::new(&self.inflight, &key);
        let session_tag = inflight::session_tag(local, peer);

        let mut status = CacheStatus::Miss;
        let mut should_cache = true;
        match self.cache.query(&req, &session_tag) {
            Ok(Lookup::Hit(mut cached)) => {
                cached.set_id(req.id());
                if let Some(slot) = slot.take() {
                    slot.publish(Arc::new(cached.clone()));
                }
                self.finish(started, is_local, CacheStatus::Hit, &cname, qtype, &cached);
                return cached;
            }
            Ok(Lookup::Miss) => {}
            Ok(Lookup::Expired) => status = CacheStatus::Expired,
            Err(Error::UncachedRecordType(_)) => {
                should_cache = false;
                status = CacheStatus::Bypass;
            }
            Err(e) => {
                log::warn!("cache lookup for {} failed: {}", cname, e);
                return self.fail(started, is_local, &cname, qtype, &req, slot);
            }
        }

        let Some(slot) = slot else {
            // Follower: the leader's response is the shared truth.
            return match session.wait().await {
                Ok(shared) => {
                    let resp = reply::from_upstream(&req, &shared);
                    self.finish(started, is_local, CacheStatus::Hit, &cname, qtype, &resp);
                    resp
                }
                Err(e) => {
                    log::warn!("coalesced wait for {} failed: {}", cname, e);
                    reply::servfail(&req)
                }
            };
        };

        // Leader: go upstream.
        let upstream_resp = match pool.next_client() {
            None => {
                log::warn!("no resolver configured for {} query {}",
                    if is_local { "local" } else { "upstream" }, cname);
                None
            }
            Some(client) => {
                let upstream_req = reply::upstream_request(&req);
                match client.exchange(&upstream_req).await {
                    Ok(resp) => Some(resp),
                    Err(e) => {
                        log::warn!("exchange with {} failed for {}: {}",
                            client.server_addr(), cname, e);
                        None
                    }
                }
            }
        };

        let (resp, from_upstream) = match upstream_resp {
            Some(resp) if self.answer_targets_blocked(&resp) => {
                // An indirect answer pointed into blocked space: promote the
                // queried name and sinkhole the reply.
                if let Err(e) = self.filter.block(&cname) {
                    log::warn!("failed to promote {} into the filter: {}", cname, e);
                }
                self.cache.purge_domain(&cname);
                status = CacheStatus::Blocked;
                (reply::blocked(&req, self.sink4, self.sink6), false)
            }
            Some(resp) => (resp, true),
            None => (reply::servfail(&req), false),
        };

        if should_cache && from_upstream {
            if let Err(e) = self.cache.update(resp.clone(), &session_tag) {
                log::debug!("caching response for {} failed: {}", cname, e);
            }
        }

        let out = reply::from_upstream(&req, &resp);
        slot.publish(Arc::new(resp));
        self.finish(started, is_local, status, &cname, qtype, &out);
        out
    }

    /// Whether any indirect answer record points at a blocked name
    fn answer_targets_blocked(&self, resp: &Message) -> bool {
        resp.answers().iter().any(|record| {
            let target = match record.data() {
                RData::CNAME(cname) => Some(canonical_from(&cname.0)),
                RData::DNAME(dname) => Some(canonical_from(&dname.0)),
                RData::PTR(ptr) => Some(canonical_from(&ptr.0)),
                RData::SRV(srv) => Some(canonical_from(srv.target())),
                _ => None,
            };
            match target {
                Some(name) => self.filter.is_blocked(&name),
                None => false,
            }
        })
    }

    fn fail(
        &self,
        started: Instant,
        is_local: bool,
        cname: &str,
        qtype: RecordType,
        req: &Message,
        slot: Option<ResponseSlot>,
    ) -> Message {
        let resp = reply::servfail(req);
        if let Some(slot) = slot {
            slot.publish(Arc::new(resp.clone()));
        }
        self.finish(started, is_local, CacheStatus::Bypass, cname, qtype, &resp);
        resp
    }

    fn finish(
        &self,
        started: Instant,
        is_local: bool,
        status: CacheStatus,
        cname: &str,
        qtype: RecordType,
        resp: &Message,
    ) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.stats.record(status, elapsed_ms);
        log::info!(
            "[{}][{}] {:<6} {} ({}, {} ms)",
            if is_local { "LOCAL" } else { "UPSTR" },
            status.label(),
            qtype.to_string(),
            cname,
            resp.response_code(),
            elapsed_ms,
        );
    }

    /// Shared statistics ring
    pub fn stats(&self) -> &Arc<StatRing> {
        &self.stats
    }

    /// Response cache, exposed for maintenance signals
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }
}
