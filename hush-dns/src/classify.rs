//! Query classification
//!
//! Decides whether a query goes to the upstream pool, the local-network
//! pool, or is rejected outright. The rules keep intranet traffic off the
//! public resolvers: reverse lookups for special address space, single-label
//! hostnames, and names without a recognized TLD all stay local.

use std::sync::Arc;

use hickory_proto::op::Message;
use hickory_proto::rr::{DNSClass, RecordType};

use crate::name::{
    canonical_from, is_global_unicast, is_reverse_name, is_special_ip, reverse_name_to_ip,
};
use crate::tld::TldTable;

/// Where a query should be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Local-network resolver pool
    Local,
    /// Public upstream pool
    Upstream,
    /// Structurally invalid; answer ServFail
    RejectMalformed,
}

/// Pure classifier over the hot-swapped TLD table
pub struct Classifier {
    tlds: Arc<TldTable>,
}

impl Classifier {
    pub fn new(tlds: Arc<TldTable>) -> Self {
        Classifier { tlds }
    }

    pub fn classify(&self, req: &Message) -> Destination {
        let questions = req.queries();
        if questions.len() != 1 {
            return Destination::RejectMalformed;
        }
        let question = &questions[0];
        if question.query_class() != DNSClass::IN {
            return Destination::RejectMalformed;
        }

        let cname = canonical_from(question.name());

        // Reverse lookups route by the address they encode.
        if question.query_type() == RecordType::PTR && is_reverse_name(&cname) {
            return match reverse_name_to_ip(&cname) {
                Some(ip) if is_special_ip(ip) => Destination::Local,
                Some(ip) if is_global_unicast(ip) => Destination::Upstream,
                _ => Destination::RejectMalformed,
            };
        }

        let stem = cname.trim_end_matches('.');
        if stem.is_empty() {
            return Destination::RejectMalformed;
        }
        let labels: Vec<&str> = stem.split('.').collect();
        if labels.len() == 1 {
            return Destination::Local;
        }
        // Unknown TLD means an intranet name; never leak it upstream.
        let rightmost = labels[labels.len() - 1];
        if !self.tlds.is_recognized(rightmost) {
            return Destination::Local;
        }
        Destination::Upstream
    }
}
