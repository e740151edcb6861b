//! Reply construction
//!
//! Pure builders for every message the forwarder sends: ServFail and
//! NXDomain replies, sinkholed block replies, replies relaying an upstream
//! response, and the outbound request sent to upstream resolvers.
//!
//! Every reply preserves the request ID and question and negotiates EDNS(0),
//! preferring the upstream OPT, then the client's, else the defaults.

use std::net::{Ipv4Addr, Ipv6Addr};

use hickory_proto::op::{Edns, Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};

/// EDNS(0) UDP buffer size advertised in both directions
pub const EDNS_BUFFER_SIZE: u16 = 1232;

/// TTL of synthesized sinkhole records
pub const BLOCKED_TTL: u32 = 3600;

/// Start a reply to `req`: same ID and question, response bit set
fn reply_to(req: &Message) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id())
        .set_message_type(MessageType::Response)
        .set_op_code(req.op_code())
        .set_recursion_desired(req.recursion_desired())
        .set_recursion_available(true);
    for query in req.queries() {
        msg.add_query(query.clone());
    }
    msg
}

/// Attach EDNS(0), echoing the upstream OPT when present, else the client's
fn echo_edns(msg: &mut Message, upstream: Option<&Message>, req: &Message) {
    let (payload, dnssec_ok) = upstream
        .and_then(|m| m.extensions().as_ref())
        .or(req.extensions().as_ref())
        .map(|edns| (edns.max_payload(), edns.flags().dnssec_ok))
        .unwrap_or((EDNS_BUFFER_SIZE, true));
    let edns = msg.extensions_mut().get_or_insert_with(Edns::new);
    edns.set_version(0);
    edns.set_max_payload(payload.max(512));
    edns.set_dnssec_ok(dnssec_ok);
}

/// Server-failure reply
pub fn servfail(req: &Message) -> Message {
    let mut msg = reply_to(req);
    msg.set_response_code(ResponseCode::ServFail);
    echo_edns(&mut msg, None, req);
    msg
}

/// Name-error reply
pub fn nxdomain(req: &Message) -> Message {
    let mut msg = reply_to(req);
    msg.set_response_code(ResponseCode::NXDomain);
    echo_edns(&mut msg, None, req);
    msg
}

/// Reply carrying a single synthesized answer record
pub fn with_answer(req: &Message, answer: Record) -> Message {
    let mut msg = reply_to(req);
    msg.set_response_code(ResponseCode::NoError);
    msg.add_answer(answer);
    echo_edns(&mut msg, None, req);
    msg
}

/// Reply relaying an upstream response: rcode and record sections are copied,
/// the ID and question stay the client's
pub fn from_upstream(req: &Message, upstream: &Message) -> Message {
    let mut msg = reply_to(req);
    msg.set_response_code(upstream.response_code());
    msg.set_authoritative(upstream.authoritative());
    for record in upstream.answers() {
        msg.add_answer(record.clone());
    }
    for record in upstream.name_servers() {
        msg.add_name_server(record.clone());
    }
    for record in upstream.additionals() {
        msg.add_additional(record.clone());
    }
    echo_edns(&mut msg, Some(upstream), req);
    msg
}

/// Sinkholed reply for a blocked name: A and AAAA queries get the configured
/// sink address with a fixed TTL, every other type gets ServFail
pub fn blocked(req: &Message, sink4: Ipv4Addr, sink6: Ipv6Addr) -> Message {
    let question = match req.queries().first() {
        Some(q) => q,
        None => return servfail(req),
    };
    let rdata = match question.query_type() {
        RecordType::A => RData::A(A(sink4)),
        RecordType::AAAA => RData::AAAA(AAAA(sink6)),
        _ => return servfail(req),
    };
    let record = Record::from_rdata(question.name().clone(), BLOCKED_TTL, rdata);
    with_answer(req, record)
}

/// Build the request sent upstream: fresh ID, only the original question,
/// recursion desired, DNSSEC checking disabled, OPT advertising our buffer
pub fn upstream_request(req: &Message) -> Message {
    let mut msg = Message::new();
    msg.set_id(rand::random::<u16>())
        .set_message_type(MessageType::Query)
        .set_op_code(req.op_code())
        .set_recursion_desired(true)
        .set_checking_disabled(true)
        .set_authentic_data(true);
    for query in req.queries() {
        msg.add_query(query.clone());
    }
    let edns = msg.extensions_mut().get_or_insert_with(Edns::new);
    edns.set_version(0);
    edns.set_max_payload(EDNS_BUFFER_SIZE);
    edns.set_dnssec_ok(true);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    fn make_request(name: &str, rtype: RecordType) -> Message {
        let mut req = Message::new();
        req.set_id(0x4242).set_message_type(MessageType::Query);
        req.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
        req
    }

    #[test]
    fn test_servfail_preserves_id_and_question() {
        let req = make_request("example.com.", RecordType::A);
        let resp = servfail(&req);

        assert_eq!(resp.id(), req.id());
        assert_eq!(resp.message_type(), MessageType::Response);
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
        assert_eq!(resp.queries(), req.queries());
    }

    #[test]
    fn test_nxdomain() {
        let req = make_request("nope.example.com.", RecordType::AAAA);
        let resp = nxdomain(&req);
        assert_eq!(resp.response_code(), ResponseCode::NXDomain);
        assert_eq!(resp.id(), 0x4242);
    }

    #[test]
    fn test_default_edns_attached() {
        let req = make_request("example.com.", RecordType::A);
        let resp = servfail(&req);

        let edns = resp.extensions().as_ref().expect("EDNS attached");
        assert_eq!(edns.max_payload(), EDNS_BUFFER_SIZE);
        assert!(edns.dnssec_ok());
    }

    #[test]
    fn test_edns_echoes_client_opt() {
        let mut req = make_request("example.com.", RecordType::A);
        let edns = req.extensions_mut().get_or_insert_with(Edns::new);
        edns.set_max_payload(4096);
        edns.set_dnssec_ok(false);

        let resp = nxdomain(&req);
        let edns = resp.extensions().as_ref().unwrap();
        assert_eq!(edns.max_payload(), 4096);
        assert!(!edns.dnssec_ok());
    }

    #[test]
    fn test_edns_prefers_upstream_opt() {
        let mut req = make_request("example.com.", RecordType::A);
        req.extensions_mut()
            .get_or_insert_with(Edns::new)
            .set_max_payload(512);

        let mut upstream = make_request("example.com.", RecordType::A);
        upstream.set_message_type(MessageType::Response);
        upstream
            .extensions_mut()
            .get_or_insert_with(Edns::new)
            .set_max_payload(1400);

        let resp = from_upstream(&req, &upstream);
        assert_eq!(resp.extensions().as_ref().unwrap().max_payload(), 1400);
    }

    #[test]
    fn test_from_upstream_copies_sections() {
        let req = make_request("example.com.", RecordType::A);

        let mut upstream = Message::new();
        upstream
            .set_id(0x9999)
            .set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::NoError);
        upstream.add_query(req.queries()[0].clone());
        upstream.add_answer(Record::from_rdata(
            Name::from_str("example.com.").unwrap(),
            300,
            RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
        ));

        let resp = from_upstream(&req, &upstream);
        assert_eq!(resp.id(), req.id());
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(resp.response_code(), ResponseCode::NoError);
    }

    #[test]
    fn test_blocked_a_query_gets_sink4() {
        let req = make_request("ads.doubleclick.net.", RecordType::A);
        let resp = blocked(&req, Ipv4Addr::UNSPECIFIED, Ipv6Addr::UNSPECIFIED);

        assert_eq!(resp.answers().len(), 1);
        let record = &resp.answers()[0];
        assert_eq!(record.ttl(), BLOCKED_TTL);
        match record.data() {
            RData::A(a) => assert_eq!(a.0, Ipv4Addr::UNSPECIFIED),
            other => panic!("expected A record, got {:?}", other),
        }
    }

    #[test]
    fn test_blocked_aaaa_query_gets_sink6() {
        let req = make_request("ads.doubleclick.net.", RecordType::AAAA);
        let resp = blocked(&req, Ipv4Addr::UNSPECIFIED, Ipv6Addr::UNSPECIFIED);

        assert_eq!(resp.answers().len(), 1);
        match resp.answers()[0].data() {
            RData::AAAA(aaaa) => assert_eq!(aaaa.0, Ipv6Addr::UNSPECIFIED),
            other => panic!("expected AAAA record, got {:?}", other),
        }
    }

    #[test]
    fn test_blocked_other_type_is_servfail() {
        let req = make_request("ads.doubleclick.net.", RecordType::MX);
        let resp = blocked(&req, Ipv4Addr::UNSPECIFIED, Ipv6Addr::UNSPECIFIED);
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
        assert!(resp.answers().is_empty());
    }

    #[test]
    fn test_upstream_request_shape() {
        let mut req = make_request("example.com.", RecordType::A);
        req.set_recursion_desired(false);

        let out = upstream_request(&req);
        assert_eq!(out.queries(), req.queries());
        assert!(out.recursion_desired());
        assert!(out.checking_disabled());
        assert_eq!(out.message_type(), MessageType::Query);

        let edns = out.extensions().as_ref().unwrap();
        assert_eq!(edns.max_payload(), EDNS_BUFFER_SIZE);
        assert!(edns.dnssec_ok());
    }
}
