//! Canonical domain names and reverse-lookup helpers
//!
//! The cache and the block filter key everything by the canonical form of a
//! name: lowercase with a trailing dot. Reverse (PTR) queries are mapped back
//! to the IP address they encode so the classifier can route them.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hickory_proto::rr::Name;

/// Suffix of IPv4 reverse-lookup names
pub const PTR_SUFFIX_V4: &str = ".in-addr.arpa.";

/// Suffix of IPv6 reverse-lookup names
pub const PTR_SUFFIX_V6: &str = ".ip6.arpa.";

/// Canonicalize a textual domain name: lowercase with a trailing dot
pub fn canonical_name(name: &str) -> String {
    let mut cname = name.trim().to_ascii_lowercase();
    if !cname.ends_with('.') {
        cname.push('.');
    }
    cname
}

/// Canonicalize a wire-format name
pub fn canonical_from(name: &Name) -> String {
    canonical_name(&name.to_string())
}

/// Iterate over a canonical name and its suffix ancestors, ending at the TLD
/// (the root label is never yielded): `a.b.c.` → `a.b.c.`, `b.c.`, `c.`
pub fn suffix_ancestors(cname: &str) -> impl Iterator<Item = &str> {
    let mut rest = cname.trim_start_matches('.');
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let current = rest;
        rest = match rest.find('.') {
            Some(dot) => &rest[dot + 1..],
            None => "",
        };
        Some(current)
    })
}

/// Reconstruct the IP address encoded in a reverse-lookup name.
///
/// Expects the canonical form. IPv4 names carry exactly four octets, IPv6
/// names exactly 32 nibbles; anything else returns `None`.
pub fn reverse_name_to_ip(cname: &str) -> Option<IpAddr> {
    if let Some(rev) = cname.strip_suffix(PTR_SUFFIX_V4) {
        let octets: Vec<&str> = rev.split('.').collect();
        if octets.len() != 4 {
            return None;
        }
        let mut ip = [0u8; 4];
        for (i, seg) in octets.iter().rev().enumerate() {
            ip[i] = seg.parse().ok()?;
        }
        return Some(IpAddr::V4(Ipv4Addr::from(ip)));
    }
    if let Some(rev) = cname.strip_suffix(PTR_SUFFIX_V6) {
        let nibbles: Vec<&str> = rev.split('.').collect();
        if nibbles.len() != 32 {
            return None;
        }
        let mut value: u128 = 0;
        for seg in nibbles.iter().rev() {
            if seg.len() != 1 {
                return None;
            }
            let nibble = u8::from_str_radix(seg, 16).ok()?;
            value = (value << 4) | u128::from(nibble);
        }
        return Some(IpAddr::V6(Ipv6Addr::from(value)));
    }
    None
}

/// Whether the name is under one of the reverse-lookup zones
pub fn is_reverse_name(cname: &str) -> bool {
    cname.ends_with(PTR_SUFFIX_V4) || cname.ends_with(PTR_SUFFIX_V6)
}

/// Whether the address belongs to the special reserved space that must never
/// be resolved upstream: loopback, private, link-local, multicast, unspecified
pub fn is_special_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || is_v6_unique_local(&v6)
                || is_v6_link_local(&v6)
        }
    }
}

/// Whether the address is a routable global unicast address
pub fn is_global_unicast(ip: IpAddr) -> bool {
    if is_special_ip(ip) {
        return false;
    }
    match ip {
        IpAddr::V4(v4) => !v4.is_broadcast() && !v4.is_documentation(),
        IpAddr::V6(_) => true,
    }
}

// fc00::/7
fn is_v6_unique_local(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

// fe80::/10
fn is_v6_link_local(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_canonical_name_lowercases_and_appends_dot() {
        assert_eq!(canonical_name("Example.COM"), "example.com.");
        assert_eq!(canonical_name("example.com."), "example.com.");
        assert_eq!(canonical_name("  ads.Example.net  "), "ads.example.net.");
    }

    #[test]
    fn test_canonical_from_wire_name() {
        let name = Name::from_str("WWW.Example.Com.").unwrap();
        assert_eq!(canonical_from(&name), "www.example.com.");
    }

    #[test]
    fn test_suffix_ancestors() {
        let ancestors: Vec<&str> = suffix_ancestors("ads.example.com.").collect();
        assert_eq!(ancestors, vec!["ads.example.com.", "example.com.", "com."]);
    }

    #[test]
    fn test_suffix_ancestors_single_label() {
        let ancestors: Vec<&str> = suffix_ancestors("corp.").collect();
        assert_eq!(ancestors, vec!["corp."]);
    }

    #[test]
    fn test_reverse_name_to_ip_v4() {
        let ip = reverse_name_to_ip("1.0.0.127.in-addr.arpa.").unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::LOCALHOST));

        let ip = reverse_name_to_ip("8.8.8.8.in-addr.arpa.").unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_reverse_name_to_ip_v4_malformed() {
        assert!(reverse_name_to_ip("0.127.in-addr.arpa.").is_none());
        assert!(reverse_name_to_ip("1.0.0.999.in-addr.arpa.").is_none());
        assert!(reverse_name_to_ip("a.0.0.127.in-addr.arpa.").is_none());
    }

    #[test]
    fn test_reverse_name_to_ip_v6() {
        // ::1 reversed: 31 zero nibbles then 1
        let mut nibbles = vec!["1"];
        nibbles.extend(std::iter::repeat("0").take(31));
        let name = format!("{}.ip6.arpa.", nibbles.join("."));
        let ip = reverse_name_to_ip(&name).unwrap();
        assert_eq!(ip, IpAddr::V6(Ipv6Addr::LOCALHOST));
    }

    #[test]
    fn test_reverse_name_to_ip_v6_malformed() {
        assert!(reverse_name_to_ip("1.0.0.ip6.arpa.").is_none());
        assert!(reverse_name_to_ip("zz.0.0.0.ip6.arpa.").is_none());
    }

    #[test]
    fn test_reverse_name_to_ip_not_reverse() {
        assert!(reverse_name_to_ip("example.com.").is_none());
    }

    #[test]
    fn test_is_special_ip() {
        assert!(is_special_ip("127.0.0.1".parse().unwrap()));
        assert!(is_special_ip("10.1.2.3".parse().unwrap()));
        assert!(is_special_ip("192.168.0.1".parse().unwrap()));
        assert!(is_special_ip("169.254.1.1".parse().unwrap()));
        assert!(is_special_ip("224.0.0.1".parse().unwrap()));
        assert!(is_special_ip("0.0.0.0".parse().unwrap()));
        assert!(is_special_ip("::1".parse().unwrap()));
        assert!(is_special_ip("fe80::1".parse().unwrap()));
        assert!(is_special_ip("fd00::1".parse().unwrap()));

        assert!(!is_special_ip("8.8.8.8".parse().unwrap()));
        assert!(!is_special_ip("2606:4700::1111".parse().unwrap()));
    }

    #[test]
    fn test_is_global_unicast() {
        assert!(is_global_unicast("8.8.8.8".parse().unwrap()));
        assert!(is_global_unicast("2001:4860:4860::8888".parse().unwrap()));

        assert!(!is_global_unicast("255.255.255.255".parse().unwrap()));
        assert!(!is_global_unicast("192.0.2.1".parse().unwrap()));
        assert!(!is_global_unicast("10.0.0.1".parse().unwrap()));
        assert!(!is_global_unicast("ff02::1".parse().unwrap()));
    }
}
