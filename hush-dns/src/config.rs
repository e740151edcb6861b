//! Configuration file parsing and validation
//!
//! The config is a small JSON document (4 KiB cap). Every field is required
//! and validated up front; a bad config is a fatal startup error, never a
//! silently-defaulted one.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

use hickory_proto::rr::RecordType;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheSettings, DEFAULT_MAX_TTL};
use crate::error::{Error, Result};

/// Upper bound on the config file size in bytes
pub const MAX_CONFIG_FILE_SIZE: u64 = 4096;

/// Default DNS listen port
pub const DEFAULT_LISTEN_PORT: u16 = 53;

/// Transport protocol of a DNS server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Proto {
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "tcp-tls")]
    TcpTls,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Udp => write!(f, "udp"),
            Proto::Tcp => write!(f, "tcp"),
            Proto::TcpTls => write!(f, "tcp-tls"),
        }
    }
}

/// One upstream or local-network DNS server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub ip: IpAddr,
    pub port: u16,
    pub proto: Proto,
}

impl ServerSpec {
    pub fn sock_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Config(format!(
                "invalid port 0 for server {}",
                self.ip
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sock_addr(), self.proto)
    }
}

/// Ad-block filter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdBlockerConfig {
    #[serde(rename = "abpFilterURL")]
    pub abp_filter_url: String,
    #[serde(rename = "sinkIP4", default = "default_sink4")]
    pub sink_ip4: Ipv4Addr,
    #[serde(rename = "sinkIP6", default = "default_sink6")]
    pub sink_ip6: Ipv6Addr,
}

fn default_sink4() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_sink6() -> Ipv6Addr {
    Ipv6Addr::UNSPECIFIED
}

/// Response-cache settings as written in the file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(rename = "cacheSize")]
    pub cache_size: usize,
    /// Floor applied to reported TTLs, seconds
    #[serde(rename = "cacheTTL")]
    pub cache_ttl: u64,
    #[serde(rename = "recordTypes")]
    pub record_types: Vec<String>,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub ip: IpAddr,
    #[serde(default = "default_listen_port")]
    pub port: u16,
    pub proto: Proto,
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

impl ListenerConfig {
    pub fn sock_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "upstreamServers")]
    pub upstream_servers: Vec<ServerSpec>,
    #[serde(rename = "LocalNameServers")]
    pub local_name_servers: Vec<ServerSpec>,
    #[serde(rename = "adBlocker")]
    pub ad_blocker: AdBlockerConfig,
    #[serde(rename = "cacheConfig")]
    pub cache: CacheSection,
    #[serde(rename = "listenerConfig")]
    pub listener: ListenerConfig,
}

impl Config {
    /// Load and validate a config file, enforcing the size cap
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let metadata = std::fs::metadata(&path)?;
        if metadata.is_dir() {
            return Err(Error::Config(format!(
                "config path is a directory: {}",
                path.as_ref().display()
            )));
        }
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(Error::Config(format!(
                "config file exceeds {} bytes: {}",
                MAX_CONFIG_FILE_SIZE,
                path.as_ref().display()
            )));
        }
        let content = std::fs::read_to_string(&path)?;
        Self::from_json(&content)
    }

    /// Parse and validate a config document
    pub fn from_json(content: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        if self.upstream_servers.is_empty() {
            return Err(Error::Config("no upstream servers configured".into()));
        }
        for server in self
            .upstream_servers
            .iter()
            .chain(self.local_name_servers.iter())
        {
            server.validate()?;
        }

        // De-duplicate upstreams by IP, keeping the first occurrence.
        let mut seen = FxHashSet::default();
        self.upstream_servers.retain(|server| seen.insert(server.ip));

        if self.listener.port == 0 {
            return Err(Error::Config("invalid listener port 0".into()));
        }
        if self.listener.proto == Proto::TcpTls {
            return Err(Error::Config(
                "listener protocol must be udp or tcp".into(),
            ));
        }

        if self.cache.cache_size == 0 {
            return Err(Error::Config("cache size must be positive".into()));
        }
        if self.cache.cache_ttl == 0 || self.cache.cache_ttl > DEFAULT_MAX_TTL {
            return Err(Error::Config(format!(
                "cache TTL must be within 1..={}: {}",
                DEFAULT_MAX_TTL, self.cache.cache_ttl
            )));
        }
        if self.cache.record_types.is_empty() {
            return Err(Error::Config("no cached record types configured".into()));
        }
        for name in &self.cache.record_types {
            record_type_from_name(name)?;
        }
        if self.ad_blocker.abp_filter_url.is_empty() {
            return Err(Error::Config("ad-block filter URL is empty".into()));
        }
        Ok(())
    }

    /// Resolve the cache section into runtime settings
    pub fn cache_settings(&self) -> CacheSettings {
        let cached_types = self
            .cache
            .record_types
            .iter()
            .map(|name| record_type_from_name(name).expect("validated record type"))
            .collect();
        CacheSettings {
            capacity: self.cache.cache_size,
            min_ttl: self.cache.cache_ttl,
            max_ttl: DEFAULT_MAX_TTL,
            cached_types,
        }
    }

    /// A commented sample configuration document
    pub fn sample() -> String {
        r#"{
  "upstreamServers": [
    {"ip": "1.1.1.1", "port": 853, "proto": "tcp-tls"},
    {"ip": "1.0.0.1", "port": 853, "proto": "tcp-tls"}
  ],
  "LocalNameServers": [
    {"ip": "192.168.1.1", "port": 53, "proto": "udp"}
  ],
  "adBlocker": {
    "abpFilterURL": "https://abp.oisd.nl/",
    "sinkIP4": "0.0.0.0",
    "sinkIP6": "::"
  },
  "cacheConfig": {
    "cacheSize": 4096,
    "cacheTTL": 600,
    "recordTypes": ["A", "AAAA", "CNAME", "DNAME", "PTR", "SRV", "TXT"]
  },
  "listenerConfig": {
    "ip": "127.0.0.1",
    "port": 53,
    "proto": "udp"
  }
}
"#
        .to_string()
    }
}

/// Map a configured record-type name to its wire type
pub fn record_type_from_name(name: &str) -> Result<RecordType> {
    let rtype = match name {
        "A" => RecordType::A,
        "AAAA" => RecordType::AAAA,
        "CNAME" => RecordType::CNAME,
        "DNAME" => RecordType::Unknown(39),
        "MX" => RecordType::MX,
        "NS" => RecordType::NS,
        "PTR" => RecordType::PTR,
        "SOA" => RecordType::SOA,
        "SRV" => RecordType::SRV,
        "TXT" => RecordType::TXT,
        other => {
            return Err(Error::Config(format!(
                "unsupported cached record type: {}",
                other
            )))
        }
    };
    Ok(rtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_parses() {
        let config = Config::from_json(&Config::sample()).unwrap();
        assert_eq!(config.upstream_servers.len(), 2);
        assert_eq!(config.upstream_servers[0].proto, Proto::TcpTls);
        assert_eq!(config.upstream_servers[0].port, 853);
        assert_eq!(config.listener.port, 53);
        assert_eq!(config.ad_blocker.sink_ip4, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_sample_config_within_size_cap() {
        assert!(Config::sample().len() as u64 <= MAX_CONFIG_FILE_SIZE);
    }

    #[test]
    fn test_duplicate_upstreams_deduplicated() {
        let doc = r#"{
          "upstreamServers": [
            {"ip": "1.1.1.1", "port": 853, "proto": "tcp-tls"},
            {"ip": "1.1.1.1", "port": 53, "proto": "udp"},
            {"ip": "8.8.8.8", "port": 53, "proto": "udp"}
          ],
          "LocalNameServers": [],
          "adBlocker": {"abpFilterURL": "https://abp.oisd.nl/"},
          "cacheConfig": {"cacheSize": 16, "cacheTTL": 600, "recordTypes": ["A"]},
          "listenerConfig": {"ip": "127.0.0.1", "port": 53, "proto": "udp"}
        }"#;
        let config = Config::from_json(doc).unwrap();
        assert_eq!(config.upstream_servers.len(), 2);
        assert_eq!(config.upstream_servers[0].port, 853);
    }

    #[test]
    fn test_missing_field_is_fatal() {
        let doc = r#"{
          "upstreamServers": [{"ip": "1.1.1.1", "port": 853, "proto": "tcp-tls"}],
          "LocalNameServers": []
        }"#;
        assert!(matches!(Config::from_json(doc), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_proto_rejected() {
        let doc = r#"{
          "upstreamServers": [{"ip": "1.1.1.1", "port": 53, "proto": "sctp"}],
          "LocalNameServers": [],
          "adBlocker": {"abpFilterURL": "https://abp.oisd.nl/"},
          "cacheConfig": {"cacheSize": 16, "cacheTTL": 600, "recordTypes": ["A"]},
          "listenerConfig": {"ip": "127.0.0.1", "port": 53, "proto": "udp"}
        }"#;
        assert!(Config::from_json(doc).is_err());
    }

    #[test]
    fn test_port_zero_rejected() {
        let doc = r#"{
          "upstreamServers": [{"ip": "1.1.1.1", "port": 0, "proto": "udp"}],
          "LocalNameServers": [],
          "adBlocker": {"abpFilterURL": "https://abp.oisd.nl/"},
          "cacheConfig": {"cacheSize": 16, "cacheTTL": 600, "recordTypes": ["A"]},
          "listenerConfig": {"ip": "127.0.0.1", "port": 53, "proto": "udp"}
        }"#;
        assert!(matches!(Config::from_json(doc), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_upstreams_rejected() {
        let doc = r#"{
          "upstreamServers": [],
          "LocalNameServers": [],
          "adBlocker": {"abpFilterURL": "https://abp.oisd.nl/"},
          "cacheConfig": {"cacheSize": 16, "cacheTTL": 600, "recordTypes": ["A"]},
          "listenerConfig": {"ip": "127.0.0.1", "port": 53, "proto": "udp"}
        }"#;
        assert!(matches!(Config::from_json(doc), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_record_type_rejected() {
        let doc = r#"{
          "upstreamServers": [{"ip": "1.1.1.1", "port": 53, "proto": "udp"}],
          "LocalNameServers": [],
          "adBlocker": {"abpFilterURL": "https://abp.oisd.nl/"},
          "cacheConfig": {"cacheSize": 16, "cacheTTL": 600, "recordTypes": ["WKS"]},
          "listenerConfig": {"ip": "127.0.0.1", "port": 53, "proto": "udp"}
        }"#;
        assert!(matches!(Config::from_json(doc), Err(Error::Config(_))));
    }

    #[test]
    fn test_tls_listener_rejected() {
        let doc = r#"{
          "upstreamServers": [{"ip": "1.1.1.1", "port": 53, "proto": "udp"}],
          "LocalNameServers": [],
          "adBlocker": {"abpFilterURL": "https://abp.oisd.nl/"},
          "cacheConfig": {"cacheSize": 16, "cacheTTL": 600, "recordTypes": ["A"]},
          "listenerConfig": {"ip": "127.0.0.1", "port": 53, "proto": "tcp-tls"}
        }"#;
        assert!(matches!(Config::from_json(doc), Err(Error::Config(_))));
    }

    #[test]
    fn test_cache_ttl_out_of_range_rejected() {
        let doc = r#"{
          "upstreamServers": [{"ip": "1.1.1.1", "port": 53, "proto": "udp"}],
          "LocalNameServers": [],
          "adBlocker": {"abpFilterURL": "https://abp.oisd.nl/"},
          "cacheConfig": {"cacheSize": 16, "cacheTTL": 100000, "recordTypes": ["A"]},
          "listenerConfig": {"ip": "127.0.0.1", "port": 53, "proto": "udp"}
        }"#;
        assert!(matches!(Config::from_json(doc), Err(Error::Config(_))));
    }

    #[test]
    fn test_record_type_mapping() {
        assert_eq!(record_type_from_name("A").unwrap(), RecordType::A);
        assert_eq!(record_type_from_name("AAAA").unwrap(), RecordType::AAAA);
        assert_eq!(record_type_from_name("DNAME").unwrap(), RecordType::Unknown(39));
        assert!(record_type_from_name("BOGUS").is_err());
    }

    #[test]
    fn test_server_spec_display() {
        let spec = ServerSpec {
            ip: "1.1.1.1".parse().unwrap(),
            port: 853,
            proto: Proto::TcpTls,
        };
        assert_eq!(spec.to_string(), "1.1.1.1:853/tcp-tls");
    }

    #[test]
    fn test_cache_settings_resolution() {
        let config = Config::from_json(&Config::sample()).unwrap();
        let settings = config.cache_settings();
        assert_eq!(settings.capacity, 4096);
        assert_eq!(settings.min_ttl, 600);
        assert_eq!(settings.max_ttl, DEFAULT_MAX_TTL);
        assert!(settings.cached_types.contains(&RecordType::A));
        assert!(settings.cached_types.contains(&RecordType::Unknown(39)));
    }
}
