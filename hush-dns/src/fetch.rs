//! HTTPS fetching through bootstrap resolvers
//!
//! Filter and TLD lists are fetched over HTTPS, but resolving the list
//! host through the proxy itself would deadlock a cold start behind its own
//! empty cache. Each HTTP client is therefore pinned to one bootstrap DNS
//! server: hostname lookups go straight to that server via a custom
//! resolver implementation.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use reqwest::dns::{Addrs, Name as HostName, Resolve, Resolving};

use crate::client::UpstreamClient;
use crate::error::{Error, Result};
use crate::reply::EDNS_BUFFER_SIZE;

/// Pause between attempts on consecutive bootstrap clients
pub const FETCH_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Per-request HTTP timeout
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolver that answers hostname lookups through one bootstrap DNS server
struct BootstrapResolver {
    client: Arc<UpstreamClient>,
}

impl BootstrapResolver {
    async fn lookup(client: Arc<UpstreamClient>, host: String) -> Result<Vec<SocketAddr>> {
        let name: Name = host
            .parse()
            .map_err(|e| Error::Fetch(format!("invalid hostname {}: {}", host, e)))?;

        let mut req = Message::new();
        req.set_id(rand::random::<u16>())
            .set_message_type(MessageType::Query)
            .set_recursion_desired(true);
        req.add_query(Query::query(name, RecordType::A));
        let edns = req
            .extensions_mut()
            .get_or_insert_with(hickory_proto::op::Edns::new);
        edns.set_version(0);
        edns.set_max_payload(EDNS_BUFFER_SIZE);

        let resp = client.exchange(&req).await?;
        let addrs: Vec<SocketAddr> = resp
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                RData::A(a) => Some(SocketAddr::new(IpAddr::V4(a.0), 0)),
                RData::AAAA(aaaa) => Some(SocketAddr::new(IpAddr::V6(aaaa.0), 0)),
                _ => None,
            })
            .collect();
        if addrs.is_empty() {
            return Err(Error::Fetch(format!("no addresses for host {}", host)));
        }
        Ok(addrs)
    }
}

impl Resolve for BootstrapResolver {
    fn resolve(&self, name: HostName) -> Resolving {
        let client = self.client.clone();
        let host = name.as_str().to_string();
        Box::pin(async move {
            match BootstrapResolver::lookup(client, host).await {
                Ok(addrs) => Ok(Box::new(addrs.into_iter()) as Addrs),
                Err(e) => Err(e.into()),
            }
        })
    }
}

/// Pool of HTTPS clients, one per bootstrap resolver, tried in order
pub struct BootstrapHttpPool {
    clients: Vec<reqwest::Client>,
}

impl BootstrapHttpPool {
    /// Build one HTTPS client per bootstrap DNS client
    pub fn new(bootstrap: &[Arc<UpstreamClient>]) -> Result<Self> {
        let mut clients = Vec::with_capacity(bootstrap.len());
        for dns_client in bootstrap {
            let client = reqwest::Client::builder()
                .use_rustls_tls()
                .timeout(HTTP_TIMEOUT)
                .dns_resolver(Arc::new(BootstrapResolver {
                    client: dns_client.clone(),
                }))
                .build()
                .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;
            clients.push(client);
        }
        Ok(BootstrapHttpPool { clients })
    }

    /// Fetch a URL, trying each client in order with a short pause between
    /// attempts. Transport failures move on to the next client; a non-200
    /// status is an application error and aborts immediately.
    pub async fn get(&self, url: &str) -> Result<String> {
        let mut last_err = Error::Fetch(format!("no bootstrap HTTP clients for {}", url));
        for (attempt, client) in self.clients.iter().enumerate() {
            if attempt > 0 {
                tokio::time::sleep(FETCH_RETRY_PAUSE).await;
            }
            match client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status != reqwest::StatusCode::OK {
                        return Err(Error::Fetch(format!(
                            "unexpected HTTP status fetching {}: {}",
                            url, status
                        )));
                    }
                    match resp.text().await {
                        Ok(body) => return Ok(body),
                        Err(e) => {
                            last_err =
                                Error::Fetch(format!("failed to read body of {}: {}", url, e));
                        }
                    }
                }
                Err(e) => {
                    last_err = Error::Fetch(format!("request to {} failed: {}", url, e));
                }
            }
        }
        Err(last_err)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
