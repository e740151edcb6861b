//! Upstream DNS clients and the round-robin pool
//!
//! One client per configured upstream server. UDP clients are stateless and
//! fall back to a one-shot TCP exchange when the response comes back
//! truncated. TCP and TLS clients keep a persistent connection that is
//! renewed on I/O failure with exponential backoff; a generation id on the
//! connection prevents two tasks that failed on the same connection from
//! renewing it twice.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::{Proto, ServerSpec};
use crate::error::{Error, Result};

/// Connection dial timeout
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-exchange I/O timeout
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Initial renewal backoff, doubled per attempt
pub const RENEW_BACKOFF: Duration = Duration::from_millis(10);

/// Connection renewals attempted before an exchange gives up
pub const MAX_RETRY: usize = 3;

/// Largest UDP response accepted
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Largest stream response accepted
const MAX_STREAM_RESPONSE_SIZE: usize = 65_535;

/// Build the shared TLS client configuration with webpki roots
pub fn tls_client_config() -> Result<Arc<rustls::ClientConfig>> {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Config(format!("failed to create TLS config: {}", e)))?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(Arc::new(config))
}

/// A client for one upstream server
pub enum UpstreamClient {
    Udp(UdpClient),
    Stream(StreamClient),
}

impl UpstreamClient {
    pub fn new(server: &ServerSpec, tls_config: Arc<rustls::ClientConfig>) -> Self {
        let addr = server.sock_addr();
        match server.proto {
            Proto::Udp => UpstreamClient::Udp(UdpClient { addr }),
            Proto::Tcp => UpstreamClient::Stream(StreamClient::new(addr, None)),
            Proto::TcpTls => UpstreamClient::Stream(StreamClient::new(
                addr,
                Some((tls_config, ServerName::from(addr.ip()))),
            )),
        }
    }

    /// Exchange a query with the upstream server
    pub async fn exchange(&self, req: &Message) -> Result<Message> {
        match self {
            UpstreamClient::Udp(client) => client.exchange(req).await,
            UpstreamClient::Stream(client) => client.exchange(req).await,
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        match self {
            UpstreamClient::Udp(client) => client.addr,
            UpstreamClient::Stream(client) => client.addr,
        }
    }
}

/// Stateless UDP client with TCP fallback on truncation
pub struct UdpClient {
    addr: SocketAddr,
}

impl UdpClient {
    async fn exchange(&self, req: &Message) -> Result<Message> {
        let bind_addr: SocketAddr = if self.addr.is_ipv6() {
            "[::]:0".parse().expect("valid wildcard address")
        } else {
            "0.0.0.0:0".parse().expect("valid wildcard address")
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        let query = req.to_vec()?;
        socket.send_to(&query, self.addr).await?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
        let (len, _) = tokio::time::timeout(EXCHANGE_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::Upstream(format!("UDP exchange with {} timed out", self.addr)))??;
        let resp = Message::from_vec(&buf[..len])?;
        if resp.id() != req.id() {
            return Err(Error::Upstream(format!(
                "response ID {} does not match query ID {}",
                resp.id(),
                req.id()
            )));
        }
        if resp.truncated() {
            // Retry over a one-shot TCP connection.
            log::debug!("UDP response from {} truncated, retrying over TCP", self.addr);
            let mut stream = dial_tcp(self.addr).await?;
            return exchange_stream(&mut stream, req).await;
        }
        Ok(resp)
    }
}

struct PooledConn {
    /// Generation id used for the renewal identity check
    id: u64,
    stream: Mutex<StreamKind>,
}

enum StreamKind {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// TCP or TLS client with a persistent, renewable connection
pub struct StreamClient {
    addr: SocketAddr,
    tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
    conn: Mutex<Option<Arc<PooledConn>>>,
    next_generation: AtomicU64,
}

impl StreamClient {
    fn new(addr: SocketAddr, tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>) -> Self {
        StreamClient {
            addr,
            tls,
            conn: Mutex::new(None),
            next_generation: AtomicU64::new(0),
        }
    }

    async fn exchange(&self, req: &Message) -> Result<Message> {
        let mut conn = self.current_or_dial().await?;
        let mut backoff = RENEW_BACKOFF;
        let mut attempt = 0;
        loop {
            match self.exchange_on(&conn, req).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    if attempt >= MAX_RETRY {
                        return Err(err);
                    }
                    attempt += 1;
                    log::debug!(
                        "exchange with {} failed ({}), renewing connection (attempt {}/{})",
                        self.addr,
                        err,
                        attempt,
                        MAX_RETRY
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    conn = self.renew(&conn).await?;
                }
            }
        }
    }

    async fn exchange_on(&self, conn: &PooledConn, req: &Message) -> Result<Message> {
        let mut stream = conn.stream.lock().await;
        match &mut *stream {
            StreamKind::Tcp(tcp) => exchange_stream(tcp, req).await,
            StreamKind::Tls(tls) => exchange_stream(tls.as_mut(), req).await,
        }
    }

    async fn current_or_dial(&self) -> Result<Arc<PooledConn>> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = Arc::new(self.dial().await?);
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Replace the connection, but only if the current one is still the one
    /// the caller failed on; concurrent failures renew once
    async fn renew(&self, failed: &Arc<PooledConn>) -> Result<Arc<PooledConn>> {
        let mut slot = self.conn.lock().await;
        if let Some(current) = slot.as_ref() {
            if current.id != failed.id {
                return Ok(current.clone());
            }
        }
        *slot = None;
        let conn = Arc::new(self.dial().await?);
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn dial(&self) -> Result<PooledConn> {
        let tcp = dial_tcp(self.addr).await?;
        let stream = match &self.tls {
            None => StreamKind::Tcp(tcp),
            Some((config, server_name)) => {
                let connector = TlsConnector::from(config.clone());
                let tls = tokio::time::timeout(
                    DIAL_TIMEOUT,
                    connector.connect(server_name.clone(), tcp),
                )
                .await
                .map_err(|_| {
                    Error::Upstream(format!("TLS handshake with {} timed out", self.addr))
                })??;
                StreamKind::Tls(Box::new(tls))
            }
        };
        Ok(PooledConn {
            id: self.next_generation.fetch_add(1, Ordering::Relaxed),
            stream: Mutex::new(stream),
        })
    }
}

async fn dial_tcp(addr: SocketAddr) -> Result<TcpStream> {
    tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Upstream(format!("TCP connect to {} timed out", addr)))?
        .map_err(Error::from)
}

/// One request/response exchange over a length-prefixed stream
async fn exchange_stream<S>(stream: &mut S, req: &Message) -> Result<Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let query = req.to_vec()?;
    let mut framed = Vec::with_capacity(2 + query.len());
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(&query);

    tokio::time::timeout(EXCHANGE_TIMEOUT, stream.write_all(&framed))
        .await
        .map_err(|_| Error::Upstream("stream write timed out".into()))??;

    let mut len_buf = [0u8; 2];
    tokio::time::timeout(EXCHANGE_TIMEOUT, stream.read_exact(&mut len_buf))
        .await
        .map_err(|_| Error::Upstream("stream read timed out".into()))??;
    let resp_len = usize::from(u16::from_be_bytes(len_buf));
    if resp_len > MAX_STREAM_RESPONSE_SIZE {
        return Err(Error::Upstream("DNS response too large".into()));
    }

    let mut resp_buf = vec![0u8; resp_len];
    tokio::time::timeout(EXCHANGE_TIMEOUT, stream.read_exact(&mut resp_buf))
        .await
        .map_err(|_| Error::Upstream("stream read timed out".into()))??;

    let resp = Message::from_vec(&resp_buf)?;
    if resp.id() != req.id() {
        return Err(Error::Upstream(format!(
            "response ID {} does not match query ID {}",
            resp.id(),
            req.id()
        )));
    }
    Ok(resp)
}

/// Round-robin pool of upstream clients
pub struct ClientPool {
    clients: Vec<Arc<UpstreamClient>>,
    next: AtomicUsize,
}

impl ClientPool {
    /// Build one client per server; an empty server list yields an empty
    /// pool whose `next_client` always returns `None`
    pub fn new(servers: &[ServerSpec], tls_config: Arc<rustls::ClientConfig>) -> Self {
        let clients = servers
            .iter()
            .map(|server| Arc::new(UpstreamClient::new(server, tls_config.clone())))
            .collect();
        ClientPool {
            clients,
            next: AtomicUsize::new(0),
        }
    }

    /// Next client in round-robin order
    pub fn next_client(&self) -> Option<Arc<UpstreamClient>> {
        if self.clients.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        Some(self.clients[idx].clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
