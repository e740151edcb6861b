//! DNS proxy server
//!
//! Binds the configured listen address on UDP and TCP, spawns one task per
//! inbound query, and wires the whole data plane together: client pools,
//! response cache, ad-block filter, TLD table, statistics, and the handler
//! pipeline. Background maintenance (cache compaction, filter and TLD
//! refresh, stat reporting) runs as long-lived tasks tied to a shutdown
//! broadcast.

use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;

use crate::cache::ResponseCache;
use crate::classify::Classifier;
use crate::client::{tls_client_config, ClientPool, UpstreamClient};
use crate::config::{Config, Proto};
use crate::error::{Error, Result};
use crate::fetch::BootstrapHttpPool;
use crate::filter::AdBlockFilter;
use crate::handler::Handler;
use crate::inflight;
use crate::reply::EDNS_BUFFER_SIZE;
use crate::stats::{self, StatRing};
use crate::tld::{TldRefresher, TldTable};

/// Receive buffer for inbound UDP queries
const MAX_UDP_PACKET: usize = 4096;

/// Largest DNS message accepted over TCP
const MAX_TCP_MESSAGE: usize = 65_535;

/// Smallest UDP payload a client can be assumed to accept
const MIN_UDP_PAYLOAD: usize = 512;

/// The assembled forwarder
pub struct Server {
    handler: Arc<Handler>,
    cache: Arc<ResponseCache>,
    listen_addr: SocketAddr,
    listen_proto: Proto,
    shutdown_tx: broadcast::Sender<()>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl Server {
    /// Build the data plane from a validated configuration and spawn its
    /// background tasks
    pub fn new(config: Config) -> Result<Server> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let tls = tls_client_config()?;

        let upstream_pool = ClientPool::new(&config.upstream_servers, tls.clone());
        let local_pool = ClientPool::new(&config.local_name_servers, tls.clone());

        // Bootstrap HTTPS clients resolve through the upstream servers
        // directly, so list fetching never depends on the proxy itself.
        let bootstrap: Vec<Arc<UpstreamClient>> = config
            .upstream_servers
            .iter()
            .map(|server| Arc::new(UpstreamClient::new(server, tls.clone())))
            .collect();

        let (cache, maintenance) = ResponseCache::new(config.cache_settings());
        let (filter, filter_refresher) = AdBlockFilter::new(
            config.ad_blocker.abp_filter_url.clone(),
            BootstrapHttpPool::new(&bootstrap)?,
        );
        let tlds = Arc::new(TldTable::new());
        let tld_refresher = TldRefresher {
            table: tlds.clone(),
            http: BootstrapHttpPool::new(&bootstrap)?,
        };
        let stats = Arc::new(StatRing::new());

        let handler = Arc::new(Handler::new(
            cache.clone(),
            filter,
            upstream_pool,
            local_pool,
            Classifier::new(tlds),
            stats.clone(),
            config.ad_blocker.sink_ip4,
            config.ad_blocker.sink_ip6,
        ));

        let background = vec![
            tokio::spawn(maintenance.run(shutdown_tx.subscribe())),
            tokio::spawn(filter_refresher.run(shutdown_tx.subscribe())),
            tokio::spawn(tld_refresher.run(shutdown_tx.subscribe())),
            tokio::spawn(stats::report_loop(stats, shutdown_tx.subscribe())),
        ];

        Ok(Server {
            handler,
            cache,
            listen_addr: config.listener.sock_addr(),
            listen_proto: config.listener.proto,
            shutdown_tx,
            background,
        })
    }

    /// Handle used to signal shutdown from outside
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Response cache handle, for external flush signals
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Bind the listeners and serve until shutdown
    pub async fn run(self) -> Result<()> {
        // TCP support is mandatory for truncated answers (RFC 7766); a
        // listener configured for udp binds both transports.
        let tcp = TcpListener::bind(self.listen_addr).await?;
        let udp = match self.listen_proto {
            Proto::Udp => Some(Arc::new(UdpSocket::bind(self.listen_addr).await?)),
            Proto::Tcp => None,
            Proto::TcpTls => {
                return Err(Error::Config(
                    "listener protocol must be udp or tcp".into(),
                ))
            }
        };
        log::info!(
            "DNS forwarder listening on {} ({})",
            self.listen_addr,
            if udp.is_some() { "udp+tcp" } else { "tcp" },
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut udp_buf = vec![0u8; MAX_UDP_PACKET];
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,

                result = recv_udp(udp.as_deref(), &mut udp_buf), if udp.is_some() => {
                    match result {
                        Ok((len, peer)) => {
                            let socket = udp.as_ref().expect("udp branch enabled").clone();
                            let handler = self.handler.clone();
                            let packet = udp_buf[..len].to_vec();
                            tokio::spawn(async move {
                                serve_udp_query(socket, handler, packet, peer).await;
                            });
                        }
                        Err(e) => log::error!("UDP receive failed: {}", e),
                    }
                }

                result = tcp.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_tcp_conn(stream, handler, peer).await {
                                    log::debug!("TCP session with {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => log::error!("TCP accept failed: {}", e),
                    }
                }
            }
        }

        log::info!("DNS forwarder shutting down");
        for task in self.background {
            task.abort();
        }
        Ok(())
    }
}

async fn recv_udp(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn serve_udp_query(
    socket: Arc<UdpSocket>,
    handler: Arc<Handler>,
    packet: Vec<u8>,
    peer: SocketAddr,
) {
    let local = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            log::error!("UDP socket has no local address: {}", e);
            return;
        }
    };
    let req = match Message::from_vec(&packet) {
        Ok(req) => req,
        Err(e) => {
            log::warn!("unparseable query from {}: {}", peer, e);
            if let Some(resp) = garbled_servfail(&packet) {
                let _ = socket.send_to(&resp, peer).await;
            }
            return;
        }
    };

    let payload_limit = udp_payload_limit(&req);
    let mut resp = handler.serve(req, local, peer).await;
    match encode_for_udp(&mut resp, payload_limit) {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, peer).await {
                log::warn!("failed to send UDP response to {}: {}", peer, e);
            }
        }
        Err(e) => log::warn!("failed to encode response for {}: {}", peer, e),
    }
}

async fn serve_tcp_conn(
    mut stream: TcpStream,
    handler: Arc<Handler>,
    peer: SocketAddr,
) -> Result<()> {
    let local = stream.local_addr()?;
    loop {
        let mut len_buf = [0u8; 2];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            // Clean end of the client session.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let msg_len = usize::from(u16::from_be_bytes(len_buf));
        if msg_len == 0 || msg_len > MAX_TCP_MESSAGE {
            return Err(Error::Malformed(format!(
                "TCP message length {} out of range",
                msg_len
            )));
        }
        let mut packet = vec![0u8; msg_len];
        stream.read_exact(&mut packet).await?;

        let resp = match Message::from_vec(&packet) {
            Ok(req) => handler.serve(req, local, peer).await.to_vec()?,
            Err(e) => {
                log::warn!("unparseable TCP query from {}: {}", peer, e);
                match garbled_servfail(&packet) {
                    Some(resp) => resp,
                    None => return Ok(()),
                }
            }
        };
        let mut framed = Vec::with_capacity(2 + resp.len());
        framed.extend_from_slice(&(resp.len() as u16).to_be_bytes());
        framed.extend_from_slice(&resp);
        stream.write_all(&framed).await?;
    }
}

/// The client still deserves a reply with its ID when the query would not
/// even parse; build a header-only ServFail from the raw ID bytes.
fn garbled_servfail(packet: &[u8]) -> Option<Vec<u8>> {
    if packet.len() < 2 {
        return None;
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let mut resp = Message::new();
    resp.set_id(id)
        .set_message_type(MessageType::Response)
        .set_response_code(ResponseCode::ServFail);
    resp.to_vec().ok()
}

/// Largest UDP payload the client advertised, clamped to sane bounds
fn udp_payload_limit(req: &Message) -> usize {
    let advertised = req
        .extensions()
        .as_ref()
        .map(|edns| usize::from(edns.max_payload()))
        .unwrap_or(MIN_UDP_PAYLOAD);
    advertised.clamp(MIN_UDP_PAYLOAD, usize::from(EDNS_BUFFER_SIZE))
}

/// Encode a response for UDP, truncating it if it exceeds the payload limit
fn encode_for_udp(resp: &mut Message, limit: usize) -> Result<Vec<u8>> {
    let bytes = resp.to_vec()?;
    if bytes.len() <= limit {
        return Ok(bytes);
    }
    resp.set_truncated(true);
    resp.answers_mut().clear();
    resp.name_servers_mut().clear();
    resp.additionals_mut().clear();
    Ok(resp.to_vec()?)
}

/// Session tag helper re-exported for integration tests and embedders
pub fn session_tag(local: SocketAddr, peer: SocketAddr) -> String {
    inflight::session_tag(local, peer)
}
