//! Listener lifecycle for the configured inbounds.

use proxyfleet_common::InboundConfig;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::identify::{read_header, PrefixedStream, UserMatcher};
use super::router::{BoxedStream, ConnectionRouter};
use super::EngineError;
use crate::tracker::{ConnMetadata, PacketConn};

const SUPPORTED_TYPES: &[&str] = &[
    "vless",
    "vmess",
    "trojan",
    "shadowsocks",
    "socks",
    "http",
    "mixed",
];

const UDP_TYPES: &[&str] = &["shadowsocks", "socks", "mixed"];

struct PlannedInbound {
    tag: String,
    kind: String,
    addr: SocketAddr,
    udp: bool,
    users: Arc<UserMatcher>,
}

struct RunningInbound {
    tag: String,
    tcp_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

pub struct InboundManager {
    planned: Vec<PlannedInbound>,
    running: Vec<RunningInbound>,
}

impl InboundManager {
    /// Checks every inbound can be served. Nothing is bound yet.
    pub fn new(inbounds: &[InboundConfig]) -> Result<Self, EngineError> {
        let mut planned = Vec::with_capacity(inbounds.len());
        for inbound in inbounds {
            let kind = inbound.kind.to_ascii_lowercase();
            if !SUPPORTED_TYPES.contains(&kind.as_str()) {
                return Err(EngineError::InvalidInbound {
                    tag: inbound.tag.clone(),
                    kind: inbound.kind.clone(),
                    reason: "unsupported inbound type".to_string(),
                });
            }
            let ip: IpAddr = inbound
                .listen
                .parse()
                .map_err(|_| EngineError::InvalidInbound {
                    tag: inbound.tag.clone(),
                    kind: inbound.kind.clone(),
                    reason: format!("invalid listen address {}", inbound.listen),
                })?;
            let port = u16::try_from(inbound.listen_port).map_err(|_| EngineError::InvalidInbound {
                tag: inbound.tag.clone(),
                kind: inbound.kind.clone(),
                reason: format!("invalid listen port {}", inbound.listen_port),
            })?;
            planned.push(PlannedInbound {
                tag: inbound.tag.clone(),
                udp: UDP_TYPES.contains(&kind.as_str()),
                kind,
                addr: SocketAddr::new(ip, port),
                users: Arc::new(UserMatcher::for_inbound(inbound)),
            });
        }
        Ok(Self {
            planned,
            running: Vec::new(),
        })
    }

    pub fn empty() -> Self {
        Self {
            planned: Vec::new(),
            running: Vec::new(),
        }
    }

    pub fn tags(&self) -> Vec<String> {
        self.planned.iter().map(|p| p.tag.clone()).collect()
    }

    pub fn is_running(&self) -> bool {
        !self.running.is_empty()
    }

    /// Bound TCP address of a running inbound.
    pub fn local_addr(&self, tag: &str) -> Option<SocketAddr> {
        self.running
            .iter()
            .find(|r| r.tag == tag)
            .map(|r| r.tcp_addr)
    }

    /// Binds every planned inbound. On error the inbounds bound so far stay
    /// registered so [`InboundManager::remove_all`] can release them.
    pub async fn create_all(
        &mut self,
        router: Arc<ConnectionRouter>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        for plan in &self.planned {
            let create_err = |source: std::io::Error| EngineError::CreateInbound {
                tag: plan.tag.clone(),
                kind: plan.kind.clone(),
                source,
            };

            let listener = TcpListener::bind(plan.addr).await.map_err(create_err)?;
            let tcp_addr = listener.local_addr().map_err(create_err)?;
            let mut tasks = vec![tokio::spawn(accept_loop(
                listener,
                plan.tag.clone(),
                plan.users.clone(),
                router.clone(),
                cancel.child_token(),
            ))];

            let udp_socket = if plan.udp {
                Some(
                    UdpSocket::bind(SocketAddr::new(plan.addr.ip(), tcp_addr.port()))
                        .await
                        .map_err(create_err),
                )
            } else {
                None
            };
            let udp_result = match udp_socket {
                Some(Ok(socket)) => {
                    let routed = router.route_packet(
                        socket,
                        &ConnMetadata::new(&plan.tag, plan.users.packet_user()),
                    );
                    tasks.push(tokio::spawn(packet_loop(routed, cancel.child_token())));
                    Ok(())
                }
                Some(Err(e)) => Err(e),
                None => Ok(()),
            };

            self.running.push(RunningInbound {
                tag: plan.tag.clone(),
                tcp_addr,
                tasks,
            });
            udp_result?;
            info!(tag = %plan.tag, kind = %plan.kind, addr = %tcp_addr, "Inbound listening.");
        }
        Ok(())
    }

    /// Waits for every listener task to exit, which drops its sockets.
    /// The caller cancels the token first.
    pub async fn remove_all(&mut self) -> Result<(), EngineError> {
        let mut first_error = None;
        for running in self.running.drain(..) {
            for task in running.tasks {
                if let Err(e) = task.await {
                    warn!(tag = %running.tag, error = %e, "Inbound task ended abnormally.");
                    if first_error.is_none() {
                        first_error = Some(EngineError::RemoveInbound {
                            tag: running.tag.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
            debug!(tag = %running.tag, "Inbound removed.");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    tag: String,
    users: Arc<UserMatcher>,
    router: Arc<ConnectionRouter>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(tag = %tag, peer = %peer, "Accepted connection.");
                    tokio::spawn(serve_stream(
                        stream,
                        tag.clone(),
                        users.clone(),
                        router.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    warn!(tag = %tag, error = %e, "Accept failed.");
                }
            }
        }
    }
}

/// Attributes the connection from its request header, then hands it to
/// the router with the header replayed so it is still counted.
async fn serve_stream(
    mut stream: TcpStream,
    tag: String,
    users: Arc<UserMatcher>,
    router: Arc<ConnectionRouter>,
    cancel: CancellationToken,
) {
    let header = tokio::select! {
        _ = cancel.cancelled() => return,
        header = read_header(&mut stream, users.header_len()) => header,
    };
    let user = users.identify(&header).unwrap_or_default();
    if !user.is_empty() {
        debug!(tag = %tag, user = %user, "Connection attributed.");
    }
    let meta = ConnMetadata::new(&tag, user);
    let routed = router.route_stream(PrefixedStream::new(header, stream), &meta);
    drain_stream(routed, cancel).await;
}

/// Reads until EOF and discards. Protocol handling is not part of the
/// listener engine.
async fn drain_stream(mut stream: BoxedStream, cancel: CancellationToken) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = stream.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}

async fn packet_loop(conn: Box<dyn PacketConn>, cancel: CancellationToken) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = conn.recv_from(&mut buf) => {
                if let Err(e) = received {
                    debug!(error = %e, "Packet receive failed.");
                }
            }
        }
    }
}
