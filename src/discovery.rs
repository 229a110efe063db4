use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::dns;
use crate::error::DiscoveryError;
use crate::prober::{self, Prober};
use crate::responder::Responder;

const RECV_BUFFER: usize = 9000;

struct Shared {
    socket: UdpSocket,
    group: SocketAddr,
    responder: Responder,
    prober: Prober,
}

impl Shared {
    async fn multicast(&self, packet: &[u8]) {
        if let Err(e) = self.socket.send_to(packet, self.group).await {
            tracing::debug!("Discovery send to {} failed: {}", self.group, e);
        }
    }

    async fn announce(&self) {
        match self.responder.announcement() {
            Some(packet) => {
                tracing::debug!("Announcing port {:?}", self.responder.port());
                self.multicast(&packet).await;
            }
            None => tracing::debug!("Transport not listening, nothing to announce"),
        }
    }

    async fn on_datagram(&self, data: &[u8], src: SocketAddr) {
        let packet = match dns::decode(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::trace!("Ignoring malformed packet from {}: {}", src, e);
                return;
            }
        };
        if let Some(reply) = self.responder.on_packet(&packet) {
            tracing::trace!("Answering query from {}", src);
            self.multicast(&reply).await;
        }
        self.prober.on_packet(&packet, src, Instant::now());
    }
}

/// Runs the responder and prober over one shared multicast socket.
pub struct Discovery {
    shared: Arc<Shared>,
    tasks: JoinSet<()>,
}

impl Discovery {
    /// Joins the multicast group, announces once, and starts the receive loop, the query
    /// schedule and the eviction sweep. Everything stops when `cancel` fires.
    pub async fn start(
        config: &DiscoveryConfig,
        responder: Responder,
        prober: Prober,
        cancel: CancellationToken,
    ) -> Result<Self, DiscoveryError> {
        let query = dns::encode_query(prober.service())?;
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let socket = multicast_socket(config.group, config.port)
            .and_then(UdpSocket::from_std)
            .map_err(|source| DiscoveryError::Socket {
                addr: bind_addr,
                source,
            })?;
        tracing::info!(
            "Discovery joined {}:{} (announcing port {:?})",
            config.group,
            config.port,
            responder.port()
        );

        let mut endpoint_changes = responder.subscribe();
        let shared = Arc::new(Shared {
            socket,
            group: SocketAddr::from((config.group, config.port)),
            responder,
            prober,
        });

        // Unsolicited announcement so listeners already up see us without waiting.
        shared.announce().await;

        let mut tasks = JoinSet::new();

        let s = shared.clone();
        let c = cancel.clone();
        tasks.spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER];
            loop {
                tokio::select! {
                    _ = c.cancelled() => break,
                    res = s.socket.recv_from(&mut buf) => match res {
                        Ok((len, src)) => s.on_datagram(&buf[..len], src).await,
                        Err(e) => {
                            tracing::warn!("Discovery receive error: {}", e);
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });

        let s = shared.clone();
        let offsets = prober::query_offsets(config);
        tasks.spawn(prober::run_queries(offsets, cancel.clone(), move || {
            let s = s.clone();
            let query = query.clone();
            async move { s.multicast(&query).await }
        }));

        let s = shared.clone();
        let c = cancel.clone();
        let (interval, timeout) = (config.sweep_interval, config.eviction_timeout);
        tasks.spawn(async move { prober::run_sweeps(&s.prober, interval, timeout, c).await });

        let s = shared.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = endpoint_changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        s.announce().await;
                    }
                }
            }
        });

        Ok(Self { shared, tasks })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }

    /// Waits for every discovery task to finish after cancellation.
    pub async fn join(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                tracing::error!("Discovery task failed: {}", e);
            }
        }
        tracing::info!("Discovery stopped");
    }
}

fn multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // Other mDNS stacks on the host already hold 5353.
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(255)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
