use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::discovery::Discovery;
use crate::error::{NodeError, ResolveError, SendError, TransportError};
use crate::events::{EventReceiver, EventSink};
use crate::peer::PeerRecord;
use crate::prober::Prober;
use crate::protocol::ChatMessage;
use crate::resolver::Resolver;
use crate::responder::Responder;
use crate::sender::MessageSender;
use crate::state::PeerTable;
use crate::transport::TransportServer;

/// One running ZeroCloud host: transport, discovery and the peer table they share.
pub struct Node {
    identity: String,
    table: PeerTable,
    transport: TransportServer,
    discovery: Option<Discovery>,
    sender: MessageSender,
    resolver: Resolver,
    shutdown: CancellationToken,
}

impl Node {
    pub async fn start(config: NodeConfig) -> Result<(Self, EventReceiver), NodeError> {
        let (events, rx) = EventSink::channel();
        let shutdown = CancellationToken::new();
        let table = PeerTable::new(config.identity.clone());

        let sender = MessageSender::new(config.connect_timeout)?;
        let resolver = Resolver::new(
            config.service_name.clone(),
            config.resolver_port,
            config.connect_timeout,
            table.clone(),
            events.clone(),
        )?;

        let transport = TransportServer::new(&config, events.clone(), shutdown.clone());
        transport.start(config.bind_address, config.port).await?;

        let discovery = if config.discovery.enabled {
            let responder = Responder::new(
                config.service_name.clone(),
                config.identity.clone(),
                transport.subscribe(),
            );
            let prober = Prober::new(config.service_name.clone(), table.clone(), events.clone());
            match Discovery::start(&config.discovery, responder, prober, shutdown.clone()).await {
                Ok(d) => Some(d),
                Err(e) => {
                    transport.stop().await;
                    return Err(e.into());
                }
            }
        } else {
            tracing::info!("Discovery disabled; peers must be added by address");
            None
        };

        tracing::info!("Node {} started", config.identity);
        Ok((
            Self {
                identity: config.identity,
                table,
                transport,
                discovery,
                sender,
                resolver,
                shutdown,
            },
            rx,
        ))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn peer_table(&self) -> &PeerTable {
        &self.table
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.table.snapshot()
    }

    /// Bound transport endpoint, `None` if the node has lost its listener.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.transport.local_endpoint()
    }

    pub async fn rebind(&self, address: IpAddr, port: u16) -> Result<SocketAddr, TransportError> {
        self.transport.start(address, port).await
    }

    /// Sends `body` (already encrypted by the caller, if at all) to a known peer.
    pub async fn send_message(&self, peer: &str, body: &str) -> Result<(), SendError> {
        let target = self
            .table
            .get(peer)
            .ok_or_else(|| SendError::UnknownPeer(peer.to_string()))?;
        self.send_message_to(target.ip, target.port, body).await
    }

    pub async fn send_message_to(
        &self,
        ip: IpAddr,
        port: u16,
        body: &str,
    ) -> Result<(), SendError> {
        let message = ChatMessage {
            from: self.identity.clone(),
            message: body.to_string(),
        };
        self.sender.send_message(ip, port, &message).await
    }

    pub async fn upload_file(&self, peer: &str, path: &Path) -> Result<(), SendError> {
        let target = self
            .table
            .get(peer)
            .ok_or_else(|| SendError::UnknownPeer(peer.to_string()))?;
        self.sender
            .upload_file(target.ip, target.port, path, &self.identity)
            .await
    }

    pub async fn resolve(&self, address: IpAddr) -> Result<PeerRecord, ResolveError> {
        self.resolver.resolve(address).await
    }

    /// Stops timers and discovery, closes the listener and every open message channel.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        self.transport.stop().await;
        if let Some(discovery) = self.discovery.take() {
            discovery.join().await;
        }
        tracing::info!("Node {} shut down", self.identity);
    }
}
