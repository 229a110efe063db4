use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;

use crate::dns;
use crate::error::ResolveError;
use crate::events::{Event, EventSink};
use crate::peer::PeerRecord;
use crate::protocol::InfoResponse;
use crate::state::PeerTable;

/// Adds a peer by address when multicast discovery cannot reach it.
pub struct Resolver {
    http: reqwest::Client,
    service: String,
    port: u16,
    table: PeerTable,
    events: EventSink,
}

impl Resolver {
    pub fn new(
        service: impl Into<String>,
        port: u16,
        timeout: Duration,
        table: PeerTable,
        events: EventSink,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            service: service.into(),
            port,
            table,
            events,
        })
    }

    /// Probes `address`'s info endpoint once and records the answering host as a peer.
    pub async fn resolve(&self, address: IpAddr) -> Result<PeerRecord, ResolveError> {
        let addr = SocketAddr::new(address, self.port);
        let invalid = |reason: String| ResolveError::InvalidResponse { addr, reason };

        let response = self
            .http
            .get(format!("http://{}/info", addr))
            .send()
            .await
            .map_err(|e| ResolveError::Unreachable {
                addr,
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(invalid(format!("status {}", response.status())));
        }
        let info: InfoResponse = response.json().await.map_err(|e| invalid(e.to_string()))?;
        if info.hostname.is_empty() {
            return Err(invalid("empty hostname".to_string()));
        }
        if !dns::names_match(&info.service, &self.service) {
            return Err(invalid(format!("unexpected service {:?}", info.service)));
        }

        let now = Instant::now();
        if !self.table.upsert(&info.hostname, address, self.port, now) {
            return Err(ResolveError::SelfAddress { addr });
        }
        tracing::info!("Resolved {} as {}", addr, info.hostname);
        self.events.emit(Event::PeersUpdated(self.table.snapshot()));

        Ok(PeerRecord {
            identity: info.hostname,
            ip: address,
            port: self.port,
            last_seen: now,
        })
    }
}
