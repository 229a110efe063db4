use std::net::IpAddr;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRecord {
    #[serde(rename = "hostname")]
    pub identity: String,
    pub ip: IpAddr,
    pub port: u16,
    #[serde(skip)]
    pub last_seen: Instant, // monotonic, for eviction only
}

impl PeerRecord {
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }
}
