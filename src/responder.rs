use std::net::SocketAddr;

use tokio::sync::watch;

use crate::dns::{self, Packet};
use crate::error::WireError;
use crate::protocol::ServiceAnnouncement;

const ANNOUNCE_TTL: u32 = 120;

/// Answers discovery queries for our service name with our identity and transport port.
pub struct Responder {
    service: String,
    identity: String,
    endpoint: watch::Receiver<Option<SocketAddr>>,
}

impl Responder {
    pub fn new(
        service: impl Into<String>,
        identity: impl Into<String>,
        endpoint: watch::Receiver<Option<SocketAddr>>,
    ) -> Self {
        Self {
            service: service.into(),
            identity: identity.into(),
            endpoint,
        }
    }

    /// Port currently announced; always read from the transport's live endpoint. `None`
    /// while the transport has no listener.
    pub fn port(&self) -> Option<u16> {
        self.endpoint.borrow().map(|addr| addr.port())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.endpoint.clone()
    }

    /// Our announcement packet, or `None` when there is no listener to announce.
    pub fn announcement(&self) -> Option<Vec<u8>> {
        let port = self.port()?;
        match self.encode(port) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("Cannot build announcement: {}", e);
                None
            }
        }
    }

    fn encode(&self, port: u16) -> Result<Vec<u8>, WireError> {
        let payload = ServiceAnnouncement {
            hostname: self.identity.clone(),
            port,
        };
        let text = serde_json::to_vec(&payload).map_err(|e| WireError::Payload(e.to_string()))?;
        dns::encode_txt_answer(&self.service, ANNOUNCE_TTL, &text)
    }

    /// Reply for `packet`, if it is a query asking for our service.
    pub fn on_packet(&self, packet: &Packet) -> Option<Vec<u8>> {
        if packet.response {
            return None;
        }
        if !packet
            .questions
            .iter()
            .any(|q| dns::names_match(&q.name, &self.service))
        {
            return None;
        }
        self.announcement()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responder(port: u16) -> (Responder, watch::Sender<Option<SocketAddr>>) {
        let (tx, rx) = watch::channel(Some(SocketAddr::from(([0, 0, 0, 0], port))));
        (Responder::new("ZeroCloud", "desk", rx), tx)
    }

    fn announced(bytes: &[u8]) -> ServiceAnnouncement {
        let packet = dns::decode(bytes).unwrap();
        assert!(packet.response);
        assert_eq!(packet.answers[0].rtype, dns::TYPE_TXT);
        serde_json::from_slice(&packet.answers[0].data).unwrap()
    }

    #[test]
    fn answers_matching_query_case_insensitively() {
        let (responder, _tx) = responder(4570);
        let query = dns::decode(&dns::encode_query("zerocloud").unwrap()).unwrap();
        let reply = responder.on_packet(&query).expect("should answer");
        assert_eq!(
            announced(&reply),
            ServiceAnnouncement {
                hostname: "desk".into(),
                port: 4570
            }
        );
    }

    #[test]
    fn ignores_other_services_and_responses() {
        let (responder, _tx) = responder(4568);
        let other = dns::decode(&dns::encode_query("_printer._tcp.local").unwrap()).unwrap();
        assert!(responder.on_packet(&other).is_none());

        let answer = dns::decode(&responder.announcement().unwrap()).unwrap();
        assert!(responder.on_packet(&answer).is_none());
    }

    #[test]
    fn announces_port_after_rebind() {
        let (responder, tx) = responder(4568);
        tx.send_replace(Some(SocketAddr::from(([127, 0, 0, 1], 4571))));
        assert_eq!(announced(&responder.announcement().unwrap()).port, 4571);
    }

    #[test]
    fn silent_without_listener() {
        let (responder, tx) = responder(4568);
        tx.send_replace(None);
        assert_eq!(responder.port(), None);
        assert!(responder.announcement().is_none());

        let query = dns::decode(&dns::encode_query("ZeroCloud").unwrap()).unwrap();
        assert!(responder.on_packet(&query).is_none());
    }
}
