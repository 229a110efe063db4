use crate::peer::PeerRecord;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Directory of peers currently visible on the LAN, keyed by identity.
///
/// Cheap to clone; every clone shares the same map. The local identity is fixed at
/// construction and any observation carrying it is ignored.
#[derive(Clone)]
pub struct PeerTable {
    peers: Arc<Mutex<HashMap<String, PeerRecord>>>,
    local_identity: Arc<str>,
}

impl PeerTable {
    pub fn new(local_identity: impl Into<String>) -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            local_identity: Arc::from(local_identity.into()),
        }
    }

    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    /// Insert or refresh `identity`. Returns false when the observation was our own.
    pub fn upsert(&self, identity: &str, ip: IpAddr, port: u16, now: Instant) -> bool {
        if identity == &*self.local_identity {
            return false;
        }
        let mut peers = self.lock();
        match peers.get_mut(identity) {
            Some(peer) => {
                peer.ip = ip;
                peer.port = port;
                peer.last_seen = now;
            }
            None => {
                peers.insert(
                    identity.to_string(),
                    PeerRecord {
                        identity: identity.to_string(),
                        ip,
                        port,
                        last_seen: now,
                    },
                );
            }
        }
        true
    }

    /// Drop every peer not seen for more than `timeout`. Returns true if any were removed.
    pub fn evict(&self, now: Instant, timeout: Duration) -> bool {
        let mut peers = self.lock();
        let before = peers.len();
        peers.retain(|_, p| now.saturating_duration_since(p.last_seen) <= timeout);
        let removed = before - peers.len();
        if removed > 0 {
            tracing::debug!("Evicted {} stale peer(s)", removed);
        }
        removed > 0
    }

    /// All known peers, ordered by identity.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut list: Vec<PeerRecord> = self.lock().values().cloned().collect();
        list.sort_by(|a, b| a.identity.cmp(&b.identity));
        list
    }

    pub fn get(&self, identity: &str) -> Option<PeerRecord> {
        self.lock().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PeerRecord>> {
        // Every mutation completes before the guard drops, so a poisoned map is still whole.
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
