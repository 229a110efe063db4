use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::dns::{self, Packet};
use crate::events::{Event, EventSink};
use crate::protocol::ServiceAnnouncement;
use crate::state::PeerTable;

/// Offsets from start at which queries go out: the burst, then every steady interval
/// counted from start.
pub fn query_offsets(config: &DiscoveryConfig) -> impl Iterator<Item = Duration> {
    let burst = config.burst.clone();
    let last_burst = burst.last().copied().unwrap_or_default();
    let steady = config.steady_interval.max(Duration::from_millis(1));
    burst.into_iter().chain(
        (1u32..)
            .map(move |k| steady * k)
            .skip_while(move |offset| *offset <= last_burst),
    )
}

/// Calls `send` at each offset until the offsets run out or `cancel` fires.
pub async fn run_queries<I, F, Fut>(offsets: I, cancel: CancellationToken, mut send: F)
where
    I: IntoIterator<Item = Duration>,
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let start = Instant::now();
    for offset in offsets {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(start + offset) => send().await,
        }
    }
}

/// Folds discovery answers into the peer table and expires peers that went quiet.
pub struct Prober {
    service: String,
    table: PeerTable,
    events: EventSink,
}

impl Prober {
    pub fn new(service: impl Into<String>, table: PeerTable, events: EventSink) -> Self {
        Self {
            service: service.into(),
            table,
            events,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Applies every usable announcement in `packet`. The peer address is always the
    /// datagram source, whatever the payload claims.
    pub fn on_packet(&self, packet: &Packet, src: SocketAddr, now: Instant) -> bool {
        if !packet.response {
            return false;
        }
        let mut changed = false;
        for record in &packet.answers {
            if record.rtype != dns::TYPE_TXT || !dns::names_match(&record.name, &self.service) {
                continue;
            }
            let announcement: ServiceAnnouncement = match serde_json::from_slice(&record.data) {
                Ok(a) => a,
                Err(e) => {
                    tracing::trace!("Ignoring unparsable announcement from {}: {}", src, e);
                    continue;
                }
            };
            if announcement.hostname.is_empty() || announcement.port == 0 {
                continue;
            }
            if self
                .table
                .upsert(&announcement.hostname, src.ip(), announcement.port, now)
            {
                tracing::debug!(
                    "Discovered peer {} at {}:{}",
                    announcement.hostname,
                    src.ip(),
                    announcement.port
                );
                changed = true;
            }
        }
        if changed {
            self.events.emit(Event::PeersUpdated(self.table.snapshot()));
        }
        changed
    }

    pub fn sweep(&self, now: Instant, timeout: Duration) -> bool {
        let changed = self.table.evict(now, timeout);
        if changed {
            self.events.emit(Event::PeersUpdated(self.table.snapshot()));
        }
        changed
    }
}

/// Periodic eviction sweep; the first one runs one interval after start.
pub async fn run_sweeps(
    prober: &Prober,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                prober.sweep(Instant::now(), timeout);
            }
        }
    }
}
