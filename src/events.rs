//! Typed notifications for the presentation layer.

use std::net::IpAddr;
use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::peer::PeerRecord;
use crate::protocol::ChatMessage;

#[derive(Debug, Clone)]
pub enum Event {
    PeersUpdated(Vec<PeerRecord>),
    FileReceived {
        filename: String,
        sender: String,
        path: PathBuf,
    },
    MessageReceived {
        from: std::net::SocketAddr,
        payload: ChatMessage,
    },
    MyInfo {
        identity: String,
        address: IpAddr,
        port: u16,
    },
}

pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Producer half handed to every network component.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: Event) {
        // Nobody listening is fine: the core runs headless too.
        if self.tx.send(event).is_err() {
            tracing::trace!("event dropped, no subscriber");
        }
    }
}
