//! ZeroCloud: serverless LAN peer discovery, chat and file drop.
//!
//! Hosts find each other by multicasting DNS-format queries for the `ZeroCloud` name and
//! answering with a TXT record carrying `{hostname, port}`. Each host runs an HTTP server on
//! that port for file uploads (`POST /upload`), an info probe (`GET /info`) and a WebSocket
//! message channel (`GET /ws`). Everything observable is published as [`Event`]s.

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod dns;
pub mod error;
pub mod events;
pub mod logging;
pub mod node;
pub mod peer;
pub mod prober;
pub mod protocol;
pub mod resolver;
pub mod responder;
pub mod sender;
pub mod state;
pub mod transport;

pub use config::{DiscoveryConfig, NodeConfig};
pub use crypto::Cipher;
pub use events::{Event, EventReceiver, EventSink};
pub use node::Node;
pub use peer::PeerRecord;
pub use protocol::ChatMessage;
pub use state::PeerTable;
