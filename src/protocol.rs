use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_TRANSPORT_PORT;

/// One chat message on the `/ws` channel. `message` is opaque to the transport.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub from: String,
    pub message: String,
}

/// TXT payload of a discovery answer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceAnnouncement {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Body of `GET /info`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    pub hostname: String,
    pub service: String,
    pub version: String,
}

/// Body of a successful `POST /upload`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UploadResponse {
    pub message: String,
}

fn default_port() -> u16 {
    DEFAULT_TRANSPORT_PORT
}
