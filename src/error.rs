use std::net::SocketAddr;

use thiserror::Error;

/// Failure to decode a discovery packet. Always treated as background noise by callers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("packet truncated at offset {0}")]
    Truncated(usize),
    #[error("label too long ({0} bytes)")]
    LabelTooLong(usize),
    #[error("name compression loop")]
    PointerLoop,
    #[error("invalid announcement payload: {0}")]
    Payload(String),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to open multicast socket on {addr}: {source}")]
    Socket {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid service name: {0}")]
    Wire(#[from] WireError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no free port in {first}..={last} after {attempts} attempts")]
    NoFreePort { first: u16, last: u16, attempts: u32 },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("peer {addr} unreachable: {reason}")]
    Unreachable { addr: SocketAddr, reason: String },
    #[error("lost connection to {addr} while sending: {reason}")]
    Transmit { addr: SocketAddr, reason: String },
    #[error("peer {addr} rejected upload with status {status}")]
    Rejected { addr: SocketAddr, status: u16 },
    #[error("cannot read {path}: {source}")]
    LocalFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown peer {0}")]
    UnknownPeer(String),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{addr} is unreachable: {reason}")]
    Unreachable { addr: SocketAddr, reason: String },
    #[error("{addr} returned an invalid response: {reason}")]
    InvalidResponse { addr: SocketAddr, reason: String },
    #[error("{addr} is this host")]
    SelfAddress { addr: SocketAddr },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption failure")]
    Encrypt,
    #[error("ciphertext is not valid base64")]
    Encoding,
    #[error("ciphertext too short")]
    TooShort,
    #[error("decryption failure")]
    Decrypt,
    #[error("plaintext is not valid UTF-8")]
    Utf8,
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
}
