use futures::SinkExt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::SendError;
use crate::protocol::ChatMessage;

/// Outbound side of the transport: one connection per message, no pooling or retry.
#[derive(Clone)]
pub struct MessageSender {
    http: reqwest::Client,
    connect_timeout: Duration,
}

impl MessageSender {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            connect_timeout,
        })
    }

    /// Opens a message channel to the peer, writes `message` as one frame and closes.
    pub async fn send_message(
        &self,
        address: IpAddr,
        port: u16,
        message: &ChatMessage,
    ) -> Result<(), SendError> {
        let addr = SocketAddr::new(address, port);
        let frame = serde_json::to_string(message).map_err(|e| SendError::Transmit {
            addr,
            reason: e.to_string(),
        })?;

        let url = format!("ws://{}/ws", addr);
        let connect = tokio::time::timeout(self.connect_timeout, connect_async(url));
        let (mut stream, _) = match connect.await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(SendError::Unreachable {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(SendError::Unreachable {
                    addr,
                    reason: format!("no answer within {:?}", self.connect_timeout),
                })
            }
        };

        stream
            .send(Message::Text(frame))
            .await
            .map_err(|e| SendError::Transmit {
                addr,
                reason: e.to_string(),
            })?;
        if let Err(e) = stream.close(None).await {
            tracing::debug!("Close handshake with {} failed: {}", addr, e);
        }
        tracing::debug!("Sent message to {}", addr);
        Ok(())
    }

    /// Posts `path` to the peer's upload endpoint, labelled with `sender`.
    pub async fn upload_file(
        &self,
        address: IpAddr,
        port: u16,
        path: &Path,
        sender: &str,
    ) -> Result<(), SendError> {
        let addr = SocketAddr::new(address, port);
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| SendError::LocalFile {
                path: path.display().to_string(),
                source,
            })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        let size = data.len();

        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(data).file_name(filename.clone()))
            .text("sender", sender.to_string());

        let response = self
            .http
            .post(format!("http://{}/upload", addr))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    SendError::Unreachable {
                        addr,
                        reason: e.to_string(),
                    }
                } else {
                    SendError::Transmit {
                        addr,
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SendError::Rejected {
                addr,
                status: status.as_u16(),
            });
        }
        tracing::info!("Uploaded {} ({} bytes) to {}", filename, size, addr);
        Ok(())
    }
}
