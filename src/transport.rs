use axum::extract::multipart::Field;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::Router;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::TransportError;
use crate::events::{Event, EventSink};
use crate::protocol::{ChatMessage, InfoResponse, UploadResponse};

pub const MAX_BIND_ATTEMPTS: u32 = 100;
const DEFAULT_SENDER: &str = "Unknown";

static NEXT_PART: AtomicU64 = AtomicU64::new(0);

type Rejection = (StatusCode, String);

#[derive(Clone)]
struct ServerState {
    identity: String,
    service: String,
    download_dir: PathBuf,
    events: EventSink,
    shutdown: CancellationToken,
}

struct Running {
    endpoint: SocketAddr,
    task: JoinHandle<()>,
}

/// HTTP + WebSocket endpoint for uploads, the info probe and inbound chat messages.
///
/// The listen endpoint can be moved at runtime with [`TransportServer::start`]; the
/// currently bound address is published through a watch channel so discovery always
/// announces the live port. The channel holds `None` whenever nothing is listening.
pub struct TransportServer {
    state: ServerState,
    max_upload_bytes: usize,
    endpoint: watch::Sender<Option<SocketAddr>>,
    running: Mutex<Option<Running>>,
}

impl TransportServer {
    pub fn new(config: &NodeConfig, events: EventSink, shutdown: CancellationToken) -> Self {
        let (endpoint, _) = watch::channel(None);
        Self {
            state: ServerState {
                identity: config.identity.clone(),
                service: config.service_name.clone(),
                download_dir: config.download_dir.clone(),
                events,
                shutdown,
            },
            max_upload_bytes: config.max_upload_bytes,
            endpoint,
            running: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.endpoint.subscribe()
    }

    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.borrow()
    }

    /// Binds `address:port`, closing any current listener first. An occupied port moves the
    /// bind upward one port at a time, at most [`MAX_BIND_ATTEMPTS`] times.
    ///
    /// If the new bind fails the previous endpoint is reopened and stays published. If that
    /// fails too the server is left stopped and the endpoint is cleared to `None`, so
    /// nothing goes on announcing a dead port.
    pub async fn start(&self, address: IpAddr, port: u16) -> Result<SocketAddr, TransportError> {
        let mut running = self.running.lock().await;
        let previous = match running.take() {
            Some(old) => {
                let endpoint = old.endpoint;
                shut(old).await;
                tracing::info!("Closed listener on {}", endpoint);
                Some(endpoint)
            }
            None => None,
        };

        let listener = match bind_with_retry(address, port, MAX_BIND_ATTEMPTS).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Transport bind on {}:{} failed: {}", address, port, e);
                if let Some(prev) = previous {
                    match TcpListener::bind(prev).await {
                        Ok(listener) => {
                            tracing::warn!("Restored listener on {}", prev);
                            *running = Some(self.serve(listener, prev));
                        }
                        Err(restore) => {
                            tracing::error!("Cannot reopen {}: {}", prev, restore);
                            self.endpoint.send_replace(None);
                        }
                    }
                }
                return Err(e);
            }
        };

        let bound = listener
            .local_addr()
            .map_err(|source| TransportError::Bind {
                addr: SocketAddr::new(address, port),
                source,
            })?;
        *running = Some(self.serve(listener, bound));
        tracing::info!("Transport listening on {}", bound);

        self.endpoint.send_replace(Some(bound));
        self.state.events.emit(Event::MyInfo {
            identity: self.state.identity.clone(),
            address: reachable_ip(bound.ip()),
            port: bound.port(),
        });
        Ok(bound)
    }

    /// Closes the listener and clears the endpoint. Open message channels end with the
    /// shutdown token.
    pub async fn stop(&self) {
        if let Some(old) = self.running.lock().await.take() {
            let endpoint = old.endpoint;
            shut(old).await;
            self.endpoint.send_replace(None);
            tracing::info!("Transport on {} stopped", endpoint);
        }
    }

    fn serve(&self, listener: TcpListener, endpoint: SocketAddr) -> Running {
        let app = router(self.state.clone(), self.max_upload_bytes);
        let task = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service).await {
                tracing::error!("Transport on {} failed: {}", endpoint, e);
            }
        });
        Running { endpoint, task }
    }
}

/// Aborting the serve task drops its listener; awaiting guarantees the socket is closed.
async fn shut(running: Running) {
    running.task.abort();
    let _ = running.task.await;
}

async fn bind_with_retry(
    address: IpAddr,
    port: u16,
    max_attempts: u32,
) -> Result<TcpListener, TransportError> {
    let mut candidate = port;
    let mut attempts = 0;
    loop {
        attempts += 1;
        let addr = SocketAddr::new(address, candidate);
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            // Port 0 never conflicts, so it never reaches here.
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                if attempts >= max_attempts || candidate == u16::MAX {
                    return Err(TransportError::NoFreePort {
                        first: port,
                        last: candidate,
                        attempts,
                    });
                }
                tracing::info!("Port {} in use, trying {}...", candidate, candidate + 1);
                candidate += 1;
            }
            Err(source) => return Err(TransportError::Bind { addr, source }),
        }
    }
}

fn reachable_ip(bound: IpAddr) -> IpAddr {
    if bound.is_unspecified() {
        local_ip_address::local_ip().unwrap_or(IpAddr::from([127, 0, 0, 1]))
    } else {
        bound
    }
}

fn router(state: ServerState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/upload", post(upload))
        .route("/info", get(info))
        .route("/ws", get(message_channel))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

async fn info(State(state): State<ServerState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        hostname: state.identity,
        service: state.service,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// An uploaded file written under a temporary name, not yet visible under its own.
struct Staged {
    filename: String,
    temp: PathBuf,
    size: u64,
}

impl Staged {
    async fn discard(self) {
        if let Err(e) = tokio::fs::remove_file(&self.temp).await {
            tracing::debug!("Cannot remove {}: {}", self.temp.display(), e);
        }
    }
}

async fn upload(
    State(state): State<ServerState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, Rejection> {
    let mut staged = None;
    let mut sender = None;

    if let Err(rejection) =
        read_upload_form(&mut multipart, &state.download_dir, &mut staged, &mut sender).await
    {
        if let Some(partial) = staged {
            partial.discard().await;
        }
        return Err(rejection);
    }

    let staged = staged.ok_or((StatusCode::BAD_REQUEST, "missing file field".to_string()))?;
    let sender = sender
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SENDER.to_string());

    let path = state.download_dir.join(&staged.filename);
    // Same name overwrites: last upload wins. A failed upload never replaces a good file.
    if let Err(e) = tokio::fs::rename(&staged.temp, &path).await {
        staged.discard().await;
        return Err(internal(e));
    }
    tracing::info!(
        "Received file {} ({} bytes) from {}",
        staged.filename,
        staged.size,
        sender
    );

    state.events.emit(Event::FileReceived {
        filename: staged.filename,
        sender,
        path,
    });
    Ok(Json(UploadResponse {
        message: "File uploaded successfully".to_string(),
    }))
}

async fn read_upload_form(
    multipart: &mut Multipart,
    download_dir: &Path,
    staged: &mut Option<Staged>,
    sender: &mut Option<String>,
) -> Result<(), Rejection> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_rejection)? {
        match field.name() {
            Some("file") => {
                let filename = field.file_name().and_then(base_name).ok_or((
                    StatusCode::BAD_REQUEST,
                    "file field needs a filename".to_string(),
                ))?;
                if let Some(earlier) = staged.take() {
                    earlier.discard().await;
                }
                tokio::fs::create_dir_all(download_dir)
                    .await
                    .map_err(internal)?;
                let temp = download_dir.join(format!(
                    ".upload-{}-{}.part",
                    std::process::id(),
                    NEXT_PART.fetch_add(1, Ordering::Relaxed)
                ));
                // Registered before writing so a failure part-way still gets cleaned up.
                *staged = Some(Staged {
                    filename,
                    temp: temp.clone(),
                    size: 0,
                });
                let size = write_field(&temp, field).await?;
                if let Some(s) = staged.as_mut() {
                    s.size = size;
                }
            }
            Some("sender") => {
                *sender = Some(field.text().await.map_err(multipart_rejection)?);
            }
            _ => {}
        }
    }
    Ok(())
}

/// Streams one multipart field to `path` chunk by chunk.
async fn write_field(path: &Path, mut field: Field<'_>) -> Result<u64, Rejection> {
    let mut file = tokio::fs::File::create(path).await.map_err(internal)?;
    let mut size = 0u64;
    while let Some(chunk) = field.chunk().await.map_err(multipart_rejection)? {
        file.write_all(&chunk).await.map_err(internal)?;
        size += chunk.len() as u64;
    }
    file.flush().await.map_err(internal)?;
    Ok(size)
}

fn multipart_rejection(e: axum::extract::multipart::MultipartError) -> Rejection {
    (e.status(), e.body_text())
}

fn internal(e: std::io::Error) -> Rejection {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Final path component of an uploaded filename, whichever separator the client used.
fn base_name(name: &str) -> Option<String> {
    let base = name.rsplit(|c| c == '/' || c == '\\').next()?.trim();
    match base {
        "" | "." | ".." => None,
        b => Some(b.to_string()),
    }
}

async fn message_channel(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<ServerState>,
) -> Response {
    ws.on_upgrade(move |socket| receive_messages(socket, remote, state))
}

async fn receive_messages(mut socket: WebSocket, remote: SocketAddr, state: ServerState) {
    tracing::debug!("Message channel opened by {}", remote);
    loop {
        let frame = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            frame = socket.recv() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => deliver(&state, remote, text.as_bytes()),
            Some(Ok(Message::Binary(data))) => deliver(&state, remote, &data),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!("Message channel from {} failed: {}", remote, e);
                break;
            }
        }
    }
    tracing::debug!("Message channel from {} closed", remote);
}

fn deliver(state: &ServerState, remote: SocketAddr, frame: &[u8]) {
    match serde_json::from_slice::<ChatMessage>(frame) {
        Ok(payload) => {
            tracing::info!("Message from {} ({})", payload.from, remote);
            state.events.emit(Event::MessageReceived {
                from: remote,
                payload,
            });
        }
        Err(e) => tracing::debug!("Dropping undecodable frame from {}: {}", remote, e),
    }
}
