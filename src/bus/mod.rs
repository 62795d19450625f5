//! Exported-field bus via Unix sockets
//!
//! Length-prefixed JSON over a Unix domain socket. A listener thread owns
//! the socket I/O; every request crosses an mpsc channel into the main
//! loop, which performs all field and store mutations single-threaded and
//! sends the reply back.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing::{error, info, warn};

mod messages;
pub use messages::{BusRequest, BusResponse, ServiceInfo};

use crate::constants;

/// Maximum frame size (1 MB); field values are tiny
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default socket path (XDG_RUNTIME_DIR with fallback to cache)
pub fn default_socket_path() -> Result<PathBuf> {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return Ok(PathBuf::from(runtime_dir).join(constants::bus::SOCKET_RELPATH));
    }

    let cache = dirs::cache_dir()
        .context("Failed to determine cache directory (no XDG_RUNTIME_DIR or HOME)")?;
    Ok(cache.join(constants::bus::SOCKET_RELPATH))
}

/// Client connection to the daemon (used by the GUI and tooling)
pub struct BusClient {
    stream: UnixStream,
}

impl BusClient {
    pub fn connect_to(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .context(format!("Failed to connect to bus at {}", path.display()))?;
        Ok(Self { stream })
    }

    /// Send a request and wait for the response
    pub fn request(&mut self, req: &BusRequest) -> Result<BusResponse> {
        write_message(&mut self.stream, req)?;
        read_message(&mut self.stream)
    }
}

/// Server listener owned by the daemon
pub struct BusServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl BusServer {
    pub fn bind_to(socket_path: PathBuf) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create socket directory: {}", parent.display()))?;
        }

        // Remove stale socket if exists
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .context(format!("Failed to remove stale socket: {}", socket_path.display()))?;
        }

        let listener = UnixListener::bind(&socket_path)
            .context(format!("Failed to bind socket at {}", socket_path.display()))?;

        // Owner only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o700))
                .context("Failed to set socket permissions")?;
        }

        Ok(Self {
            listener,
            socket_path,
        })
    }

    /// Accept incoming connection (blocking)
    pub fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self
            .listener
            .accept()
            .context("Failed to accept bus connection")?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for BusServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// One client request paired with its reply slot
pub struct BusCommand {
    pub request: BusRequest,
    pub reply: mpsc::Sender<BusResponse>,
}

/// Spawn the listener thread. It only frames messages; every request is
/// forwarded to the main loop and the reply relayed back, so the core
/// stays single-threaded.
pub fn spawn_listener(
    server: BusServer,
    tx: mpsc::Sender<BusCommand>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        if let Err(e) = run_listener(&server, &tx) {
            error!(error = ?e, "bus listener thread crashed");
        }
    })
}

fn run_listener(server: &BusServer, tx: &mpsc::Sender<BusCommand>) -> Result<()> {
    info!(socket = %server.path().display(), "bus listener started");

    loop {
        let mut stream = server.accept()?;
        info!("client connected to bus");

        loop {
            let request: BusRequest = match read_message(&mut stream) {
                Ok(req) => req,
                Err(e) => {
                    warn!(error = ?e, "bus connection closed or error");
                    break;
                }
            };

            let shutdown = matches!(request, BusRequest::Shutdown);
            let (reply_tx, reply_rx) = mpsc::channel();
            if tx.send(BusCommand { request, reply: reply_tx }).is_err() {
                // Main loop gone; stop accepting
                return Ok(());
            }
            match reply_rx.recv() {
                Ok(response) => {
                    if let Err(e) = write_message(&mut stream, &response) {
                        warn!(error = ?e, "failed to send bus reply");
                        break;
                    }
                }
                Err(_) => break,
            }
            if shutdown {
                return Ok(());
            }
        }

        info!("client disconnected from bus");
    }
}

/// Write length-prefixed message to stream
fn write_message<T: Serialize>(stream: &mut UnixStream, msg: &T) -> Result<()> {
    let json = serde_json::to_vec(msg).context("Failed to serialize message to JSON")?;

    // Length prefix (u32 little-endian), then the JSON payload
    let len = json.len() as u32;
    stream
        .write_all(&len.to_le_bytes())
        .context("Failed to write message length")?;
    stream
        .write_all(&json)
        .context("Failed to write message payload")?;
    stream.flush().context("Failed to flush stream")?;

    Ok(())
}

/// Read length-prefixed message from stream
fn read_message<T: for<'de> Deserialize<'de>>(stream: &mut UnixStream) -> Result<T> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .context("Failed to read message length")?;
    let len = u32::from_le_bytes(len_buf) as usize;

    // Sanity check (prevent huge allocation)
    if len > MAX_MESSAGE_SIZE {
        return Err(anyhow!(
            "Message too large: {} bytes (max: {})",
            len,
            MAX_MESSAGE_SIZE
        ));
    }

    let mut json_buf = vec![0u8; len];
    stream
        .read_exact(&mut json_buf)
        .context("Failed to read message payload")?;

    serde_json::from_slice(&json_buf).context("Failed to deserialize message from JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldValue;

    #[test]
    fn test_request_response_roundtrip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("bus.sock");
        let server = BusServer::bind_to(socket_path.clone()).unwrap();

        let handle = std::thread::spawn(move || {
            let mut stream = server.accept().unwrap();
            let request: BusRequest = read_message(&mut stream).unwrap();
            let response = match request {
                BusRequest::Ping => BusResponse::Pong,
                _ => BusResponse::Error("unexpected request".to_string()),
            };
            write_message(&mut stream, &response).unwrap();
        });

        let mut client = BusClient::connect_to(&socket_path).unwrap();
        let response = client.request(&BusRequest::Ping).unwrap();
        assert!(matches!(response, BusResponse::Pong));
        handle.join().unwrap();
    }

    #[test]
    fn test_set_value_frame_shape() {
        let req = BusRequest::SetValue {
            service: "tank-1".to_string(),
            path: "/Capacity".to_string(),
            value: FieldValue::Int(500),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"SetValue\""));
        assert!(json.contains("\"value\":500"));

        let back: BusRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, BusRequest::SetValue { value: FieldValue::Int(500), .. }));
    }

    #[test]
    fn test_stale_socket_is_replaced_on_bind() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("bus.sock");
        drop(BusServer::bind_to(socket_path.clone()).unwrap());
        // First server unlinked its socket on drop; a leftover file must
        // not block the next bind either
        std::fs::write(&socket_path, b"stale").unwrap();
        let server = BusServer::bind_to(socket_path.clone()).unwrap();
        assert_eq!(server.path(), socket_path);
    }
}
