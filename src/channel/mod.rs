//! Framed message transport over Unix domain sockets
//!
//! One newline-terminated JSON envelope per frame. A channel is either a
//! server (accepts many peers, can broadcast) or a client (one
//! connection). Ill-formed frames are dropped with a warning and the
//! endpoint stays usable; I/O errors close the affected connection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ConductorError, Result};
use crate::protocol::message::AgentMessage;

const INBOUND_CAPACITY: usize = 256;

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelMode {
    Server,
    Client,
}

struct ChannelShared {
    running: AtomicBool,
    /// Server mode: connected peers keyed by the sender id learned from
    /// their first frame
    peers: Mutex<HashMap<String, SharedWriter>>,
    /// Client mode: the single connection writer
    writer: Mutex<Option<SharedWriter>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Bidirectional framed channel over a filesystem-addressed stream socket
pub struct SocketChannel {
    path: PathBuf,
    mode: ChannelMode,
    inbound: Mutex<mpsc::Receiver<AgentMessage>>,
    shared: Arc<ChannelShared>,
}

impl SocketChannel {
    /// Server mode: create the socket, listen, and accept clients
    pub async fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::remove_file(&path).await.ok();
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }

        let listener = UnixListener::bind(&path).map_err(|e| {
            ConductorError::communication(format!("failed to bind {}", path.display()))
                .with_source(e)
        })?;
        info!("channel listening on {}", path.display());

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let shared = Arc::new(ChannelShared {
            running: AtomicBool::new(true),
            peers: Mutex::new(HashMap::new()),
            writer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        if !accept_shared.running.load(Ordering::SeqCst) {
                            break;
                        }
                        let conn_shared = Arc::clone(&accept_shared);
                        let conn_tx = inbound_tx.clone();
                        let handle = tokio::spawn(async move {
                            handle_peer(stream, conn_shared, conn_tx).await;
                        });
                        accept_shared.tasks.lock().await.push(handle);
                    }
                    Err(e) => {
                        if accept_shared.running.load(Ordering::SeqCst) {
                            warn!("accept error: {}", e);
                        }
                        break;
                    }
                }
            }
        });
        shared.tasks.lock().await.push(accept_task);

        Ok(Self {
            path,
            mode: ChannelMode::Server,
            inbound: Mutex::new(inbound_rx),
            shared,
        })
    }

    /// Client mode: connect to an existing endpoint
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&path).await.map_err(|e| {
            ConductorError::communication(format!("failed to connect to {}", path.display()))
                .with_source(e)
        })?;
        debug!("connected to channel at {}", path.display());

        let (read_half, write_half) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let shared = Arc::new(ChannelShared {
            running: AtomicBool::new(true),
            peers: Mutex::new(HashMap::new()),
            writer: Mutex::new(Some(Arc::new(Mutex::new(write_half)))),
            tasks: Mutex::new(Vec::new()),
        });

        let reader_shared = Arc::clone(&shared);
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            while reader_shared.running.load(Ordering::SeqCst) {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => match AgentMessage::from_frame(&line) {
                        Ok(message) => {
                            if inbound_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("dropping ill-formed frame: {}", e),
                    },
                    Err(e) => {
                        if reader_shared.running.load(Ordering::SeqCst) {
                            warn!("read error: {}", e);
                        }
                        break;
                    }
                }
            }
        });
        shared.tasks.lock().await.push(reader_task);

        Ok(Self {
            path,
            mode: ChannelMode::Client,
            inbound: Mutex::new(inbound_rx),
            shared,
        })
    }

    /// Serialize and send one message.
    ///
    /// Client mode writes to the single connection. Server mode routes
    /// by `receiver_id`: `broadcast` goes to every peer, anything else
    /// to the registered peer of that name.
    pub async fn send(&self, message: &AgentMessage) -> Result<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(ConductorError::communication("channel is closed"));
        }

        match self.mode {
            ChannelMode::Client => {
                let writer = self.shared.writer.lock().await.clone();
                let writer = writer
                    .ok_or_else(|| ConductorError::communication("channel is closed"))?;
                write_frame(&writer, message).await
            }
            ChannelMode::Server => {
                if message.is_broadcast() {
                    self.broadcast(message, None).await
                } else {
                    let writer = {
                        let peers = self.shared.peers.lock().await;
                        peers.get(&message.receiver_id).cloned()
                    };
                    match writer {
                        Some(writer) => write_frame(&writer, message).await,
                        None => Err(ConductorError::communication(format!(
                            "unknown peer: {}",
                            message.receiver_id
                        ))),
                    }
                }
            }
        }
    }

    /// Receive one message or return `None` on timeout
    pub async fn receive(&self, timeout: Duration) -> Option<AgentMessage> {
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Ok(message) => message,
            Err(_) => None,
        }
    }

    /// Server mode only: deliver to all connected peers except one
    pub async fn broadcast(&self, message: &AgentMessage, except: Option<&str>) -> Result<()> {
        if self.mode != ChannelMode::Server {
            return Err(ConductorError::communication(
                "broadcast requires server mode",
            ));
        }

        let peers: Vec<(String, SharedWriter)> = {
            let guard = self.shared.peers.lock().await;
            guard
                .iter()
                .filter(|(id, _)| except != Some(id.as_str()))
                .map(|(id, w)| (id.clone(), Arc::clone(w)))
                .collect()
        };

        for (peer_id, writer) in peers {
            if let Err(e) = write_frame(&writer, message).await {
                warn!(peer = %peer_id, "broadcast delivery failed: {}", e);
            }
        }
        Ok(())
    }

    /// Number of currently registered peers (server mode)
    pub async fn peer_count(&self) -> usize {
        self.shared.peers.lock().await.len()
    }

    /// Shut down all connections; a server also unlinks its socket file
    pub async fn close(&self) {
        self.shared.running.store(false, Ordering::SeqCst);

        {
            let mut writer = self.shared.writer.lock().await;
            *writer = None;
        }
        self.shared.peers.lock().await.clear();

        let mut tasks = self.shared.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }

        if self.mode == ChannelMode::Server {
            tokio::fs::remove_file(&self.path).await.ok();
            info!("channel at {} closed", self.path.display());
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn write_frame(writer: &SharedWriter, message: &AgentMessage) -> Result<()> {
    let frame = message.to_frame()?;
    let mut guard = writer.lock().await;
    guard
        .write_all(frame.as_bytes())
        .await
        .map_err(|e| ConductorError::communication("write failed").with_source(e))?;
    guard
        .flush()
        .await
        .map_err(|e| ConductorError::communication("flush failed").with_source(e))?;
    Ok(())
}

/// Per-connection server loop: read frames, learn the peer identity from
/// the first frame, relay broadcasts, and feed the shared inbound queue.
async fn handle_peer(
    stream: UnixStream,
    shared: Arc<ChannelShared>,
    inbound: mpsc::Sender<AgentMessage>,
) {
    let (read_half, write_half) = stream.into_split();
    let writer: SharedWriter = Arc::new(Mutex::new(write_half));
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut peer_id: Option<String> = None;

    while shared.running.load(Ordering::SeqCst) {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let message = match AgentMessage::from_frame(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("dropping ill-formed frame: {}", e);
                        continue;
                    }
                };

                if peer_id.is_none() {
                    peer_id = Some(message.sender_id.clone());
                    shared
                        .peers
                        .lock()
                        .await
                        .insert(message.sender_id.clone(), Arc::clone(&writer));
                    debug!(peer = %message.sender_id, "peer registered");
                }

                if message.is_broadcast() {
                    let targets: Vec<SharedWriter> = {
                        let peers = shared.peers.lock().await;
                        peers
                            .iter()
                            .filter(|(id, _)| Some(id.as_str()) != peer_id.as_deref())
                            .map(|(_, w)| Arc::clone(w))
                            .collect()
                    };
                    for target in targets {
                        if let Err(e) = write_frame(&target, &message).await {
                            warn!("broadcast relay failed: {}", e);
                        }
                    }
                }

                if inbound.send(message).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                if shared.running.load(Ordering::SeqCst) {
                    warn!("peer read error: {}", e);
                }
                break;
            }
        }
    }

    if let Some(id) = peer_id {
        shared.peers.lock().await.remove(&id);
        debug!(peer = %id, "peer disconnected");
    }
}
