use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::p2p::codec::{self, FrameCodec};
use crate::p2p::messages::{PeerAddress, RpcMessage};

pub type Shared<T> = Arc<Mutex<T>>;

/// One entry of the known-peers cache kept between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedPeer {
    pub addr: String,
    pub last_seen: i64,
}

/// Inbound traffic surfaced to the node's dispatcher. `from` is the remote
/// socket address of the connection the frame arrived on, not the peer's
/// listening identity; the dispatcher translates via the identity table.
#[derive(Debug)]
pub enum PeerEvent {
    Message {
        from: SocketAddr,
        message: RpcMessage,
    },
    Disconnected {
        from: SocketAddr,
    },
}

/// Per-peer persistent TCP plumbing.
///
/// Outbound: one dedicated socket per known peer identity, fed through an
/// unbounded channel by a writer task. Inbound: the listener spawns one
/// reader task per accepted connection, which decodes frames and forwards
/// them as [`PeerEvent`]s. The two directions of a logical peer link are
/// separate sockets, which is why the identity table exists.
pub struct PeerManager {
    local_addr: SocketAddr,
    peers: Shared<HashMap<SocketAddr, UnboundedSender<RpcMessage>>>,
    identities: Shared<HashMap<SocketAddr, SocketAddr>>,
    events: UnboundedSender<PeerEvent>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl PeerManager {
    /// Bind the listener (with address reuse so orchestrators can recycle
    /// ports) and start accepting. Port 0 asks the OS for a free port.
    pub async fn bind(host: &str, port: u16) -> Result<(Arc<Self>, UnboundedReceiver<PeerEvent>)> {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .with_context(|| format!("cannot resolve {host}:{port}"))?;
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        #[cfg(unix)]
        socket.set_reuseport(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(128)?;
        let local_addr = listener.local_addr()?;

        let (events, receiver) = mpsc::unbounded_channel();
        let manager = Arc::new(PeerManager {
            local_addr,
            peers: Arc::new(Mutex::new(HashMap::new())),
            identities: Arc::new(Mutex::new(HashMap::new())),
            events,
            accept_task: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });
        let accept_task = tokio::spawn(Self::accept_loop(manager.clone(), listener));
        *manager.accept_task.lock() = Some(accept_task);
        Ok((manager, receiver))
    }

    async fn accept_loop(manager: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    if manager.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    debug!("accepted connection from {remote}");
                    tokio::spawn(Self::read_loop(manager.clone(), stream, remote));
                }
                Err(e) => {
                    if !manager.shutdown.load(Ordering::Relaxed) {
                        error!("listener failed, no longer accepting peers: {e}");
                    }
                    break;
                }
            }
        }
    }

    /// Drain one inbound connection until EOF or a read error. Malformed
    /// frames are logged and skipped; only transport errors end the loop.
    async fn read_loop(manager: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let mut frames = FramedRead::new(stream, FrameCodec);
        while let Some(segment) = frames.next().await {
            match segment {
                Ok(bytes) => match codec::decode_payload(&bytes) {
                    Ok(message) => {
                        let event = PeerEvent::Message {
                            from: remote,
                            message,
                        };
                        if manager.events.send(event).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("dropping malformed frame from {remote}: {e}"),
                },
                Err(e) => {
                    warn!("read error from {remote}: {e}");
                    break;
                }
            }
        }
        debug!("connection from {remote} closed");
        manager.identities.lock().remove(&remote);
        let _ = manager.events.send(PeerEvent::Disconnected { from: remote });
    }

    /// Dial a peer and introduce ourselves with the `connect` verb. Returns
    /// false when a connection to that identity already exists.
    pub async fn connect(&self, peer: SocketAddr) -> Result<bool> {
        if self.peers.lock().contains_key(&peer) {
            return Ok(false);
        }
        let stream = TcpStream::connect(peer)
            .await
            .with_context(|| format!("cannot dial peer {peer}"))?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.peers.lock().insert(peer, sender.clone());
        self.spawn_write_loop(peer, stream, receiver);

        let hello = RpcMessage::Connect {
            server_address: self.identity(),
            peers: self.peer_identities(),
        };
        let _ = sender.send(hello);
        Ok(true)
    }

    fn spawn_write_loop(
        &self,
        peer: SocketAddr,
        stream: TcpStream,
        mut receiver: UnboundedReceiver<RpcMessage>,
    ) {
        let peers = self.peers.clone();
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(stream, FrameCodec);
            while let Some(message) = receiver.recv().await {
                if let Err(e) = sink.send(message).await {
                    warn!("send to {peer} failed: {e}");
                    break;
                }
            }
            peers.lock().remove(&peer);
            debug!("outbound link to {peer} closed");
        });
    }

    /// Our listening identity as advertised on the wire.
    pub fn identity(&self) -> PeerAddress {
        (self.local_addr.ip().to_string(), self.local_addr.port())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.peers.lock().keys().copied().collect()
    }

    pub fn peer_identities(&self) -> Vec<PeerAddress> {
        self.peers
            .lock()
            .keys()
            .map(|addr| (addr.ip().to_string(), addr.port()))
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_connected(&self, peer: SocketAddr) -> bool {
        self.peers.lock().contains_key(&peer)
    }

    /// Record which listening identity an inbound connection speaks for.
    pub fn register_identity(&self, remote: SocketAddr, identity: SocketAddr) {
        self.identities.lock().insert(remote, identity);
    }

    pub fn identity_of(&self, remote: SocketAddr) -> Option<SocketAddr> {
        self.identities.lock().get(&remote).copied()
    }

    /// Unicast. Returns false when the peer is unknown or its link is gone.
    pub fn send_to(&self, peer: SocketAddr, message: RpcMessage) -> bool {
        match self.peers.lock().get(&peer) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Send to every connected peer. Iterates a snapshot so peers may
    /// connect or drop while the broadcast is in flight.
    pub fn broadcast(&self, message: &RpcMessage) {
        let snapshot: Vec<(SocketAddr, UnboundedSender<RpcMessage>)> = self
            .peers
            .lock()
            .iter()
            .map(|(addr, sender)| (*addr, sender.clone()))
            .collect();
        debug!("broadcasting {} to {} peers", message.verb(), snapshot.len());
        for (peer, sender) in snapshot {
            if sender.send(message.clone()).is_err() {
                warn!("broadcast to {peer} failed: link closed");
            }
        }
    }

    /// Drop the outbound link to a peer; its writer task closes the socket.
    pub fn disconnect(&self, peer: SocketAddr) -> bool {
        self.peers.lock().remove(&peer).is_some()
    }

    /// Persist the currently connected peers so the next run can redial
    /// them without any configuration.
    pub fn save_known_peers(&self, path: impl AsRef<Path>) -> bool {
        let now = Utc::now().timestamp();
        let saved: Vec<SavedPeer> = self
            .peer_addrs()
            .into_iter()
            .map(|addr| SavedPeer {
                addr: addr.to_string(),
                last_seen: now,
            })
            .collect();
        let path = path.as_ref();
        let body = match serde_json::to_string_pretty(&saved) {
            Ok(body) => body,
            Err(e) => {
                error!("could not serialize peer cache: {e}");
                return false;
            }
        };
        if let Err(e) = std::fs::write(path, body) {
            error!("could not write peer cache '{}': {}", path.display(), e);
            return false;
        }
        true
    }

    /// Read a peer cache written by `save_known_peers`. Unparseable files
    /// and entries are skipped, not fatal.
    pub fn load_known_peers(path: impl AsRef<Path>) -> Vec<SocketAddr> {
        let raw = match std::fs::read_to_string(path.as_ref()) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        let saved: Vec<SavedPeer> = match serde_json::from_str(&raw) {
            Ok(saved) => saved,
            Err(e) => {
                warn!(
                    "ignoring malformed peer cache '{}': {}",
                    path.as_ref().display(),
                    e
                );
                return Vec::new();
            }
        };
        saved
            .iter()
            .filter_map(|peer| peer.addr.parse().ok())
            .collect()
    }

    /// Stop accepting, drop every outbound link. Queued frames (such as a
    /// parting `end` broadcast) are still flushed by the writer tasks.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.peers.lock().clear();
    }
}
