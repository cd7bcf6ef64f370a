//! Message server and connection tasks
//!
//! The admin's node hosts a [`Hub`]: it hands out peer ids, keeps one
//! outgoing queue per connected peer and routes every envelope by its
//! receiver. Socket I/O runs in per-connection tasks that only move frames;
//! everything they read is reported to the node loop as a [`NetworkEvent`]
//! so the session sees one ordered stream.

use crate::framing::{read_envelope, read_welcome, write_envelope, write_welcome};
use log::{debug, error, info, warn};
use shared::{Envelope, PeerId, Route};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Reports from network tasks to the node loop
#[derive(Debug)]
pub enum NetworkEvent {
    Accepted {
        stream: TcpStream,
        addr: SocketAddr,
    },
    Received {
        from: PeerId,
        envelope: Envelope,
    },
    PeerDisconnected(PeerId),
    /// The connection to our admin closed
    AdminLost,
}

#[derive(Debug)]
pub struct Hub {
    peers: BTreeMap<PeerId, mpsc::UnboundedSender<Envelope>>,
    next_id: u32,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            peers: BTreeMap::new(),
            next_id: PeerId::ADMIN.raw() + 1,
        }
    }

    /// Assigns the next free peer id to a queue. `None` when the id space
    /// is exhausted.
    pub fn register(&mut self, queue: mpsc::UnboundedSender<Envelope>) -> Option<PeerId> {
        let free = (self.next_id..=PeerId::MAX)
            .chain(PeerId::ADMIN.raw() + 1..self.next_id)
            .map(PeerId)
            .find(|id| !self.peers.contains_key(id))?;
        self.next_id = if free.raw() >= PeerId::MAX {
            PeerId::ADMIN.raw() + 1
        } else {
            free.raw() + 1
        };
        self.peers.insert(free, queue);
        Some(free)
    }

    pub fn drop_peer(&mut self, id: PeerId) -> bool {
        self.peers.remove(&id).is_some()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Forwards an envelope to the remote peers it is meant for. Returns
    /// whether the local session must receive it as well.
    pub fn route(&mut self, envelope: &Envelope) -> bool {
        match envelope.route() {
            Route::Broadcast => {
                let mut gone = Vec::new();
                for (id, queue) in &self.peers {
                    if queue.send(envelope.clone()).is_err() {
                        gone.push(*id);
                    }
                }
                for id in gone {
                    warn!("Queue of {} is closed", id);
                    self.peers.remove(&id);
                }
                true
            }
            Route::Peer(target) if target == PeerId::ADMIN => true,
            Route::Peer(target) => {
                match self.peers.get(&target) {
                    Some(queue) => {
                        if queue.send(envelope.clone()).is_err() {
                            warn!("Queue of {} is closed", target);
                            self.peers.remove(&target);
                        }
                    }
                    None => debug!(
                        "Dropping message {} for unknown {}",
                        envelope.message_id, target
                    ),
                }
                false
            }
        }
    }

    /// Registers an accepted connection and starts its tasks
    pub fn attach(
        &mut self,
        stream: TcpStream,
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Option<PeerId> {
        let (queue, outgoing) = mpsc::unbounded_channel();
        let Some(id) = self.register(queue) else {
            error!("No peer id left, refusing connection");
            return None;
        };
        let (reader, writer) = stream.into_split();
        tokio::spawn(write_loop(writer, Some(id), outgoing));
        tokio::spawn(async move {
            read_loop(reader, id, &events).await;
            // a closed event loop means shutdown, nothing left to tell
            let _ = events.send(NetworkEvent::PeerDisconnected(id));
        });
        Some(id)
    }
}

/// Accepts connections until the listener fails or the node loop is gone
pub async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<NetworkEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("Connection from {}", addr);
                if events.send(NetworkEvent::Accepted { stream, addr }).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                break;
            }
        }
    }
}

/// Connects to an admin's hub. Returns our assigned peer id and the queue
/// for envelopes to the hub.
pub async fn connect(
    addr: &str,
    events: mpsc::UnboundedSender<NetworkEvent>,
) -> io::Result<(PeerId, mpsc::UnboundedSender<Envelope>)> {
    let stream = TcpStream::connect(addr).await?;
    let (mut reader, writer) = stream.into_split();
    let id = read_welcome(&mut reader).await?;
    info!("Connected to {} as {}", addr, id);

    let (queue, outgoing) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(writer, None, outgoing));
    tokio::spawn(async move {
        read_loop(reader, PeerId::ADMIN, &events).await;
        let _ = events.send(NetworkEvent::AdminLost);
    });
    Ok((id, queue))
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    welcome: Option<PeerId>,
    mut outgoing: mpsc::UnboundedReceiver<Envelope>,
) {
    if let Some(id) = welcome {
        if let Err(e) = write_welcome(&mut writer, id).await {
            warn!("Failed to greet {}: {}", id, e);
            return;
        }
    }
    while let Some(envelope) = outgoing.recv().await {
        if let Err(e) = write_envelope(&mut writer, &envelope).await {
            warn!("Failed to send message {}: {}", envelope.message_id, e);
            return;
        }
    }
    debug!("Outgoing queue closed");
}

async fn read_loop(mut reader: OwnedReadHalf, from: PeerId, events: &mpsc::UnboundedSender<NetworkEvent>) {
    loop {
        match read_envelope(&mut reader).await {
            Ok(envelope) => {
                if events.send(NetworkEvent::Received { from, envelope }).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!("{} closed the connection", from);
                return;
            }
            Err(e) => {
                warn!("Dropping connection to {}: {}", from, e);
                return;
            }
        }
    }
}
