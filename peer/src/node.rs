//! One peer process: a session plus its network plumbing
//!
//! The node loop is the only owner of the [`GameSession`]. It alternates
//! between the session's outgoing queue and network events, so every
//! envelope reaches the session in the order the message server fixed.

use crate::hub::{accept_loop, connect, Hub, NetworkEvent};
use crate::transport::{ChannelTransport, Outbound};
use log::{debug, info, warn};
use session::{GameSession, SessionConfig};
use shared::{Envelope, PeerId};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// How envelopes leave this node
#[derive(Debug)]
enum Link {
    /// We are the admin and run the message server (possibly alone)
    Hosting(Hub),
    /// We are a client of a remote admin
    Client(mpsc::UnboundedSender<Envelope>),
}

pub struct Node {
    session: GameSession<ChannelTransport>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events_tx: mpsc::UnboundedSender<NetworkEvent>,
    events: mpsc::UnboundedReceiver<NetworkEvent>,
    link: Link,
}

impl Node {
    /// Creates a standalone admin node. Call [`Node::listen`] or
    /// [`Node::join`] to go online.
    pub fn new(config: SessionConfig) -> Self {
        let (transport, outbound) = ChannelTransport::channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            session: GameSession::new(config, transport),
            outbound,
            events_tx,
            events,
            link: Link::Hosting(Hub::new()),
        }
    }

    pub fn session(&self) -> &GameSession<ChannelTransport> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut GameSession<ChannelTransport> {
        &mut self.session
    }

    /// Accepts clients on `addr`; returns the bound address
    pub async fn listen(&mut self, addr: &str) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("Hosting game on {}", local);
        tokio::spawn(accept_loop(listener, self.events_tx.clone()));
        Ok(local)
    }

    /// Connects to the admin at `addr`. The admin starts the handshake.
    pub async fn join(&mut self, addr: &str) -> io::Result<PeerId> {
        let (id, queue) = connect(addr, self.events_tx.clone()).await?;
        self.session.connect_to_admin(id, PeerId::ADMIN);
        self.link = Link::Client(queue);
        Ok(id)
    }

    /// Runs one step: waits for the next outgoing envelope or network event
    /// and handles it. Returns `false` once every source is closed.
    pub async fn step(&mut self) -> bool {
        tokio::select! {
            Some(outbound) = self.outbound.recv() => {
                self.handle_outbound(outbound);
                true
            }
            Some(event) = self.events.recv() => {
                self.handle_network(event);
                true
            }
            else => false,
        }
    }

    /// Handles everything already queued without waiting
    pub fn drain(&mut self) {
        loop {
            if let Ok(outbound) = self.outbound.try_recv() {
                self.handle_outbound(outbound);
            } else if let Ok(event) = self.events.try_recv() {
                self.handle_network(event);
            } else {
                return;
            }
        }
    }

    fn handle_outbound(&mut self, outbound: Outbound) {
        match outbound {
            Outbound::Send(envelope) => match &mut self.link {
                Link::Hosting(hub) => {
                    if hub.route(&envelope) {
                        self.session.handle_message(envelope);
                    }
                }
                Link::Client(queue) => {
                    if queue.send(envelope).is_err() {
                        warn!("Connection to the admin is closed");
                    }
                }
            },
            Outbound::Disconnect(peer) => {
                if let Link::Hosting(hub) = &mut self.link {
                    if hub.drop_peer(peer) {
                        info!("Disconnected {}", peer);
                    }
                    return;
                }
                info!("Closing connection to {}", peer);
                self.link = Link::Hosting(Hub::new());
            }
        }
    }

    fn handle_network(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Accepted { stream, addr } => {
                let Link::Hosting(hub) = &mut self.link else {
                    warn!("Refusing {}: not hosting", addr);
                    return;
                };
                if !self.session.is_admin() {
                    warn!("Refusing {}: not the admin", addr);
                    return;
                }
                if let Some(id) = hub.attach(stream, self.events_tx.clone()) {
                    info!("{} is {}", addr, id);
                    self.session.client_connected(id);
                }
            }
            NetworkEvent::Received { from, mut envelope } => match &mut self.link {
                Link::Hosting(hub) => {
                    if envelope.sender != from {
                        warn!("{} sent as {}, correcting", from, envelope.sender);
                        envelope.sender = from;
                    }
                    if hub.route(&envelope) {
                        self.session.handle_message(envelope);
                    }
                }
                Link::Client(_) => self.session.handle_message(envelope),
            },
            NetworkEvent::PeerDisconnected(peer) => {
                if let Link::Hosting(hub) = &mut self.link {
                    hub.drop_peer(peer);
                }
                self.session.client_disconnected(peer);
            }
            NetworkEvent::AdminLost => {
                if matches!(self.link, Link::Client(_)) {
                    self.link = Link::Hosting(Hub::new());
                    self.session.admin_disconnected();
                } else {
                    debug!("Admin connection closed after we left");
                }
            }
        }
    }
}
