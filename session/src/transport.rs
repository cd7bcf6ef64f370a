//! The transport collaborator
//!
//! The session never talks to sockets. It hands envelopes to a [`Transport`],
//! which must deliver them reliably and in order through the admin's message
//! server; broadcasts come back to their sender as well.

use shared::{Envelope, PeerId};
use std::collections::VecDeque;

pub trait Transport {
    fn send(&mut self, envelope: Envelope);

    /// Drops the connection to `peer`
    fn disconnect(&mut self, peer: PeerId);
}

/// Discards everything. Suits sessions that only use `Local` policy.
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn send(&mut self, _envelope: Envelope) {}

    fn disconnect(&mut self, _peer: PeerId) {}
}

/// Keeps outgoing envelopes until someone drains them
#[derive(Debug, Default)]
pub struct QueueTransport {
    outbox: VecDeque<Envelope>,
    disconnected: Vec<PeerId>,
}

impl QueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> Vec<Envelope> {
        self.outbox.drain(..).collect()
    }

    pub fn take_disconnects(&mut self) -> Vec<PeerId> {
        std::mem::take(&mut self.disconnected)
    }

    pub fn pending(&self) -> usize {
        self.outbox.len()
    }
}

impl Transport for QueueTransport {
    fn send(&mut self, envelope: Envelope) {
        self.outbox.push_back(envelope);
    }

    fn disconnect(&mut self, peer: PeerId) {
        self.disconnected.push(peer);
    }
}
