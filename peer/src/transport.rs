//! Session transport backed by a tokio channel
//!
//! The session runs synchronously inside the node loop; its outgoing traffic
//! is queued here and picked up by the loop on its next turn.

use log::warn;
use session::Transport;
use shared::{Envelope, PeerId};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Send(Envelope),
    Disconnect(PeerId),
}

#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn push(&self, outbound: Outbound) {
        if let Err(e) = self.tx.send(outbound) {
            warn!("Network loop is gone, dropping {:?}", e.0);
        }
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, envelope: Envelope) {
        self.push(Outbound::Send(envelope));
    }

    fn disconnect(&mut self, peer: PeerId) {
        self.push(Outbound::Disconnect(peer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{MessageKind, BROADCAST};

    #[test]
    fn test_outbound_keeps_order() {
        let (mut transport, mut rx) = ChannelTransport::channel();
        let envelope = Envelope::new(MessageKind::Disconnect, BROADCAST, PeerId(2), vec![]);
        transport.send(envelope.clone());
        transport.disconnect(PeerId::ADMIN);

        assert_eq!(rx.try_recv().unwrap(), Outbound::Send(envelope));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Disconnect(PeerId::ADMIN));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_is_not_fatal() {
        let (mut transport, rx) = ChannelTransport::channel();
        drop(rx);
        transport.disconnect(PeerId(3));
    }
}
