//! Message envelope, protocol message ids and the peer/player id spaces
//!
//! Every message travelling between peers is an [`Envelope`]. Ids below
//! [`USER_MESSAGE_BASE`] are reserved for the session protocol and property
//! replication; everything above belongs to the application.
//!
//! Receivers are plain integers on the wire:
//! - `0` broadcasts to every peer, including the sender
//! - a value with player bits set addresses a player; every peer mirrors every
//!   player, so these are broadcast as well
//! - anything else is the id of a single peer

use crate::wire::{self, WireError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version exchanged in `SetupGame`; peers with a different version are refused
pub const PROTOCOL_VERSION: i16 = 3;

/// First message id available to applications
pub const USER_MESSAGE_BASE: u32 = 1000;

/// Receiver id meaning "every peer"
pub const BROADCAST: u32 = 0;

const PLAYER_SEQUENCE_BITS: u32 = 10;
const PLAYER_SEQUENCE_MASK: u32 = (1 << PLAYER_SEQUENCE_BITS) - 1;
const PEER_ID_MASK: u32 = 0x3f;
const PLAYER_PEER_MASK: u32 = PEER_ID_MASK << PLAYER_SEQUENCE_BITS;

/// Endpoint id of one peer in the star network. The admin is always `1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl PeerId {
    pub const ADMIN: PeerId = PeerId(1);

    /// Largest peer id that still fits inside a player id
    pub const MAX: u32 = PEER_ID_MASK;

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer {}", self.0)
    }
}

/// Globally unique player id: a per-admin sequence number in the low 10 bits
/// and the owning peer in the 6 bits above it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(u32);

impl PlayerId {
    /// Largest sequence number before it wraps to zero
    pub const MAX_SEQUENCE: u32 = PLAYER_SEQUENCE_MASK;

    pub fn new(sequence: u32, owner: PeerId) -> Self {
        PlayerId(((owner.0 & PEER_ID_MASK) << PLAYER_SEQUENCE_BITS) | (sequence & PLAYER_SEQUENCE_MASK))
    }

    /// Interprets a raw wire value; `None` when the value carries no owner bits
    pub fn from_raw(raw: u32) -> Option<Self> {
        is_player_address(raw).then_some(PlayerId(raw))
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn owner(self) -> PeerId {
        PeerId((self.0 & PLAYER_PEER_MASK) >> PLAYER_SEQUENCE_BITS)
    }

    pub fn sequence(self) -> u32 {
        self.0 & PLAYER_SEQUENCE_MASK
    }

    /// Same sequence number, moved into another peer's id space
    pub fn rescoped(self, owner: PeerId) -> Self {
        Self::new(self.sequence(), owner)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player {}:{}", self.owner().0, self.sequence())
    }
}

/// True when `receiver` addresses a player rather than a peer
pub fn is_player_address(receiver: u32) -> bool {
    receiver & PLAYER_PEER_MASK != 0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SetupGame,
    SetupGameContinue,
    GameLoad,
    Connected,
    SyncRandom,
    Disconnect,
    SetupDone,
    PlayerProperty,
    GameProperty,
    AddPlayer,
    RemovePlayer,
    ActivatePlayer,
    InactivatePlayer,
    Error,
    PlayerInput,
    /// Application message, offset from [`USER_MESSAGE_BASE`]
    User(u32),
}

impl MessageKind {
    pub fn id(self) -> u32 {
        match self {
            MessageKind::SetupGame => 1,
            MessageKind::SetupGameContinue => 2,
            MessageKind::GameLoad => 3,
            MessageKind::Connected => 4,
            MessageKind::SyncRandom => 5,
            MessageKind::Disconnect => 6,
            MessageKind::SetupDone => 7,
            MessageKind::PlayerProperty => 20,
            MessageKind::GameProperty => 21,
            MessageKind::AddPlayer => 30,
            MessageKind::RemovePlayer => 31,
            MessageKind::ActivatePlayer => 32,
            MessageKind::InactivatePlayer => 33,
            MessageKind::Error => 100,
            MessageKind::PlayerInput => 101,
            MessageKind::User(offset) => USER_MESSAGE_BASE.saturating_add(offset),
        }
    }

    /// Maps a wire id back to its kind; unknown reserved ids yield `None`
    pub fn from_id(id: u32) -> Option<Self> {
        let kind = match id {
            1 => MessageKind::SetupGame,
            2 => MessageKind::SetupGameContinue,
            3 => MessageKind::GameLoad,
            4 => MessageKind::Connected,
            5 => MessageKind::SyncRandom,
            6 => MessageKind::Disconnect,
            7 => MessageKind::SetupDone,
            20 => MessageKind::PlayerProperty,
            21 => MessageKind::GameProperty,
            30 => MessageKind::AddPlayer,
            31 => MessageKind::RemovePlayer,
            32 => MessageKind::ActivatePlayer,
            33 => MessageKind::InactivatePlayer,
            100 => MessageKind::Error,
            101 => MessageKind::PlayerInput,
            id if id >= USER_MESSAGE_BASE => MessageKind::User(id - USER_MESSAGE_BASE),
            _ => return None,
        };
        Some(kind)
    }
}

/// Where the message server delivers an envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Broadcast,
    Peer(PeerId),
}

/// One message as carried by the transport
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: u32,
    pub receiver: u32,
    pub sender: PeerId,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(kind: MessageKind, receiver: u32, sender: PeerId, payload: Vec<u8>) -> Self {
        Self {
            message_id: kind.id(),
            receiver,
            sender,
            payload,
        }
    }

    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_id(self.message_id)
    }

    pub fn route(&self) -> Route {
        if self.receiver == BROADCAST || is_player_address(self.receiver) {
            Route::Broadcast
        } else {
            Route::Peer(PeerId(self.receiver))
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        wire::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        wire::decode(bytes)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupGame {
    pub version: i16,
    pub cookie: i32,
}

/// Payload of `ActivatePlayer`, `InactivatePlayer` and `RemovePlayer`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRef {
    pub id: i32,
}

impl PlayerRef {
    pub fn new(id: PlayerId) -> Self {
        Self { id: id.raw() as i32 }
    }

    pub fn player_id(self) -> Option<PlayerId> {
        u32::try_from(self.id).ok().and_then(PlayerId::from_raw)
    }
}

/// Payload of `SetupDone` and `Connected`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRef {
    pub client_id: i32,
}

impl ClientRef {
    pub fn new(client: PeerId) -> Self {
        Self {
            client_id: client.0 as i32,
        }
    }

    pub fn peer_id(self) -> Option<PeerId> {
        u32::try_from(self.client_id).ok().map(PeerId)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRandom {
    pub seed: i32,
}

/// Sent before disconnecting a peer whose setup was refused
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: i32,
    pub message: String,
}

impl ErrorReport {
    pub const COOKIE_MISMATCH: i32 = 1;
    pub const VERSION_MISMATCH: i32 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_id_packs_owner_and_sequence() {
        let id = PlayerId::new(5, PeerId(2));
        assert_eq!(id.raw(), (2 << 10) | 5);
        assert_eq!(id.owner(), PeerId(2));
        assert_eq!(id.sequence(), 5);
        assert!(is_player_address(id.raw()));
    }

    #[test]
    fn test_player_sequence_wraps_at_ten_bits() {
        let id = PlayerId::new(1024 + 3, PeerId::ADMIN);
        assert_eq!(id.sequence(), 3);
        assert_eq!(id.owner(), PeerId::ADMIN);
    }

    #[test]
    fn test_rescoped_keeps_sequence() {
        let local = PlayerId::new(7, PeerId::ADMIN);
        let moved = local.rescoped(PeerId(4));
        assert_eq!(moved.sequence(), 7);
        assert_eq!(moved.owner(), PeerId(4));
        assert_ne!(local, moved);
    }

    #[test]
    fn test_peer_ids_are_not_player_addresses() {
        assert!(!is_player_address(0));
        assert!(!is_player_address(1));
        assert!(!is_player_address(PeerId::MAX));
        assert_eq!(PlayerId::from_raw(3), None);
    }

    #[test]
    fn test_message_ids_round_trip() {
        let kinds = [
            MessageKind::SetupGame,
            MessageKind::SetupDone,
            MessageKind::GameProperty,
            MessageKind::InactivatePlayer,
            MessageKind::PlayerInput,
            MessageKind::User(7),
        ];
        for kind in kinds {
            assert_eq!(MessageKind::from_id(kind.id()), Some(kind));
        }
        assert_eq!(MessageKind::User(0).id(), USER_MESSAGE_BASE);
        assert_eq!(MessageKind::from_id(55), None);
    }

    #[test]
    fn test_routing() {
        let player = PlayerId::new(1, PeerId(3));
        let to_player = Envelope::new(MessageKind::PlayerProperty, player.raw(), PeerId(3), vec![]);
        assert_eq!(to_player.route(), Route::Broadcast);

        let to_all = Envelope::new(MessageKind::SyncRandom, BROADCAST, PeerId::ADMIN, vec![]);
        assert_eq!(to_all.route(), Route::Broadcast);

        let to_peer = Envelope::new(MessageKind::SetupGame, 3, PeerId::ADMIN, vec![]);
        assert_eq!(to_peer.route(), Route::Peer(PeerId(3)));
    }

    #[test]
    fn test_setup_game_layout() {
        let bytes = wire::encode(&SetupGame {
            version: PROTOCOL_VERSION,
            cookie: 42,
        })
        .unwrap();
        assert_eq!(bytes, vec![3, 0, 42, 0, 0, 0]);
    }

    #[test]
    fn test_envelope_encoding() {
        let envelope = Envelope::new(MessageKind::User(2), 5, PeerId(5), vec![9, 8, 7]);
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.kind(), Some(MessageKind::User(2)));
    }
}
