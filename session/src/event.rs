//! Notifications delivered to session observers

use crate::config::GameStatus;
use crate::error::LoadErrorKind;
use shared::{PeerId, PlayerId, PropertyId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyOwner {
    Session,
    Player(PlayerId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    PropertyChanged {
        owner: PropertyOwner,
        property: PropertyId,
    },
    PlayerJoined(PlayerId),
    PlayerLeft(PlayerId),
    /// A player kept its identity but moved to another id
    PlayerIdChanged {
        old: PlayerId,
        new: PlayerId,
    },
    ClientJoined(PeerId),
    /// `client` is `None` when this peer lost its admin
    ClientLeft {
        client: Option<PeerId>,
        previous_status: GameStatus,
    },
    GameOver {
        result: i32,
        player: PlayerId,
    },
    NetworkData {
        kind: u32,
        receiver: u32,
        sender: PeerId,
        payload: Vec<u8>,
    },
    PlayerData {
        player: PlayerId,
        kind: u32,
        sender: PeerId,
        payload: Vec<u8>,
    },
    SetupRefused {
        peer: PeerId,
        reason: String,
    },
    RemoteError {
        sender: PeerId,
        code: i32,
        message: String,
    },
    Loaded,
    LoadFailed {
        kind: LoadErrorKind,
        message: String,
    },
}

pub type Observer = Box<dyn FnMut(&SessionEvent)>;
