//! Building blocks shared by every peer of a replicated game session
//!
//! - [`wire`]: sequential bincode codec used for payloads and save streams
//! - [`protocol`]: message envelope, reserved message ids, peer and player ids
//! - [`property`]: typed, policy-gated replicated properties
//! - [`random`]: the deterministic random sequence all peers share

pub mod property;
pub mod protocol;
pub mod random;
pub mod wire;

pub use property::{
    HandlerSnapshot, Policy, PropertyChanged, PropertyError, PropertyId, PropertyKey,
    PropertyReplicator, PropertyValue,
};
pub use protocol::{
    is_player_address, ClientRef, Envelope, ErrorReport, MessageKind, PeerId, PlayerId, PlayerRef,
    Route, SetupGame, SyncRandom, BROADCAST, PROTOCOL_VERSION, USER_MESSAGE_BASE,
};
pub use random::RandomSequence;
pub use wire::{Reader, WireError, Writer};
