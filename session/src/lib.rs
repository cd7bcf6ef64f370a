//! Replicated game session
//!
//! One [`GameSession`] per peer keeps players, session properties and the
//! shared random sequence identical on every peer of a game. All inbound
//! traffic enters through [`GameSession::handle_message`]; all outbound
//! traffic leaves through the session's [`Transport`].
//!
//! - [`session`]: the controller, player lifecycle, turns and input
//! - [`negotiation`]: joining and leaving peers
//! - [`persistence`]: save streams and `GameLoad`
//! - [`registry`]: the player arena and its active/inactive lists
//! - [`player`]: player entities and their wire records

pub mod config;
pub mod error;
pub mod event;
pub mod hooks;
pub mod negotiation;
pub mod persistence;
pub mod player;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::{GameStatus, Role, SessionConfig};
pub use error::{LoadError, LoadErrorKind, SessionError};
pub use event::{Observer, PropertyOwner, SessionEvent};
pub use hooks::{DefaultHooks, GameHooks};
pub use negotiation::NegotiationPhase;
pub use persistence::{SessionSnapshot, SESSION_SENTINEL};
pub use player::{Player, PlayerRecord, PlayerState, Replicable, PLAYER_SENTINEL};
pub use registry::{choose_deactivations, PlayerRegistry};
pub use session::{GameSession, GAME_STATUS, MAX_PLAYERS, MIN_PLAYERS};
pub use transport::{NullTransport, QueueTransport, Transport};
