//! # Peer
//!
//! Runs a replicated game session over TCP. One peer hosts the game: its
//! node is the admin and runs the message server every other peer connects
//! to. Clients join through the session's setup handshake and keep a full
//! mirror of the game afterwards.
//!
//! ## Message server
//!
//! The network is a star. The hub on the admin's node assigns peer ids
//! (the admin is always `1`, clients start at `2`) and routes envelopes:
//! broadcasts and player-addressed messages go to every peer, the sender
//! included, anything else goes to the one peer it names. Because all
//! traffic passes the hub in one order, every session applies the same
//! changes in the same sequence.
//!
//! ## Tasks
//!
//! - **Node loop**: owns the session, feeds it network events and routes its
//!   outgoing envelopes
//! - **Accept loop**: reports new connections on the admin's listener
//! - **Connection reader/writer**: move length-prefixed frames between a
//!   socket and the node loop
//!
//! The session itself is synchronous and never shared between tasks.
//!
//! ## Modules
//!
//! - [`framing`]: length-prefixed frames and envelope encoding
//! - [`hub`]: message server, connection tasks, network events
//! - [`node`]: the node loop
//! - [`transport`]: channel-backed session transport

pub mod framing;
pub mod hub;
pub mod node;
pub mod transport;

pub use hub::{Hub, NetworkEvent};
pub use node::Node;
pub use transport::{ChannelTransport, Outbound};
