//! Session configuration and the small enums describing session state

use serde::{Deserialize, Serialize};
use shared::Policy;
use std::fmt;

/// Knobs a session is created with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Application identity; peers with different cookies refuse each other
    pub cookie: i32,
    /// Default policy for session properties and session-created players
    pub policy: Policy,
    /// Negative means unlimited
    pub max_players: i32,
    pub min_players: u32,
    /// Initial seed of the shared random sequence
    pub seed: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie: 42,
            policy: Policy::Clean,
            max_players: -1,
            min_players: 0,
            seed: 0,
        }
    }
}

/// A session is admin until it connects to a remote admin
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Admin,
    Client,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameStatus {
    #[default]
    Init,
    Run,
    Pause,
    End,
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GameStatus::Init => "init",
            GameStatus::Run => "run",
            GameStatus::Pause => "pause",
            GameStatus::End => "end",
        };
        f.write_str(name)
    }
}
