use crate::config::GameStatus;
use shared::{PlayerId, PropertyError, WireError};
use std::fmt;
use thiserror::Error;

/// Misuse of the session API
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0} is not registered")]
    UnknownPlayer(PlayerId),
    #[error("{0} is not active")]
    InactivePlayer(PlayerId),
    #[error("input is only accepted while the game runs (status is {0})")]
    NotRunning(GameStatus),
    #[error("{0} does not have the turn")]
    NotYourTurn(PlayerId),
    #[error("only the admin may {0}")]
    NotAdmin(&'static str),
    #[error(transparent)]
    Property(#[from] PropertyError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadErrorKind {
    /// The stream belongs to another application
    CookieMismatch,
    /// Truncated stream, bad sentinel or undecodable field
    Corrupt,
}

impl fmt::Display for LoadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadErrorKind::CookieMismatch => f.write_str("cookie mismatch"),
            LoadErrorKind::Corrupt => f.write_str("corrupt stream"),
        }
    }
}

/// Why a save stream was refused. Nothing is applied when this is returned.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct LoadError {
    pub kind: LoadErrorKind,
    pub message: String,
}

impl LoadError {
    pub fn new(kind: LoadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<WireError> for LoadError {
    fn from(e: WireError) -> Self {
        LoadError::new(LoadErrorKind::Corrupt, e.to_string())
    }
}
