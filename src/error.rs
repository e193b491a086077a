//! Error kinds for the server (§7), following the teacher's plain-enum
//! `RoomError` pattern in `sharify/room.rs` rather than a `thiserror` derive
//! the teacher has no other use for.

use std::fmt;

/// The five error kinds spec.md's error design calls out, collapsed into one
/// enum so every public operation can return a single `Result<T, ServerError>`.
#[derive(Debug)]
pub enum ServerError {
    /// Stream closed or timed out.
    Transport(String),
    /// Malformed frame, missing required field, or unknown tag.
    Protocol(String),
    /// Duplicate username, user not in room, ignore-token mismatch.
    Semantic(String),
    /// Write to a closed handle.
    Resource(String),
    /// Listener failed to bind.
    Configuration(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Transport(msg) => write!(f, "transport error: {msg}"),
            ServerError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            ServerError::Semantic(msg) => write!(f, "semantic error: {msg}"),
            ServerError::Resource(msg) => write!(f, "resource error: {msg}"),
            ServerError::Configuration(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
