//! Error types for Huddle Core

use thiserror::Error;

/// Result type alias using the Huddle Error
pub type Result<T> = std::result::Result<T, Error>;

/// Huddle error types
///
/// Side-effect failures (side-log mirroring, chat appends from the hub's
/// relay path) are deliberately not represented here: they are logged and
/// swallowed at the point of failure and never interrupt the primary data
/// flow.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to launch agent '{agent}': {reason}")]
    Launch { agent: String, reason: String },

    #[error("Channel I/O error: {0}")]
    ChannelIo(String),

    #[error("File watcher error: {0}")]
    Watch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
