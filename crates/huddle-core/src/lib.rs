//! Huddle Core - process supervision and file-based agent coordination
//!
//! This crate provides the core functionality for the Huddle application:
//! - Per-agent duplex channels (standard pipes or a pseudo-terminal)
//! - Background, non-blocking capture of agent output into per-session queues
//! - Sanitization of raw terminal bytes into displayable lines
//! - A coordination protocol built on one shared append-only chat file
//! - A supervision hub that drains everything on a fixed cadence and feeds
//!   a single consumer
//!
//! Concurrency model: one OS reader thread per agent session, one watcher
//! thread for the coordination file, and a single cooperative hub task that
//! owns all consumer-visible state.

pub mod channel;
pub mod chat;
pub mod config;
pub mod error;
pub mod hub;
pub mod sanitize;
pub mod session;

pub use channel::{ChannelMode, OutputChunk};
pub use chat::ChatCoordinator;
pub use config::{AgentSpec, HuddleConfig};
pub use error::{Error, Result};
pub use hub::{DRAIN_INTERVAL, HubCommand, HubEvent, HubHandle, SupervisionHub};
pub use sanitize::sanitize_chunk;
pub use session::{AgentSession, SessionState};
