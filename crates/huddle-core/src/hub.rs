//! The supervision hub.
//!
//! One cooperative task owns every agent session and the chat coordinator.
//! It drains all output queues on a fixed cadence, sanitizes the chunks and
//! forwards the lines to the consumer, relays coordination-file changes, and
//! applies inbound commands. Consumer-visible state is only ever touched
//! from this task; the blocking work all lives on the sessions' reader
//! threads and the watcher thread.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::chat::ChatCoordinator;
use crate::config::AgentSpec;
use crate::error::Result;
use crate::sanitize::sanitize_chunk;
use crate::session::{AgentSession, SessionState};

/// Default drain cadence.
pub const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// Events forwarded to the consumer.
///
/// Lines from one session arrive in that session's output order; across
/// sessions, and between session output and chat changes, ordering is
/// deliberately unspecified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// One sanitized display line from an agent.
    AgentLine { agent: String, line: String },
    /// Terminal notification, emitted exactly once per session.
    SessionEnded { agent: String, reason: String },
    /// The coordination file changed; re-read it for content.
    ChatChanged,
}

/// Commands accepted from the consumer.
#[derive(Debug, Clone)]
pub enum HubCommand {
    SendToAgent {
        agent: String,
        text: String,
        close_after: bool,
    },
    PostChat {
        speaker: String,
        text: String,
    },
    StopAgent {
        agent: String,
    },
    Shutdown,
}

/// Cheap cloneable handle for feeding commands to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    cmd_tx: UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn send_to_agent(&self, agent: &str, text: &str, close_after: bool) {
        let _ = self.cmd_tx.send(HubCommand::SendToAgent {
            agent: agent.to_string(),
            text: text.to_string(),
            close_after,
        });
    }

    pub fn post_chat(&self, speaker: &str, text: &str) {
        let _ = self.cmd_tx.send(HubCommand::PostChat {
            speaker: speaker.to_string(),
            text: text.to_string(),
        });
    }

    pub fn stop_agent(&self, agent: &str) {
        let _ = self.cmd_tx.send(HubCommand::StopAgent {
            agent: agent.to_string(),
        });
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(HubCommand::Shutdown);
    }
}

/// Owns the session collection and the chat coordinator.
pub struct SupervisionHub {
    sessions: Vec<AgentSession>,
    chat: ChatCoordinator,
    event_tx: UnboundedSender<HubEvent>,
    cmd_rx: UnboundedReceiver<HubCommand>,
    chat_rx: UnboundedReceiver<()>,
    announced: HashSet<String>,
    interval: Duration,
}

impl SupervisionHub {
    /// Build a hub around a coordinator and start its file watcher.
    ///
    /// Returns the hub itself (to be driven by [`run`](Self::run)), a
    /// command handle, and the consumer's event stream.
    pub fn new(
        mut chat: ChatCoordinator,
        interval: Duration,
    ) -> Result<(Self, HubHandle, UnboundedReceiver<HubEvent>)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (chat_tx, chat_rx) = mpsc::unbounded_channel();
        chat.watch(chat_tx)?;

        let hub = Self {
            sessions: Vec::new(),
            chat,
            event_tx,
            cmd_rx,
            chat_rx,
            announced: HashSet::new(),
            interval,
        };
        Ok((hub, HubHandle { cmd_tx }, event_rx))
    }

    /// Create and start a session for `spec`.
    ///
    /// On launch failure the error is returned to the caller and the failed
    /// session is still registered, so the consumer receives its terminal
    /// notification through the normal path.
    pub fn spawn_agent(&mut self, spec: &AgentSpec, workspace: &Path) -> Result<()> {
        let mut session = AgentSession::new(spec, workspace);
        let result = session.start();
        self.sessions.push(session);
        result
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.name().to_string()).collect()
    }

    /// Drive the hub until shutdown. The only suspension points are the
    /// drain-cycle timer and the two inbound channels; the hub itself never
    /// performs a blocking read.
    pub async fn run(mut self) {
        info!(agents = self.sessions.len(), "supervision hub running");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.drain_cycle(),
                Some(()) = self.chat_rx.recv() => {
                    let _ = self.event_tx.send(HubEvent::ChatChanged);
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(HubCommand::Shutdown) | None => {
                        self.shutdown();
                        return;
                    }
                    Some(cmd) => self.handle_command(cmd),
                },
            }
        }
    }

    /// One pass over every session: drain to empty, sanitize, forward, and
    /// announce terminal transitions.
    fn drain_cycle(&mut self) {
        for session in &mut self.sessions {
            while let Some(chunk) = session.drain() {
                for line in sanitize_chunk(&chunk.text) {
                    let _ = self.event_tx.send(HubEvent::AgentLine {
                        agent: session.name().to_string(),
                        line,
                    });
                }
            }

            let state = session.state();
            if matches!(state, SessionState::Failed | SessionState::Terminated)
                && !self.announced.contains(session.name())
            {
                self.announced.insert(session.name().to_string());
                let reason = match state {
                    SessionState::Failed => session
                        .fail_reason()
                        .unwrap_or_else(|| "unknown failure".to_string()),
                    _ => "process exited".to_string(),
                };
                let _ = self.event_tx.send(HubEvent::SessionEnded {
                    agent: session.name().to_string(),
                    reason,
                });
            }
        }
    }

    fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::SendToAgent {
                agent,
                text,
                close_after,
            } => match self.sessions.iter_mut().find(|s| s.name() == agent) {
                Some(session) => session.send(&text, close_after),
                None => warn!(agent = %agent, "send to unknown agent dropped"),
            },
            HubCommand::PostChat { speaker, text } => {
                // Append failures on the relay path are side effects: logged,
                // never propagated.
                if let Err(e) = self.chat.append(&speaker, &text) {
                    warn!(error = %e, "chat append failed");
                }
            }
            HubCommand::StopAgent { agent } => {
                match self.sessions.iter_mut().find(|s| s.name() == agent) {
                    Some(session) => tokio::task::block_in_place(|| session.stop()),
                    None => warn!(agent = %agent, "stop for unknown agent dropped"),
                }
            }
            HubCommand::Shutdown => unreachable!("handled in run()"),
        }
    }

    /// Stop every session, then flush remaining output and terminal
    /// notifications before the event stream closes.
    fn shutdown(&mut self) {
        info!("supervision hub shutting down");
        for session in &mut self.sessions {
            tokio::task::block_in_place(|| session.stop());
        }
        self.drain_cycle();
        debug!("supervision hub stopped");
    }
}
