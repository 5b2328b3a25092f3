//! Child process channels.
//!
//! A channel is the duplex communication path between the supervisor and one
//! child process: either a standard pipe pair (stdin/stdout) or a
//! pseudo-terminal master descriptor. Both are opened here and handed to the
//! owning session behind one uniform [`Channel`] value, so the mode split
//! stays in this module instead of branching through every call site.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use serde::{Deserialize, Serialize};
use tracing::debug;
use wait_timeout::ChildExt;

use crate::error::{Error, Result};

/// Bulk read size for pseudo-terminal output.
pub const PTY_CHUNK_SIZE: usize = 1024;

/// How a child process is wired to its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    /// Standard stdin/stdout pipes. Line-oriented output.
    Pipe,
    /// Pseudo-terminal. Required for TUI-style CLIs that refuse to emit
    /// output without a terminal on the other end.
    Pty,
}

impl ChannelMode {
    /// Pick a mode for an agent that did not configure one explicitly.
    ///
    /// Known TUI CLIs get a pseudo-terminal, everything else gets pipes.
    pub fn infer(command: &str, name: &str) -> Self {
        let base = command
            .rsplit('/')
            .next()
            .unwrap_or(command)
            .to_ascii_lowercase();
        if base == "claude" || name.eq_ignore_ascii_case("claude") {
            ChannelMode::Pty
        } else {
            ChannelMode::Pipe
        }
    }
}

/// One fragment of captured output, in per-session receipt order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Monotonic per session, assigned at enqueue time.
    pub seq: u64,
    pub text: String,
}

/// Producer half of a session's output queue. Owned by the reader thread.
pub struct QueueProducer {
    tx: Sender<OutputChunk>,
    next_seq: u64,
}

impl QueueProducer {
    /// Enqueue a chunk. Returns false once the consumer is gone.
    pub fn push(&mut self, text: String) -> bool {
        let chunk = OutputChunk {
            seq: self.next_seq,
            text,
        };
        self.next_seq += 1;
        self.tx.send(chunk).is_ok()
    }
}

/// Consumer half of a session's output queue.
///
/// Single producer (the reader thread), single consumer (the drain cycle);
/// the underlying mpsc channel keeps enqueue order and `pop` never blocks.
/// Chunks already enqueued stay available after the producer exits.
pub struct OutputQueue {
    rx: Receiver<OutputChunk>,
}

impl OutputQueue {
    pub fn channel() -> (QueueProducer, OutputQueue) {
        let (tx, rx) = mpsc::channel();
        (QueueProducer { tx, next_seq: 0 }, OutputQueue { rx })
    }

    /// Remove and return the oldest pending chunk, or `None` if the queue is
    /// currently empty.
    pub fn pop(&self) -> Option<OutputChunk> {
        self.rx.try_recv().ok()
    }
}

/// Write side of a channel.
pub enum ChannelWriter {
    /// `None` once the write side has been closed.
    Pipe(Option<std::process::ChildStdin>),
    Pty(Box<dyn Write + Send>),
}

impl ChannelWriter {
    /// Write `text` followed by a line terminator and flush.
    pub fn send_line(&mut self, text: &str) -> io::Result<()> {
        match self {
            ChannelWriter::Pipe(Some(stdin)) => {
                stdin.write_all(text.as_bytes())?;
                stdin.write_all(b"\n")?;
                stdin.flush()
            }
            ChannelWriter::Pipe(None) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write side already closed",
            )),
            ChannelWriter::Pty(writer) => {
                writer.write_all(text.as_bytes())?;
                writer.write_all(b"\n")?;
                writer.flush()
            }
        }
    }

    /// Close the write side, signalling end-of-input to a piped child.
    ///
    /// A pseudo-terminal write side is never closed this way: interactive
    /// programs keep reading from the terminal for their whole lifetime.
    pub fn close(&mut self) {
        if let ChannelWriter::Pipe(stdin) = self {
            *stdin = None;
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelWriter::Pipe(None))
    }
}

/// Read side of a channel, consumed by the session's reader thread.
pub enum ChannelReader {
    Pipe(std::process::ChildStdout),
    Pty(Box<dyn Read + Send>),
}

/// Handle on the child process itself, uniform across modes.
pub enum ChildHandle {
    Pipe(std::process::Child),
    Pty {
        child: Box<dyn portable_pty::Child + Send + Sync>,
        /// Kept alive so the terminal stays open; dropped on stop to hang up
        /// on the child and unblock the reader.
        master: Option<Box<dyn portable_pty::MasterPty + Send>>,
    },
}

impl ChildHandle {
    /// Drop the OS-level channel resources without touching the process.
    ///
    /// For a pseudo-terminal this closes the master descriptor, which
    /// delivers a hangup to the child and makes any blocked read on the
    /// reader thread return.
    pub fn release_channel(&mut self) {
        if let ChildHandle::Pty { master, .. } = self {
            *master = None;
        }
    }

    /// Wait up to `grace` for the child to exit. Returns true if it did.
    pub fn wait_timeout(&mut self, grace: Duration) -> io::Result<bool> {
        match self {
            ChildHandle::Pipe(child) => Ok(child.wait_timeout(grace)?.is_some()),
            ChildHandle::Pty { child, .. } => {
                let deadline = Instant::now() + grace;
                loop {
                    if child.try_wait()?.is_some() {
                        return Ok(true);
                    }
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    pub fn kill(&mut self) -> io::Result<()> {
        match self {
            ChildHandle::Pipe(child) => child.kill(),
            ChildHandle::Pty { child, .. } => child.kill(),
        }
    }

    /// Reap the child. Exit codes carry no meaning beyond "exited".
    pub fn wait(&mut self) {
        match self {
            ChildHandle::Pipe(child) => {
                let _ = child.wait();
            }
            ChildHandle::Pty { child, .. } => {
                let _ = child.wait();
            }
        }
    }
}

/// An open duplex channel: the child bound to it plus the write side. The
/// read side is returned separately so it can move onto the reader thread.
pub struct Channel {
    pub(crate) child: ChildHandle,
    pub(crate) writer: ChannelWriter,
}

/// Launch `command` in `workspace`, wired per `mode`.
///
/// In pipe mode stderr is routed into `stderr_sink` (the session's side log)
/// when one is available, since the display stream owns stdout alone. In
/// pseudo-terminal mode everything flows through the master descriptor and
/// the sink is unused.
pub fn open_channel(
    mode: ChannelMode,
    command: &str,
    args: &[String],
    workspace: &Path,
    stderr_sink: Option<File>,
) -> Result<(Channel, ChannelReader)> {
    match mode {
        ChannelMode::Pipe => {
            let mut cmd = Command::new(command);
            cmd.args(args)
                .current_dir(workspace)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped());
            match stderr_sink {
                Some(file) => {
                    cmd.stderr(Stdio::from(file));
                }
                None => {
                    cmd.stderr(Stdio::null());
                }
            }

            debug!(command = %command, "spawning piped child");
            let mut child = cmd.spawn()?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| Error::ChannelIo("child stdin was not piped".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| Error::ChannelIo("child stdout was not piped".into()))?;

            Ok((
                Channel {
                    child: ChildHandle::Pipe(child),
                    writer: ChannelWriter::Pipe(Some(stdin)),
                },
                ChannelReader::Pipe(stdout),
            ))
        }
        ChannelMode::Pty => {
            let pty_system = native_pty_system();
            let pair = pty_system
                .openpty(PtySize {
                    rows: 24,
                    cols: 80,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| Error::ChannelIo(e.to_string()))?;

            let mut builder = CommandBuilder::new(command);
            for arg in args {
                builder.arg(arg);
            }
            builder.cwd(workspace);
            builder.env("TERM", "xterm-256color");

            debug!(command = %command, "spawning child on pseudo-terminal");
            let child = pair
                .slave
                .spawn_command(builder)
                .map_err(|e| Error::ChannelIo(e.to_string()))?;
            // The parent must not keep the slave end open.
            drop(pair.slave);

            let reader = pair
                .master
                .try_clone_reader()
                .map_err(|e| Error::ChannelIo(e.to_string()))?;
            let writer = pair
                .master
                .take_writer()
                .map_err(|e| Error::ChannelIo(e.to_string()))?;

            Ok((
                Channel {
                    child: ChildHandle::Pty {
                        child,
                        master: Some(pair.master),
                    },
                    writer: ChannelWriter::Pty(writer),
                },
                ChannelReader::Pty(reader),
            ))
        }
    }
}
