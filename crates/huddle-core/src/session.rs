//! Per-agent process supervision.
//!
//! An [`AgentSession`] owns one external process end to end: the duplex
//! channel, the single background reader thread that captures output into
//! the session's queue, and termination. Everything the reader learns
//! crosses back to the owner as queued chunks or a state transition; no
//! panic or error is allowed to escape the thread.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{
    ChannelMode, ChannelReader, ChannelWriter, ChildHandle, OutputChunk, OutputQueue,
    PTY_CHUNK_SIZE, QueueProducer, open_channel,
};
use crate::config::AgentSpec;
use crate::error::{Error, Result};

/// Grace period between requesting termination and killing the child.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// POSIX EIO. On Linux a read on a terminal master fails with this once the
/// slave side is gone, so it doubles as the pty end-of-stream signal.
const EIO: i32 = 5;

/// Session lifecycle.
///
/// `NotStarted → Starting → Running → (Stopping →) Terminated`, with
/// `Starting | Running → Failed` on launch or channel errors. A child that
/// exits on its own moves the session straight to `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::NotStarted,
            1 => SessionState::Starting,
            2 => SessionState::Running,
            3 => SessionState::Stopping,
            4 => SessionState::Terminated,
            _ => SessionState::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionState::NotStarted => 0,
            SessionState::Starting => 1,
            SessionState::Running => 2,
            SessionState::Stopping => 3,
            SessionState::Terminated => 4,
            SessionState::Failed => 5,
        }
    }
}

/// State shared between the owning session and its reader thread.
struct SharedState {
    state: AtomicU8,
    fail_reason: Mutex<Option<String>>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::NotStarted.as_u8()),
            fail_reason: Mutex::new(None),
        }
    }

    fn load(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn store(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn fail(&self, reason: String) {
        *self.fail_reason.lock() = Some(reason);
        self.store(SessionState::Failed);
    }

    /// Running → Terminated, for a child that ended on its own. A session
    /// already Stopping or Failed keeps its state.
    fn mark_exited_if_running(&self) {
        let _ = self.state.compare_exchange(
            SessionState::Running.as_u8(),
            SessionState::Terminated.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// One supervised external process.
pub struct AgentSession {
    name: String,
    command: String,
    args: Vec<String>,
    mode: ChannelMode,
    workspace: PathBuf,
    shared: Arc<SharedState>,
    child: Option<ChildHandle>,
    writer: Option<ChannelWriter>,
    queue: Option<OutputQueue>,
    reader: Option<JoinHandle<()>>,
    last_send_error: Option<String>,
}

impl AgentSession {
    pub fn new(spec: &AgentSpec, workspace: &Path) -> Self {
        Self {
            name: spec.name.clone(),
            command: spec.command.clone(),
            args: spec.args.clone(),
            mode: spec.channel_mode(),
            workspace: workspace.to_path_buf(),
            shared: Arc::new(SharedState::new()),
            child: None,
            writer: None,
            queue: None,
            reader: None,
            last_send_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn state(&self) -> SessionState {
        self.shared.load()
    }

    /// Reason for the Failed state, when there is one.
    pub fn fail_reason(&self) -> Option<String> {
        self.shared.fail_reason.lock().clone()
    }

    /// Most recent swallowed send failure, if any.
    pub fn last_send_error(&self) -> Option<&str> {
        self.last_send_error.as_deref()
    }

    /// Launch the child and start the background reader.
    ///
    /// A launch failure moves the session to Failed and is surfaced to the
    /// caller; it is never retried here.
    pub fn start(&mut self) -> Result<()> {
        if self.shared.load() != SessionState::NotStarted {
            return Err(Error::Launch {
                agent: self.name.clone(),
                reason: "session was already started".into(),
            });
        }
        self.shared.store(SessionState::Starting);

        let side_log = self.open_side_log();
        // In pipe mode the child's stderr goes straight into the side log;
        // the reader thread owns stdout alone.
        let stderr_sink = side_log.as_ref().and_then(|f| f.try_clone().ok());

        let (channel, source) =
            match open_channel(self.mode, &self.command, &self.args, &self.workspace, stderr_sink) {
                Ok(opened) => opened,
                Err(e) => {
                    let reason = e.to_string();
                    self.shared.fail(reason.clone());
                    return Err(Error::Launch {
                        agent: self.name.clone(),
                        reason,
                    });
                }
            };

        let (producer, queue) = OutputQueue::channel();

        // Running must be visible before the reader exists: a fast-exiting
        // child lets the reader hit end of stream immediately, and its
        // Running -> Terminated transition has to find the state in place.
        self.shared.store(SessionState::Running);

        let shared = Arc::clone(&self.shared);
        let name = self.name.clone();
        let reader = std::thread::Builder::new()
            .name(format!("huddle-reader-{name}"))
            .spawn(move || run_reader(source, producer, shared, side_log, name))
            .map_err(|e| {
                let reason = format!("failed to spawn reader thread: {e}");
                self.shared.fail(reason.clone());
                Error::Launch {
                    agent: self.name.clone(),
                    reason,
                }
            })?;

        self.child = Some(channel.child);
        self.writer = Some(channel.writer);
        self.queue = Some(queue);
        self.reader = Some(reader);
        info!(agent = %self.name, mode = ?self.mode, "agent session started");
        Ok(())
    }

    /// Write one line to the child.
    ///
    /// Never raises: the caller sits on a UI-critical path, so failures are
    /// recorded internally and logged instead. `close_after` closes the
    /// write side in pipe mode only; a pseudo-terminal stays open.
    pub fn send(&mut self, text: &str, close_after: bool) {
        let Some(writer) = self.writer.as_mut() else {
            self.record_send_error("channel is not open");
            return;
        };
        match writer.send_line(text) {
            Ok(()) => {
                if close_after && self.mode == ChannelMode::Pipe {
                    writer.close();
                    debug!(agent = %self.name, "closed write side after send");
                }
            }
            Err(e) => {
                let reason = e.to_string();
                self.record_send_error(&reason);
            }
        }
    }

    fn record_send_error(&mut self, reason: &str) {
        warn!(agent = %self.name, reason = %reason, "send to agent failed");
        self.last_send_error = Some(reason.to_string());
    }

    /// Remove and return the oldest pending output chunk, without blocking.
    pub fn drain(&mut self) -> Option<OutputChunk> {
        self.queue.as_ref().and_then(|q| q.pop())
    }

    /// Stop the session: request graceful termination, escalate to a kill
    /// after the grace period, close the channel, join the reader.
    ///
    /// Idempotent; stopping an already-Terminated session is a no-op.
    pub fn stop(&mut self) {
        if self.shared.load() == SessionState::Terminated {
            return;
        }
        self.shared.store(SessionState::Stopping);
        info!(agent = %self.name, "stopping agent session");

        // Graceful request: end-of-input for pipes, hangup for terminals.
        if let Some(writer) = self.writer.as_mut() {
            writer.close();
        }
        self.writer = None;
        if let Some(child) = self.child.as_mut() {
            child.release_channel();
        }

        if let Some(mut child) = self.child.take() {
            match child.wait_timeout(STOP_GRACE) {
                Ok(true) => debug!(agent = %self.name, "child exited within grace period"),
                Ok(false) => {
                    warn!(agent = %self.name, "child ignored termination request, killing");
                    if let Err(e) = child.kill() {
                        warn!(agent = %self.name, error = %e, "kill failed");
                    }
                    child.wait();
                }
                Err(e) => {
                    warn!(agent = %self.name, error = %e, "wait failed, killing");
                    let _ = child.kill();
                    child.wait();
                }
            }
        }

        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!(agent = %self.name, "reader thread panicked");
            }
        }

        self.shared.store(SessionState::Terminated);
        info!(agent = %self.name, "agent session terminated");
    }

    /// Best-effort per-session output mirror, `<name>.log` in the workspace.
    fn open_side_log(&self) -> Option<File> {
        let path = self.workspace.join(format!("{}.log", self.name));
        match File::options().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(agent = %self.name, error = %e, "side log unavailable");
                None
            }
        }
    }
}

/// Body of the per-session reader thread.
fn run_reader(
    source: ChannelReader,
    mut producer: QueueProducer,
    shared: Arc<SharedState>,
    mut side_log: Option<File>,
    name: String,
) {
    let result = match source {
        ChannelReader::Pipe(stdout) => read_pipe_lines(stdout, &mut producer, &mut side_log),
        ChannelReader::Pty(reader) => read_pty_stream(reader, &mut producer, &mut side_log),
    };

    match result {
        Ok(()) => {
            debug!(agent = %name, "reader reached end of stream");
            shared.mark_exited_if_running();
        }
        Err(e) => match shared.load() {
            SessionState::Stopping | SessionState::Terminated => {
                debug!(agent = %name, error = %e, "read error during shutdown");
            }
            _ => {
                warn!(agent = %name, error = %e, "channel read failed");
                shared.fail(format!("output read failed: {e}"));
            }
        },
    }
}

/// Line-oriented capture for piped children. A trailing fragment without a
/// terminator still becomes a chunk; a zero-length read is end of stream.
fn read_pipe_lines(
    stdout: std::process::ChildStdout,
    producer: &mut QueueProducer,
    side_log: &mut Option<File>,
) -> io::Result<()> {
    let mut reader = BufReader::new(stdout);
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        mirror_chunk(side_log, &text);
        if !producer.push(text) {
            // Consumer went away; nothing left to capture for.
            return Ok(());
        }
    }
}

/// Bulk capture for pseudo-terminal children, decoded permissively.
fn read_pty_stream(
    mut reader: Box<dyn Read + Send>,
    producer: &mut QueueProducer,
    side_log: &mut Option<File>,
) -> io::Result<()> {
    let mut buf = [0u8; PTY_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                mirror_chunk(side_log, &text);
                if !producer.push(text) {
                    return Ok(());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.raw_os_error() == Some(EIO) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Append a captured chunk to the side log. Failure disables the mirror for
/// the rest of the session but never disturbs capture itself.
fn mirror_chunk(side_log: &mut Option<File>, text: &str) {
    if let Some(file) = side_log {
        let outcome = file.write_all(text.as_bytes()).and_then(|()| file.flush());
        if let Err(e) = outcome {
            warn!(error = %e, "side log write failed, disabling mirror");
            *side_log = None;
        }
    }
}
