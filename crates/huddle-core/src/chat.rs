//! The shared coordination file.
//!
//! Agents and the human operator exchange plain-text messages by appending
//! to a single file in the workspace. Correctness rests on one invariant:
//! every writer appends a complete, newline-terminated message and nothing
//! ever truncates or rewrites the file after the one reset at session start.
//! With that invariant there is nothing to lock: a concurrent reader can see
//! the file at any prefix of appends but never half of a message.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Owns the coordination file path and, once watching, the change watcher.
pub struct ChatCoordinator {
    path: PathBuf,
    watcher: Option<RecommendedWatcher>,
}

impl ChatCoordinator {
    pub fn new(workspace: &Path, file_name: &str) -> Self {
        Self {
            path: workspace.join(file_name),
            watcher: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate the file to empty. Called exactly once, at session start;
    /// after this the file only ever grows.
    pub fn reset(&self) -> Result<()> {
        fs::write(&self.path, "")?;
        info!(path = %self.path.display(), "coordination file reset");
        Ok(())
    }

    /// Append one message, flushed before returning.
    ///
    /// The leading newline keeps a message visually separate even if an
    /// external writer left the file without a trailing terminator.
    pub fn append(&self, speaker: &str, text: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(format!("\n[{speaker}]: {text}\n").as_bytes())?;
        file.flush()?;
        debug!(speaker = %speaker, "appended chat message");
        Ok(())
    }

    /// Read the whole current content; empty if the file does not exist yet.
    pub fn content(&self) -> String {
        fs::read_to_string(&self.path).unwrap_or_default()
    }

    /// Start a background watcher on the file's directory.
    ///
    /// Each detected modification sends one unit notification into `tx`. The
    /// watcher never hands content across: rapid writes coalesce into fewer
    /// events, so the consumer performs a fresh [`content`](Self::content)
    /// read per notification.
    pub fn watch(&mut self, tx: UnboundedSender<()>) -> Result<()> {
        let file_name: OsString = self
            .path
            .file_name()
            .ok_or_else(|| Error::Watch("coordination path has no file name".into()))?
            .to_os_string();
        let dir = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                let Ok(event) = res else { return };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                if event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()))
                {
                    let _ = tx.send(());
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::Watch(e.to_string()))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Watch(e.to_string()))?;
        info!(path = %self.path.display(), "watching coordination file");

        self.watcher = Some(watcher);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn append_then_content_round_trips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let chat = ChatCoordinator::new(dir.path(), "CHAT.md");
        chat.reset().unwrap();

        chat.append("X", "hello").unwrap();
        chat.append("Y", "world").unwrap();

        let content = chat.content();
        let x = content.find("\n[X]: hello\n").expect("first message");
        let y = content.find("\n[Y]: world\n").expect("second message");
        assert!(x < y, "messages out of append order");
    }

    #[test]
    fn content_of_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let chat = ChatCoordinator::new(dir.path(), "CHAT.md");
        assert_eq!(chat.content(), "");
    }

    #[test]
    fn reset_truncates_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let chat = ChatCoordinator::new(dir.path(), "CHAT.md");
        chat.append("X", "stale").unwrap();
        chat.reset().unwrap();
        assert_eq!(chat.content(), "");
    }

    #[test]
    fn append_creates_the_file_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let chat = ChatCoordinator::new(dir.path(), "CHAT.md");
        chat.append("X", "first").unwrap();
        assert!(chat.content().contains("[X]: first"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watcher_notifies_on_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut chat = ChatCoordinator::new(dir.path(), "CHAT.md");
        chat.reset().unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        chat.watch(tx).unwrap();

        chat.append("X", "ping").unwrap();

        let notified = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(notified.is_ok(), "no change notification within 5s");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watcher_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut chat = ChatCoordinator::new(dir.path(), "CHAT.md");
        chat.reset().unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        chat.watch(tx).unwrap();

        std::fs::write(dir.path().join("unrelated.log"), "noise").unwrap();

        let notified = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(notified.is_err(), "unrelated file triggered a notification");
    }
}
