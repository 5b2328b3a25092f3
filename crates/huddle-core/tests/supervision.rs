//! End-to-end supervision tests against real child processes.

#![cfg(unix)]

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use huddle_core::channel::ChannelMode;
use huddle_core::config::AgentSpec;
use huddle_core::hub::{HubEvent, SupervisionHub};
use huddle_core::sanitize::sanitize_chunk;
use huddle_core::session::{AgentSession, SessionState};
use huddle_core::{ChatCoordinator, Error};

fn spec(name: &str, command: &str, args: &[&str], mode: ChannelMode) -> AgentSpec {
    AgentSpec {
        name: name.to_string(),
        command: command.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        channel: Some(mode),
    }
}

/// Drain until a sanitized line containing `needle` shows up or the timeout
/// elapses; returns everything collected so far.
fn drain_until(session: &mut AgentSession, needle: &str, timeout: Duration) -> Vec<String> {
    let deadline = Instant::now() + timeout;
    let mut lines = Vec::new();
    loop {
        while let Some(chunk) = session.drain() {
            lines.extend(sanitize_chunk(&chunk.text));
        }
        if lines.iter().any(|l| l.contains(needle)) || Instant::now() >= deadline {
            return lines;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn wait_for_state(session: &AgentSession, want: SessionState, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if session.state() == want {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    session.state() == want
}

#[test]
fn pipe_echo_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = AgentSession::new(&spec("echoer", "cat", &[], ChannelMode::Pipe), dir.path());
    session.start().unwrap();
    assert_eq!(session.state(), SessionState::Running);

    session.send("ping", false);
    let lines = drain_until(&mut session, "ping", Duration::from_secs(5));
    assert!(lines.iter().any(|l| l == "ping"), "lines: {lines:?}");

    session.stop();
    assert_eq!(session.state(), SessionState::Terminated);
}

#[test]
fn close_after_ends_input_and_later_sends_fail_gracefully() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = AgentSession::new(&spec("once", "cat", &[], ChannelMode::Pipe), dir.path());
    session.start().unwrap();

    session.send("first", true);
    // cat saw EOF and exits; its last line is still captured.
    let lines = drain_until(&mut session, "first", Duration::from_secs(5));
    assert!(lines.iter().any(|l| l == "first"), "lines: {lines:?}");

    session.send("second", false);
    assert!(session.last_send_error().is_some());

    session.stop();
}

#[test]
fn pty_sends_never_close_the_channel() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = AgentSession::new(&spec("tty", "cat", &[], ChannelMode::Pty), dir.path());
    session.start().unwrap();

    session.send("one", true);
    session.send("two", true);

    // Both lines flow despite close_after; a pty echoes input as well, so we
    // just require both payloads to appear.
    let lines = drain_until(&mut session, "two", Duration::from_secs(5));
    assert!(lines.iter().any(|l| l.contains("one")), "lines: {lines:?}");
    assert!(lines.iter().any(|l| l.contains("two")), "lines: {lines:?}");
    assert!(session.last_send_error().is_none());

    session.stop();
    assert_eq!(session.state(), SessionState::Terminated);
}

#[test]
fn drain_order_matches_output_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = AgentSession::new(
        &spec("script", "sh", &["-c", "printf 'a\\nb\\nc\\n'"], ChannelMode::Pipe),
        dir.path(),
    );
    session.start().unwrap();

    assert!(
        wait_for_state(&session, SessionState::Terminated, Duration::from_secs(5)),
        "child did not finish, state: {:?}",
        session.state()
    );

    let first = session.drain().unwrap();
    let second = session.drain().unwrap();
    let third = session.drain().unwrap();
    assert_eq!(first.text, "a\n");
    assert_eq!(second.text, "b\n");
    assert_eq!(third.text, "c\n");
    assert!(first.seq < second.seq && second.seq < third.seq);
    assert!(session.drain().is_none(), "expected empty sentinel");

    session.stop();
}

#[test]
fn stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = AgentSession::new(&spec("twice", "cat", &[], ChannelMode::Pipe), dir.path());
    session.start().unwrap();

    session.stop();
    assert_eq!(session.state(), SessionState::Terminated);
    session.stop();
    assert_eq!(session.state(), SessionState::Terminated);
}

#[test]
fn stop_unblocks_the_reader_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = AgentSession::new(&spec("sleepy", "cat", &[], ChannelMode::Pipe), dir.path());
    session.start().unwrap();

    // stop() joins the reader thread, so returning is the proof.
    let started = Instant::now();
    session.stop();
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "stop took {:?}",
        started.elapsed()
    );
}

#[test]
fn launch_failure_is_surfaced_once_and_marks_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = AgentSession::new(
        &spec("ghost", "/nonexistent/agent-binary", &[], ChannelMode::Pipe),
        dir.path(),
    );

    let err = session.start().unwrap_err();
    assert!(matches!(err, Error::Launch { .. }), "got {err}");
    assert_eq!(session.state(), SessionState::Failed);
    assert!(session.fail_reason().is_some());
}

#[test]
fn side_log_mirrors_captured_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = AgentSession::new(&spec("logged", "cat", &[], ChannelMode::Pipe), dir.path());
    session.start().unwrap();

    session.send("mirror me", true);
    drain_until(&mut session, "mirror me", Duration::from_secs(5));
    session.stop();

    let log = std::fs::read_to_string(dir.path().join("logged.log")).unwrap();
    assert!(log.contains("mirror me"));
}

#[test]
fn exited_child_is_observed_as_terminated_with_output_intact() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = AgentSession::new(
        &spec("oneshot", "sh", &["-c", "echo done"], ChannelMode::Pipe),
        dir.path(),
    );
    session.start().unwrap();

    assert!(wait_for_state(
        &session,
        SessionState::Terminated,
        Duration::from_secs(5)
    ));
    // Output captured before the exit stays drainable.
    let lines = drain_until(&mut session, "done", Duration::from_secs(1));
    assert!(lines.iter().any(|l| l == "done"), "lines: {lines:?}");
}

#[test]
fn instantly_exiting_child_always_reaches_terminated() {
    // The reader can hit end of stream before start() returns; the session
    // must still settle in Terminated, not stick in Running. Repeat to give
    // the scheduler room to interleave unfavourably.
    for round in 0..20 {
        let dir = tempfile::tempdir().unwrap();
        let mut session = AgentSession::new(
            &spec("burst", "sh", &["-c", "printf 'x\\n'"], ChannelMode::Pipe),
            dir.path(),
        );
        session.start().unwrap();

        assert!(
            wait_for_state(&session, SessionState::Terminated, Duration::from_secs(5)),
            "round {round}: stuck in {:?}",
            session.state()
        );
        let lines = drain_until(&mut session, "x", Duration::from_secs(1));
        assert!(lines.iter().any(|l| l == "x"), "round {round}: {lines:?}");
    }
}

fn make_hub(workspace: &Path) -> (SupervisionHub, huddle_core::HubHandle, tokio::sync::mpsc::UnboundedReceiver<HubEvent>) {
    let chat = ChatCoordinator::new(workspace, "CHAT.md");
    chat.reset().unwrap();
    SupervisionHub::new(chat, Duration::from_millis(50)).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hub_forwards_lines_chat_changes_and_terminal_notices() {
    let dir = tempfile::tempdir().unwrap();
    let (mut hub, handle, mut events) = make_hub(dir.path());

    hub.spawn_agent(&spec("echoer", "cat", &[], ChannelMode::Pipe), dir.path())
        .unwrap();
    handle.send_to_agent("echoer", "ping", false);
    handle.post_chat("User", "hello team");

    let hub_task = tokio::spawn(hub.run());

    let mut saw_ping = false;
    let mut saw_chat = false;
    let mut saw_end = false;
    let mut shutdown_sent = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);

    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => panic!("timed out; ping={saw_ping} chat={saw_chat} end={saw_end}"),
        };
        match event {
            HubEvent::AgentLine { agent, line } => {
                assert_eq!(agent, "echoer");
                if line == "ping" {
                    saw_ping = true;
                }
            }
            HubEvent::ChatChanged => saw_chat = true,
            HubEvent::SessionEnded { agent, .. } => {
                assert_eq!(agent, "echoer");
                saw_end = true;
            }
        }
        if saw_ping && saw_chat && !shutdown_sent {
            handle.shutdown();
            shutdown_sent = true;
        }
    }

    assert!(saw_ping && saw_chat && saw_end);
    hub_task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hub_announces_launch_failure_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let (mut hub, handle, mut events) = make_hub(dir.path());

    let err = hub
        .spawn_agent(
            &spec("ghost", "/nonexistent/agent-binary", &[], ChannelMode::Pipe),
            dir.path(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Launch { .. }));

    let hub_task = tokio::spawn(hub.run());

    let mut ended = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut shutdown_sent = false;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(HubEvent::SessionEnded { agent, reason })) => {
                assert_eq!(agent, "ghost");
                assert!(!reason.is_empty());
                ended += 1;
                if !shutdown_sent {
                    // Leave the hub running a few more cycles to prove the
                    // notice is not repeated, then stop it.
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    handle.shutdown();
                    shutdown_sent = true;
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => panic!("no terminal notification within 5s"),
        }
    }

    assert_eq!(ended, 1);
    hub_task.await.unwrap();
}
