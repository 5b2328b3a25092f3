//! Huddle CLI - run a multi-agent session from a launch config.
//!
//! Thin consumer seat in front of huddle-core: boots the workspace, starts
//! every configured agent, prints sanitized agent output to stdout, and
//! forwards stdin lines into the shared chat file as the `User` speaker.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use huddle_core::hub::{DRAIN_INTERVAL, HubEvent, SupervisionHub};
use huddle_core::{ChatCoordinator, HuddleConfig};

#[derive(Parser)]
#[command(name = "huddle")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Supervise collaborating agent processes over a shared chat file", long_about = None)]
struct Cli {
    /// Launch configuration file
    #[arg(short, long, default_value = "huddle.toml")]
    config: PathBuf,

    /// Override the workspace directory from the config
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// The challenge handed to every agent in its initial prompt
    challenge: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Quiet by default so log lines do not tangle with agent output.
    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose {
            "info,huddle_core=debug"
        } else {
            "warn"
        })
        .init();

    let mut config = HuddleConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(workspace) = cli.workspace {
        config.workspace = workspace;
    }

    std::fs::create_dir_all(&config.workspace)
        .with_context(|| format!("creating workspace {}", config.workspace.display()))?;

    // The one truncation the chat file ever sees; the plan file starts empty
    // and belongs to the agents afterwards.
    let chat = ChatCoordinator::new(&config.workspace, &config.chat_file);
    chat.reset().context("resetting chat file")?;
    let chat_path = chat.path().to_path_buf();
    std::fs::write(config.workspace.join(&config.plan_file), "")
        .context("creating plan file")?;

    let (mut hub, handle, mut events) = SupervisionHub::new(chat, DRAIN_INTERVAL)?;

    let prompt = config.render_prompt(&cli.challenge);
    for spec in &config.agents {
        match hub.spawn_agent(spec, &config.workspace) {
            Ok(()) => {
                println!("* started {}", spec.name);
                handle.send_to_agent(&spec.name, &prompt, config.close_stdin_after_prompt);
            }
            Err(e) => eprintln!("* failed to start {}: {e}", spec.name),
        }
    }

    let hub_task = tokio::spawn(hub.run());

    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shutdown_sent = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(event, &chat_path),
                None => break,
            },
            line = stdin_lines.next_line(), if !shutdown_sent => match line {
                Ok(Some(text)) if !text.trim().is_empty() => {
                    handle.post_chat("User", text.trim());
                }
                Ok(Some(_)) => {}
                // stdin EOF or read error: wind the session down.
                _ => {
                    handle.shutdown();
                    shutdown_sent = true;
                }
            },
            _ = tokio::signal::ctrl_c(), if !shutdown_sent => {
                eprintln!("* shutting down");
                handle.shutdown();
                shutdown_sent = true;
            }
        }
    }

    hub_task.await.context("hub task panicked")?;
    Ok(())
}

fn print_event(event: HubEvent, chat_path: &Path) {
    match event {
        HubEvent::AgentLine { agent, line } => println!("[{agent}] {line}"),
        HubEvent::SessionEnded { agent, reason } => {
            println!("* {agent} ended: {reason}");
        }
        HubEvent::ChatChanged => {
            // Events coalesce, so re-read and show the newest message line.
            let content = std::fs::read_to_string(chat_path).unwrap_or_default();
            if let Some(last) = content.lines().rev().find(|l| !l.trim().is_empty()) {
                println!("[chat] {last}");
            }
        }
    }
}
