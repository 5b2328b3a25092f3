//! Launch configuration for a Huddle session.
//!
//! The core only needs the fields listed here per agent; it does not try to
//! be a general configuration system. Loaded from TOML.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::channel::ChannelMode;
use crate::error::{Error, Result};

/// Top-level session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuddleConfig {
    /// Shared workspace directory; agents run with this as their cwd.
    pub workspace: PathBuf,
    /// Name of the shared coordination file inside the workspace.
    #[serde(default = "default_chat_file")]
    pub chat_file: String,
    /// Name of the plan file created empty at session start.
    #[serde(default = "default_plan_file")]
    pub plan_file: String,
    /// Close a piped agent's stdin after sending the initial prompt.
    #[serde(default = "default_true")]
    pub close_stdin_after_prompt: bool,
    /// Initial prompt; `{challenge}` and `{agent_names}` are substituted.
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
    pub agents: Vec<AgentSpec>,
}

/// One agent's launch spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Unique display name, also used for the side log file.
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Channel mode; inferred from the command when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelMode>,
}

impl AgentSpec {
    pub fn channel_mode(&self) -> ChannelMode {
        self.channel
            .unwrap_or_else(|| ChannelMode::infer(&self.command, &self.name))
    }
}

fn default_chat_file() -> String {
    "CHAT.md".to_string()
}

fn default_plan_file() -> String {
    "PLAN_FINAL.md".to_string()
}

fn default_true() -> bool {
    true
}

fn default_prompt_template() -> String {
    "\
We are tackling this challenge together: {challenge}

You are collaborating with these agents: {agent_names}.
Coordinate through the shared CHAT.md file in your working directory: read it
for messages from the others, and append your own as a complete line in the
form `[YourName]: message`. Never rewrite existing content. When the group
has agreed on a solution, write the final plan to PLAN_FINAL.md."
        .to_string()
}

impl HuddleConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: HuddleConfig =
            toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(Error::Config("at least one agent is required".into()));
        }
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate agent name '{}'",
                    agent.name
                )));
            }
        }
        Ok(())
    }

    /// Render the initial prompt for the given challenge.
    pub fn render_prompt(&self, challenge: &str) -> String {
        let agent_names = self
            .agents
            .iter()
            .map(|a| format!("\"{}\"", a.name))
            .collect::<Vec<_>>()
            .join(", ");
        self.prompt_template
            .replace("{challenge}", challenge)
            .replace("{agent_names}", &agent_names)
    }
}
