//! Thin wrappers over the tmux CLI used by the worker runtime.
//!
//! Each worker runs in its own detached session; liveness and exit status are
//! read back from pane metadata.

use std::path::Path;
use std::process::Command;

use tracing::{debug, trace, warn};

use crate::util::{sanitize_name, shell_escape};
use crate::{Error, Result};

/// Prefix of every session baton creates.
pub const SESSION_PREFIX: &str = "baton_";

/// Exit state of a pane whose command has finished (`remain-on-exit` keeps it around).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneState {
    Running,
    Exited(i32),
}

pub struct Tmux;

impl Tmux {
    pub fn create_session(name: &str, cwd: &Path, cmd: &[String]) -> Result<()> {
        if cmd.is_empty() {
            return Err(Error::Validation("Command cannot be empty".to_string()));
        }

        let cmd_str = cmd
            .iter()
            .map(|s| shell_escape(s))
            .collect::<Vec<_>>()
            .join(" ");
        debug!(session = name, cwd = %cwd.display(), "creating tmux session");
        trace!(cmd = %cmd_str, "tmux command line");
        let output = Command::new("tmux")
            .args([
                "new-session",
                "-d",
                "-s",
                name,
                "-c",
                &cwd.display().to_string(),
                &cmd_str,
            ])
            .output()?;

        if !output.status.success() {
            let err = format!(
                "Failed to create session '{}': {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            warn!(session = name, "tmux create_session failed");
            return Err(Error::Tmux(err));
        }

        // Keep the pane after the command exits so its exit status can be read.
        let _ = Command::new("tmux")
            .args(["set-option", "-t", name, "remain-on-exit", "on"])
            .output();

        debug!(session = name, "tmux session created");
        Ok(())
    }

    pub fn kill_session(name: &str) -> Result<()> {
        let output = Command::new("tmux")
            .args(["kill-session", "-t", name])
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("session not found") && !stderr.contains("can't find session") {
                warn!(session = name, stderr = %stderr.trim(), "failed to kill tmux session");
                return Err(Error::Tmux(format!(
                    "Failed to kill session '{}': {}",
                    name, stderr
                )));
            }
            debug!(session = name, "tmux session already gone");
        } else {
            debug!(session = name, "tmux session killed");
        }
        Ok(())
    }

    pub fn session_exists(name: &str) -> bool {
        Command::new("tmux")
            .args(["has-session", "-t", name])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn send_keys_enter(name: &str, keys: &str) -> Result<()> {
        debug!(session = name, "sending keys");
        let output = Command::new("tmux")
            .args(["send-keys", "-t", name, keys, "Enter"])
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(session = name, stderr = %stderr.trim(), "failed to send keys");
            return Err(Error::Tmux(format!(
                "Failed to send keys to '{}': {}",
                name, stderr
            )));
        }
        Ok(())
    }

    /// Unix timestamp of the last output in the session's window.
    pub fn pane_activity(name: &str) -> Result<i64> {
        let value = Self::display(name, "#{window_activity}")?;
        value
            .parse::<i64>()
            .map_err(|_| Error::Tmux(format!("Invalid window activity timestamp: {}", value)))
    }

    pub fn pane_state(name: &str) -> Result<PaneState> {
        let value = Self::display(name, "#{pane_dead} #{pane_dead_status}")?;
        Ok(parse_pane_state(&value))
    }

    fn display(name: &str, format: &str) -> Result<String> {
        let output = Command::new("tmux")
            .args(["display-message", "-t", name, "-p", format])
            .output()?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to query '{}' for '{}': {}",
                format,
                name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn is_available() -> bool {
        which::which("tmux").is_ok()
    }

    /// `baton_<slug>_<task>_<suffix>`; tmux treats `.` and `:` as target separators.
    pub fn session_name(slug: &str, task: &str, suffix: &str) -> String {
        format!(
            "{}{}_{}_{}",
            SESSION_PREFIX,
            sanitize_name(slug),
            sanitize_name(task),
            suffix
        )
    }
}

fn parse_pane_state(value: &str) -> PaneState {
    let mut parts = value.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("1"), Some(code)) => PaneState::Exited(code.parse().unwrap_or(-1)),
        (Some("1"), None) => PaneState::Exited(-1),
        _ => PaneState::Running,
    }
}
