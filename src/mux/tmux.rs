#![forbid(unsafe_code)]

use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::TaskhubError;
use crate::mux::{Mux, SessionInfo};

#[derive(Debug, Clone)]
pub struct TmuxMux {
    pub tmux_command: String,
}

impl TmuxMux {
    #[must_use]
    pub fn new(tmux_command: String) -> Self {
        Self { tmux_command }
    }

    fn ensure_available(&self) -> Result<(), TaskhubError> {
        match Command::new(&self.tmux_command)
            .arg("-V")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TaskhubError::MuxNotFound),
            Err(e) => Err(TaskhubError::Mux(format!("failed to run tmux: {e}"))),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.tmux_command);
        cmd.stdin(Stdio::null());
        cmd
    }
}

/// `=name` makes tmux match the session name exactly instead of by prefix.
fn exact(name: &str) -> String {
    format!("={name}")
}

impl Mux for TmuxMux {
    fn has_session(&self, name: &str) -> Result<bool, TaskhubError> {
        self.ensure_available()?;
        let status = self
            .command()
            .args(["has-session", "-t", &exact(name)])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| TaskhubError::Mux(format!("failed to run tmux has-session: {e}")))?;
        Ok(status.success())
    }

    fn new_session(&self, name: &str, command: &str) -> Result<(), TaskhubError> {
        self.ensure_available()?;
        let out = self
            .command()
            .args(["new-session", "-d", "-s", name, command])
            .output()
            .map_err(|e| TaskhubError::Mux(format!("failed to run tmux new-session: {e}")))?;
        if out.status.success() {
            debug!(session = name, "created tmux session");
            Ok(())
        } else {
            Err(TaskhubError::Mux(format!(
                "tmux new-session failed with exit code {code}: {stderr}",
                code = out.status.code().unwrap_or(1),
                stderr = String::from_utf8_lossy(&out.stderr).trim()
            )))
        }
    }

    fn kill(&self, name: &str) -> Result<bool, TaskhubError> {
        self.ensure_available()?;
        let status = self
            .command()
            .args(["kill-session", "-t", &exact(name)])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| TaskhubError::Mux(format!("failed to run tmux kill-session: {e}")))?;
        Ok(status.success())
    }

    fn list_sessions(&self) -> Result<Vec<SessionInfo>, TaskhubError> {
        self.ensure_available()?;
        let out = self
            .command()
            .args(["list-sessions", "-F", "#{session_name}"])
            .output()
            .map_err(|e| TaskhubError::Mux(format!("failed to run tmux list-sessions: {e}")))?;

        // No server running means no sessions.
        if !out.status.success() {
            return Ok(Vec::new());
        }

        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|name| SessionInfo {
                name: name.to_owned(),
            })
            .collect())
    }

    fn attach_command(&self, name: &str) -> String {
        format!("{} attach-session -t {name}", self.tmux_command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_command_uses_configured_binary() {
        let mux = TmuxMux::new("tmux".to_owned());
        assert_eq!(
            mux.attach_command("taskhub_1234abcd"),
            "tmux attach-session -t taskhub_1234abcd"
        );
    }

    #[test]
    fn missing_binary_is_reported() {
        let mux = TmuxMux::new("definitely-not-a-real-tmux-binary".to_owned());
        assert!(matches!(
            mux.has_session("x"),
            Err(TaskhubError::MuxNotFound)
        ));
    }
}
