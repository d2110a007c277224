#![forbid(unsafe_code)]

pub mod tmux;

use crate::error::TaskhubError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: String,
}

/// A host for detached, named, re-attachable sessions. Implementations block; callers
/// on the async side move calls onto the blocking pool.
pub trait Mux: Send + Sync {
    fn has_session(&self, name: &str) -> Result<bool, TaskhubError>;

    /// Starts `command` (a shell command line) in a new detached session.
    fn new_session(&self, name: &str, command: &str) -> Result<(), TaskhubError>;

    /// Ends the session. `Ok(false)` when it did not exist.
    fn kill(&self, name: &str) -> Result<bool, TaskhubError>;

    fn list_sessions(&self) -> Result<Vec<SessionInfo>, TaskhubError>;

    /// The command an operator runs to attach to `name`.
    fn attach_command(&self, name: &str) -> String;
}
