#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskhubError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("task {task_id} is already running in session {session}")]
    AlreadyRunning { task_id: String, session: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("failed to {op} {path}: {source}")]
    IoFailure {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tmux is required but was not found in PATH")]
    MuxNotFound,

    #[error("{0}")]
    Mux(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid config key '{0}'")]
    InvalidConfigKey(String),

    #[error("invalid config value for '{key}': {msg}")]
    InvalidConfigValue { key: String, msg: String },
}

impl TaskhubError {
    #[must_use]
    pub fn task_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "task",
            id: id.to_owned(),
        }
    }

    #[must_use]
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoFailure {
            op,
            path: path.into(),
            source,
        }
    }

    /// Stable category name for the dispatch layer.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyRunning { .. } => "already_running",
            Self::InvalidState(_) => "invalid_state",
            Self::IoFailure { .. } => "io_failure",
            Self::MuxNotFound | Self::Mux(_) => "mux_failure",
            Self::Config(_) | Self::InvalidConfigKey(_) | Self::InvalidConfigValue { .. } => {
                "config"
            }
        }
    }
}
