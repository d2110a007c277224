#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{clock, naming};
use crate::error::TaskhubError;
use crate::mux::{Mux, SessionInfo};

pub const NO_LOGS: &str = "No logs found for this task";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub task_id: String,
    pub session_name: String,
    pub log_file: PathBuf,
    pub script_path: PathBuf,
    #[serde(with = "clock::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "clock::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default, with = "clock::rfc3339::option")]
    pub stopped_at: Option<OffsetDateTime>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExecutionStatusInfo {
    pub task_id: String,
    pub is_running: bool,
    /// `None` when the task has never been executed.
    pub status: Option<ExecutionStatus>,
    pub execution: Option<ExecutionRecord>,
    pub message: Option<String>,
}

impl ExecutionStatusInfo {
    #[must_use]
    pub fn status_label(&self) -> &'static str {
        self.status.map_or("unknown", ExecutionStatus::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub session_prefix: String,
    pub shell: String,
    pub hold_on_exit: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            session_prefix: "taskhub".to_owned(),
            shell: "bash".to_owned(),
            hold_on_exit: false,
        }
    }
}

pub struct ExecutionManager {
    tasks_dir: PathBuf,
    logs_dir: PathBuf,
    mux: Arc<dyn Mux>,
    settings: ExecutionSettings,
    task_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for ExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionManager")
            .field("tasks_dir", &self.tasks_dir)
            .field("logs_dir", &self.logs_dir)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ExecutionManager {
    #[must_use]
    pub fn new(
        tasks_dir: PathBuf,
        logs_dir: PathBuf,
        mux: Arc<dyn Mux>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            tasks_dir,
            logs_dir,
            mux,
            settings,
            task_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn metadata_dir(&self) -> PathBuf {
        self.logs_dir.join("metadata")
    }

    #[must_use]
    pub fn metadata_path(&self, execution_id: &str) -> PathBuf {
        self.metadata_dir().join(format!("{execution_id}.json"))
    }

    /// Default script location for a task.
    #[must_use]
    pub fn task_script_path(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(task_id).join("execute.sh")
    }

    #[must_use]
    pub fn session_name(&self, task_id: &str) -> String {
        naming::session_name(&self.settings.session_prefix, task_id)
    }

    pub fn ensure_dirs(&self) -> Result<(), TaskhubError> {
        let meta = self.metadata_dir();
        std::fs::create_dir_all(&meta).map_err(|e| TaskhubError::io("create", meta, e))
    }

    /// Launches the task's script in a detached session and returns without waiting for
    /// it. At most one launch per task is in flight at a time.
    pub async fn execute_task(
        &self,
        task_id: &str,
        script_content: Option<&str>,
    ) -> Result<ExecutionRecord, TaskhubError> {
        naming::validate_id(task_id).map_err(TaskhubError::InvalidState)?;

        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let session = self.session_name(task_id);
        let name = session.clone();
        if self.mux_call(move |mux| mux.has_session(&name)).await? {
            return Err(TaskhubError::AlreadyRunning {
                task_id: task_id.to_owned(),
                session,
            });
        }

        self.ensure_dirs()?;
        let execution_id = Uuid::new_v4().to_string();
        let script_path = match script_content {
            Some(content) => {
                let path = self.logs_dir.join(format!("{task_id}_{execution_id}.sh"));
                write_script(&path, content)?;
                path
            }
            None => {
                let path = self.task_script_path(task_id);
                if !path.exists() {
                    write_script(&path, &placeholder_script(task_id))?;
                    info!(task_id, path = %path.display(), "created placeholder script");
                }
                path
            }
        };

        let log_file = self.logs_dir.join(format!("{task_id}_{execution_id}.log"));
        std::fs::write(&log_file, b"").map_err(|e| TaskhubError::io("create", log_file.clone(), e))?;

        let command = launch_command(&self.settings, &log_file, &script_path)?;
        let name = session.clone();
        self.mux_call(move |mux| mux.new_session(&name, &command))
            .await?;

        let record = ExecutionRecord {
            execution_id,
            task_id: task_id.to_owned(),
            session_name: session,
            log_file,
            script_path,
            started_at: clock::now(),
            completed_at: None,
            stopped_at: None,
            status: ExecutionStatus::Running,
            exit_code: None,
        };
        self.save_metadata(&record)?;
        info!(
            task_id,
            session = %record.session_name,
            execution_id = %record.execution_id,
            "started task execution"
        );
        Ok(record)
    }

    /// Reports the most recent execution. A `running` record whose session has gone
    /// away is settled here, from the exit code the wrapper printed into the log.
    pub async fn execution_status(&self, task_id: &str) -> Result<ExecutionStatusInfo, TaskhubError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let session = self.session_name(task_id);
        let name = session.clone();
        let is_running = self.mux_call(move |mux| mux.has_session(&name)).await?;

        let Some(mut record) = self.history(task_id)?.into_iter().next() else {
            return Ok(ExecutionStatusInfo {
                task_id: task_id.to_owned(),
                is_running,
                status: None,
                execution: None,
                message: Some("No execution found for this task".to_owned()),
            });
        };

        if record.status == ExecutionStatus::Running && !is_running {
            record.exit_code = read_exit_code(&record.log_file);
            record.status = match record.exit_code {
                Some(code) if code != 0 => ExecutionStatus::Failed,
                _ => ExecutionStatus::Completed,
            };
            record.completed_at = Some(clock::now());
            self.save_metadata(&record)?;
            info!(
                task_id,
                execution_id = %record.execution_id,
                status = record.status.as_str(),
                "execution finished"
            );
        }

        Ok(ExecutionStatusInfo {
            task_id: task_id.to_owned(),
            is_running,
            status: Some(record.status),
            execution: Some(record),
            message: None,
        })
    }

    /// Lines of the newest log for the task; the last `tail` lines, or all when
    /// `tail <= 0`.
    #[must_use]
    pub fn execution_logs(&self, task_id: &str, tail: i64) -> Vec<String> {
        let Some(path) = self.latest_log(task_id) else {
            return vec![NO_LOGS.to_owned()];
        };
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => return vec![format!("Error reading log file: {e}")],
        };
        let lines: Vec<String> = content.lines().map(str::to_owned).collect();
        match usize::try_from(tail) {
            Ok(n) if n > 0 && n < lines.len() => lines[lines.len() - n..].to_vec(),
            _ => lines,
        }
    }

    /// Kills the task's session. `false` when there was none to kill.
    pub async fn stop_task_execution(&self, task_id: &str) -> Result<bool, TaskhubError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let session = self.session_name(task_id);
        let name = session.clone();
        if !self.mux_call(move |mux| mux.kill(&name)).await? {
            debug!(task_id, session = %session, "no session to stop");
            return Ok(false);
        }

        let now = clock::now();
        for mut record in self.history(task_id)? {
            if record.status != ExecutionStatus::Running {
                continue;
            }
            record.status = ExecutionStatus::Stopped;
            record.stopped_at = Some(now);
            self.save_metadata(&record)?;
        }
        info!(task_id, session = %session, "stopped task execution");
        Ok(true)
    }

    pub async fn attach_command(&self, task_id: &str) -> Result<String, TaskhubError> {
        let session = self.session_name(task_id);
        let name = session.clone();
        if !self.mux_call(move |mux| mux.has_session(&name)).await? {
            return Err(TaskhubError::NotFound {
                kind: "session",
                id: session,
            });
        }
        Ok(self.mux.attach_command(&session))
    }

    /// Live sessions started by this manager, sorted by name.
    pub async fn live_sessions(&self) -> Result<Vec<SessionInfo>, TaskhubError> {
        let prefix = format!("{}_", naming::sanitize_session(&self.settings.session_prefix));
        let mut sessions = self.mux_call(|mux| mux.list_sessions()).await?;
        sessions.retain(|s| s.name.starts_with(&prefix));
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sessions)
    }

    /// Every recorded execution of the task, newest first.
    pub fn history(&self, task_id: &str) -> Result<Vec<ExecutionRecord>, TaskhubError> {
        let mut records: Vec<ExecutionRecord> = self
            .list_metadata()?
            .into_iter()
            .filter(|r| r.task_id == task_id)
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }

    pub fn save_metadata(&self, record: &ExecutionRecord) -> Result<(), TaskhubError> {
        self.ensure_dirs()?;
        let path = self.metadata_path(&record.execution_id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(record).map_err(|e| {
            TaskhubError::InvalidState(format!("failed to serialize execution record: {e}"))
        })?;
        std::fs::write(&tmp, &data).map_err(|e| TaskhubError::io("write", tmp.clone(), e))?;
        std::fs::rename(&tmp, &path).map_err(|e| TaskhubError::io("rename", path, e))?;
        Ok(())
    }

    pub fn list_metadata(&self) -> Result<Vec<ExecutionRecord>, TaskhubError> {
        let dir = self.metadata_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&dir).map_err(|e| TaskhubError::io("read", dir.clone(), e))?;
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Ok(data) = std::fs::read(&path) else {
                continue;
            };
            match serde_json::from_slice::<ExecutionRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => debug!(path = %path.display(), error = %e, "ignoring execution metadata"),
            }
        }
        Ok(records)
    }

    /// Removes logs and scripts last modified before the retention window, along with
    /// the metadata of finished executions started before it. Returns the number of
    /// files removed.
    pub fn cleanup_old_logs(&self, retention_days: u64) -> Result<usize, TaskhubError> {
        const MAX_DAYS: i64 = i64::MAX / 86_400;
        let retention_days = i64::try_from(retention_days)
            .unwrap_or(MAX_DAYS)
            .min(MAX_DAYS);
        let cutoff = clock::now() - time::Duration::days(retention_days);

        let mut removed = 0;
        for record in self.list_metadata()? {
            if record.status == ExecutionStatus::Running || record.started_at >= cutoff {
                continue;
            }
            if std::fs::remove_file(self.metadata_path(&record.execution_id)).is_ok() {
                removed += 1;
            }
        }

        if let Ok(entries) = std::fs::read_dir(&self.logs_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let is_artifact = matches!(
                    path.extension().and_then(|s| s.to_str()),
                    Some("log" | "sh")
                );
                if !is_artifact {
                    continue;
                }
                let Some(modified) = modified_at(&path) else {
                    continue;
                };
                if modified < cutoff {
                    match std::fs::remove_file(&path) {
                        Ok(()) => removed += 1,
                        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove old log"),
                    }
                }
            }
        }

        if removed > 0 {
            info!(removed, retention_days, "cleaned up old execution logs");
        }
        Ok(removed)
    }

    fn latest_log(&self, task_id: &str) -> Option<PathBuf> {
        let prefix = format!("{task_id}_");
        std::fs::read_dir(&self.logs_dir)
            .ok()?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.extension().and_then(|s| s.to_str()) == Some("log")
                    && p.file_name()
                        .and_then(|s| s.to_str())
                        .is_some_and(|n| n.starts_with(&prefix))
            })
            .max_by(|a, b| modified_at(a).cmp(&modified_at(b)).then_with(|| a.cmp(b)))
    }

    fn task_lock(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.task_locks.lock();
        // Only the map holds idle locks; clones are handed out under this guard.
        locks.retain(|id, lock| id == task_id || Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(task_id.to_owned()).or_default())
    }

    async fn mux_call<T, F>(&self, f: F) -> Result<T, TaskhubError>
    where
        F: FnOnce(&dyn Mux) -> Result<T, TaskhubError> + Send + 'static,
        T: Send + 'static,
    {
        let mux = Arc::clone(&self.mux);
        tokio::task::spawn_blocking(move || f(mux.as_ref()))
            .await
            .map_err(|e| TaskhubError::Mux(format!("multiplexer call failed: {e}")))?
    }
}

/// Shell command run inside the session: all output is appended to the log, and the
/// script's exit status is printed as the last line.
fn launch_command(
    settings: &ExecutionSettings,
    log_file: &Path,
    script_path: &Path,
) -> Result<String, TaskhubError> {
    let log = quote(&log_file.to_string_lossy())?;
    let script = quote(&script_path.to_string_lossy())?;
    let shell = quote(&settings.shell)?;

    let mut inner = format!(
        "exec > >(tee -a {log}) 2>&1; {shell} {script}; echo \"Exit code: $?\""
    );
    if settings.hold_on_exit {
        inner.push_str("; echo 'Press Enter to close this session'; read -r _");
    }
    Ok(format!("{shell} -c {}", quote(&inner)?))
}

fn quote(s: &str) -> Result<String, TaskhubError> {
    shlex::try_quote(s)
        .map(|q| q.into_owned())
        .map_err(|e| TaskhubError::InvalidState(format!("cannot quote '{s}' for the shell: {e}")))
}

fn placeholder_script(task_id: &str) -> String {
    format!(
        r#"#!/bin/bash
# Auto-generated execution script for task {task_id}
echo "Starting task execution: {task_id}"
echo "Timestamp: $(date)"
echo "================================"
# Replace the lines below with the commands for this task.
echo "Task execution placeholder"
echo "Please update the execute.sh script in the task directory"
echo "================================"
echo "Task completed: $(date)"
"#
    )
}

fn write_script(path: &Path, content: &str) -> Result<(), TaskhubError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TaskhubError::io("create", parent, e))?;
    }
    std::fs::write(path, content).map_err(|e| TaskhubError::io("write", path, e))?;
    make_executable(path)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), TaskhubError> {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| TaskhubError::io("chmod", path, e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), TaskhubError> {
    Ok(())
}

/// Exit status printed by the session wrapper, taken from the last such line.
fn read_exit_code(log_file: &Path) -> Option<i32> {
    let content = std::fs::read_to_string(log_file).ok()?;
    content
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix("Exit code:"))
        .and_then(|code| code.trim().parse().ok())
}

fn modified_at(path: &Path) -> Option<OffsetDateTime> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(OffsetDateTime::from(modified))
}
