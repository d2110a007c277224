#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::{clock, naming};
use crate::error::TaskhubError;
use crate::events::{Event, EventPublisher};
use crate::mux::{Mux, SessionInfo};
use crate::mux::tmux::TmuxMux;
use crate::task::execution::{
    ExecutionManager, ExecutionRecord, ExecutionSettings, ExecutionStatusInfo,
};
use crate::task::index::TaskIndex;
use crate::task::model::{Priority, TaskRecord, TaskStatus, TaskUpdate};
use crate::task::store::{FileStore, NewTaskFile};
use crate::task::sync::{SyncReport, Synchronizer};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub content: String,
    /// Sub-directory of the tasks dir, if any.
    pub directory: Option<String>,
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub artifacts: Option<Vec<String>>,
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
}

impl StatusUpdate {
    #[must_use]
    pub fn to(status: TaskStatus) -> Self {
        Self {
            status,
            artifacts: None,
            priority: None,
            assignee: None,
        }
    }
}

/// The indexed record joined with what its backing file says.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskDetails {
    #[serde(flatten)]
    pub task: TaskRecord,
    pub tags: Vec<String>,
    #[serde(with = "clock::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    /// `None` when the backing file is missing or unreadable.
    pub content: Option<String>,
}

pub struct HubParts {
    pub index: Arc<TaskIndex>,
    pub store: Arc<FileStore>,
    pub executions: ExecutionManager,
    pub events: EventPublisher,
}

/// Long-lived service object owning the index, the task files and the executions.
/// Build one at start-up and share it behind an `Arc`.
#[derive(Debug)]
pub struct TaskHub {
    index: Arc<TaskIndex>,
    sync: Synchronizer,
    executions: ExecutionManager,
    events: EventPublisher,
}

impl TaskHub {
    /// Wires the parts together. Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(parts: HubParts) -> Self {
        let sync = Synchronizer::new(Arc::clone(&parts.index), parts.store);
        Self {
            index: parts.index,
            sync,
            executions: parts.executions,
            events: parts.events,
        }
    }

    /// Opens the data directory described by `cfg` with tmux as the session host.
    pub fn open(cfg: &Config) -> anyhow::Result<Self> {
        let mux: Arc<dyn Mux> = Arc::new(TmuxMux::new(cfg.mux.tmux_command.clone()));
        Self::open_with_mux(cfg, mux)
    }

    pub fn open_with_mux(cfg: &Config, mux: Arc<dyn Mux>) -> anyhow::Result<Self> {
        let layout = cfg.layout()?;

        let store = FileStore::new(layout.tasks_dir.clone())
            .with_reserved_names(cfg.sync.reserved_names.clone());
        store.ensure_dir()?;
        let index = TaskIndex::open(layout.db_file.clone())
            .with_context(|| format!("failed to open task index {}", layout.db_file.display()))?;
        let executions = ExecutionManager::new(
            layout.tasks_dir.clone(),
            layout.logs_dir.clone(),
            mux,
            ExecutionSettings {
                session_prefix: cfg.mux.session_prefix.clone(),
                shell: cfg.mux.shell.clone(),
                hold_on_exit: cfg.mux.hold_on_exit,
            },
        );
        executions
            .ensure_dirs()
            .context("failed to prepare the logs directory")?;

        if cfg.logs.auto_cleanup
            && cfg.logs.retention_days > 0
            && let Err(e) = executions.cleanup_old_logs(cfg.logs.retention_days)
        {
            warn!(error = %e, "execution log cleanup failed");
        }

        info!(
            root = %layout.root.display(),
            tasks = index.len(),
            "opened task hub"
        );
        Ok(Self::new(HubParts {
            index: Arc::new(index),
            store: Arc::new(store),
            executions,
            events: EventPublisher::new(cfg.events.channel_capacity),
        }))
    }

    #[must_use]
    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn executions(&self) -> &ExecutionManager {
        &self.executions
    }

    #[must_use]
    pub fn store(&self) -> &FileStore {
        self.sync.store()
    }

    /// Creates the backing file and its index record together.
    pub async fn create_task(&self, new: NewTask) -> Result<TaskRecord, TaskhubError> {
        let _hold = self.sync.hold_off_rescan().await;
        let index = Arc::clone(&self.index);
        let store = Arc::clone(self.sync.store());
        let record = blocking(move || create_record(&index, &store, new)).await?;
        info!(task_id = %record.id, path = %record.file_path, "created task");
        self.events.publish_task_event(&record, "created");
        Ok(record)
    }

    /// Indexes a file that was written outside the hub.
    pub async fn index_task(&self, file_path: &str) -> Result<TaskRecord, TaskhubError> {
        let _hold = self.sync.hold_off_rescan().await;
        let index = Arc::clone(&self.index);
        let store = Arc::clone(self.sync.store());
        let file_path = file_path.to_owned();
        let record = blocking(move || index_record(&index, &store, file_path)).await?;
        info!(task_id = %record.id, path = %record.file_path, "indexed task");
        self.events.publish_task_event(&record, "indexed");
        Ok(record)
    }

    /// All records, or those with `status`, in index order.
    #[must_use]
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<TaskRecord> {
        match status {
            Some(status) => self.index.list_by_status(status),
            None => self.index.list(),
        }
    }

    pub fn get_task(&self, id: &str) -> Result<TaskRecord, TaskhubError> {
        self.index
            .get(id)
            .ok_or_else(|| TaskhubError::task_not_found(id))
    }

    pub fn task_details(&self, id: &str) -> Result<TaskDetails, TaskhubError> {
        let mut task = self.get_task(id)?;
        let Some(parsed) = self.sync.store().read(&task.file_path) else {
            return Ok(TaskDetails {
                task,
                tags: Vec::new(),
                created_at: None,
                content: None,
            });
        };
        task.title = parsed.title;
        Ok(TaskDetails {
            task,
            tags: parsed.tags,
            created_at: parsed.created_at,
            content: Some(parsed.content),
        })
    }

    /// Updates the index, then queues the file write and announces the change.
    pub async fn update_status(
        &self,
        id: &str,
        update: StatusUpdate,
    ) -> Result<TaskRecord, TaskhubError> {
        self.apply(
            id,
            TaskUpdate {
                status: Some(update.status),
                priority: update.priority,
                assignee: update.assignee,
                artifacts: update.artifacts,
            },
        )
        .await
    }

    /// Drops the record, and its backing file when `remove_file` is set.
    pub async fn delete_task(&self, id: &str, remove_file: bool) -> Result<TaskRecord, TaskhubError> {
        let _hold = self.sync.hold_off_rescan().await;
        let index = Arc::clone(&self.index);
        let store = Arc::clone(self.sync.store());
        let id = id.to_owned();
        let record = blocking(move || {
            let record = index.remove(&id)?;
            if remove_file && !store.remove(&record.file_path) {
                warn!(task_id = %record.id, path = %record.file_path, "backing file was not removed");
            }
            Ok(record)
        })
        .await?;
        info!(task_id = %record.id, path = %record.file_path, remove_file, "deleted task");
        self.events.publish_task_event(&record, "deleted");
        Ok(record)
    }

    pub async fn sync_from_files(&self) -> Result<SyncReport, TaskhubError> {
        self.sync.sync_from_files().await
    }

    /// Launches the task's script. Once the session is up the launch stands: a failure
    /// to record `inprogress` is logged, not returned.
    pub async fn execute_task(
        &self,
        id: &str,
        script: Option<&str>,
    ) -> Result<ExecutionRecord, TaskhubError> {
        self.get_task(id)?;
        let record = self.executions.execute_task(id, script).await?;
        if let Err(e) = self.apply(id, TaskUpdate::status(TaskStatus::InProgress)).await {
            warn!(task_id = id, error = %e, "execution started but the task status was not updated");
        }
        self.events.publish_execution_event(
            id,
            "started",
            json!({
                "execution_id": record.execution_id,
                "session_name": record.session_name,
            }),
        );
        Ok(record)
    }

    pub async fn execution_status(&self, id: &str) -> Result<ExecutionStatusInfo, TaskhubError> {
        self.executions.execution_status(id).await
    }

    #[must_use]
    pub fn execution_logs(&self, id: &str, tail: i64) -> Vec<String> {
        self.executions.execution_logs(id, tail)
    }

    /// Kills the task's session and moves the task to `review`. Nothing changes when
    /// there was no session.
    pub async fn stop_task_execution(&self, id: &str) -> Result<bool, TaskhubError> {
        if !self.executions.stop_task_execution(id).await? {
            return Ok(false);
        }
        if let Err(e) = self.apply(id, TaskUpdate::status(TaskStatus::Review)).await {
            warn!(task_id = id, error = %e, "session stopped but the task status was not updated");
        }
        self.events
            .publish_execution_event(id, "stopped", json!({}));
        Ok(true)
    }

    pub async fn attach_command(&self, id: &str) -> Result<String, TaskhubError> {
        self.executions.attach_command(id).await
    }

    pub async fn live_sessions(&self) -> Result<Vec<SessionInfo>, TaskhubError> {
        self.executions.live_sessions().await
    }

    pub fn cleanup_logs(&self, retention_days: u64) -> Result<usize, TaskhubError> {
        self.executions.cleanup_old_logs(retention_days)
    }

    /// Waits for queued file writes to land.
    pub async fn shutdown(&self) {
        self.sync.flush().await;
        info!("task hub shut down");
    }

    async fn apply(&self, id: &str, update: TaskUpdate) -> Result<TaskRecord, TaskhubError> {
        let _hold = self.sync.hold_off_rescan().await;
        let index = Arc::clone(&self.index);
        let id = id.to_owned();
        let record = blocking(move || index.update(&id, &update)).await?;
        self.sync.sync_to_file(&record);
        self.events.publish_task_update(
            &record.id,
            record.status,
            record.priority,
            record.assignee.as_deref(),
            Some(record.artifacts.as_slice()),
        );
        Ok(record)
    }
}

/// Runs index persistence and file I/O off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, TaskhubError>
where
    F: FnOnce() -> Result<T, TaskhubError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TaskhubError::InvalidState(format!("blocking task failed: {e}")))?
}

fn create_record(
    index: &TaskIndex,
    store: &FileStore,
    new: NewTask,
) -> Result<TaskRecord, TaskhubError> {
    let file_name = naming::task_file_name(&new.title).ok_or_else(|| {
        TaskhubError::InvalidState(format!(
            "title '{}' does not yield a usable file name",
            new.title
        ))
    })?;
    let file_path = naming::join_relative(new.directory.as_deref(), &file_name);
    let Some(full_path) = store.resolve(&file_path) else {
        return Err(TaskhubError::InvalidState(format!(
            "task path '{file_path}' escapes the tasks directory"
        )));
    };
    if index.find_by_path(&file_path).is_some() {
        return Err(TaskhubError::InvalidState(format!(
            "{file_path} is already indexed"
        )));
    }
    if full_path.exists() {
        return Err(TaskhubError::io(
            "create",
            full_path,
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "task file already exists"),
        ));
    }

    let file = NewTaskFile {
        title: new.title.clone(),
        body: new.content,
        priority: new.priority,
        assignee: new.assignee.clone(),
    };
    if !store.create(&file_path, &file, false) {
        return Err(TaskhubError::io(
            "create",
            full_path,
            std::io::Error::other("task file could not be written"),
        ));
    }

    let record = TaskRecord {
        title: new.title,
        priority: new.priority,
        assignee: new.assignee,
        ..TaskRecord::new(file_path)
    };
    index.insert(record.clone())?;
    Ok(record)
}

fn index_record(
    index: &TaskIndex,
    store: &FileStore,
    file_path: String,
) -> Result<TaskRecord, TaskhubError> {
    if !store.exists(&file_path) {
        return Err(TaskhubError::NotFound {
            kind: "task file",
            id: file_path,
        });
    }

    let mut record = TaskRecord::new(file_path);
    if let Some(parsed) = store.read(&record.file_path) {
        record.title = parsed.title;
        record.priority = parsed.priority;
        record.assignee = parsed.assignee;
    }
    index.insert(record.clone())?;
    Ok(record)
}
