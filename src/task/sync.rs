#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::core::clock;
use crate::error::TaskhubError;
use crate::task::index::TaskIndex;
use crate::task::model::TaskRecord;
use crate::task::store::{FileFields, FileStore, SkippedFile};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    pub skipped: Vec<SkippedFile>,
}

enum Job {
    Write { file_path: String, fields: FileFields },
    Flush(oneshot::Sender<()>),
}

/// Keeps the index and the task files in step: full rescans one way, queued
/// write-through the other. Must be created inside a tokio runtime.
#[derive(Debug)]
pub struct Synchronizer {
    index: Arc<TaskIndex>,
    store: Arc<FileStore>,
    queue: mpsc::UnboundedSender<Job>,
    rescan_gate: RwLock<()>,
}

impl Synchronizer {
    #[must_use]
    pub fn new(index: Arc<TaskIndex>, store: Arc<FileStore>) -> Self {
        let (queue, jobs) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(Arc::clone(&store), jobs));
        Self {
            index,
            store,
            queue,
            rescan_gate: RwLock::new(()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    /// Hold while changing the index and queueing the matching file write. Rescans
    /// wait until every holder is done, and changes wait for a running rescan.
    pub async fn hold_off_rescan(&self) -> RwLockReadGuard<'_, ()> {
        self.rescan_gate.read().await
    }

    /// Rebuilds the index from the files on disk. Files already indexed under the same
    /// path keep their id; everything else about the record comes from the file.
    ///
    /// Queued writes are applied before the scan so the files reflect every change
    /// the index has already accepted.
    pub async fn sync_from_files(&self) -> Result<SyncReport, TaskhubError> {
        let _exclusive = self.rescan_gate.write().await;
        self.flush().await;

        let index = Arc::clone(&self.index);
        let store = Arc::clone(&self.store);
        let report = tokio::task::spawn_blocking(move || rescan(&index, &store))
            .await
            .map_err(|e| TaskhubError::InvalidState(format!("rescan task failed: {e}")))??;
        info!(
            synced = report.synced,
            skipped = report.skipped.len(),
            root = %self.store.root().display(),
            "synchronized tasks from files"
        );
        Ok(report)
    }

    /// Queues the record's status fields for its backing file. Returns at once; write
    /// failures are logged by the writer.
    pub fn sync_to_file(&self, record: &TaskRecord) {
        let job = Job::Write {
            file_path: record.file_path.clone(),
            fields: FileFields {
                status: record.status,
                updated_at: record.updated_at,
                priority: record.priority,
                assignee: record.assignee.clone(),
                artifacts: (!record.artifacts.is_empty()).then(|| record.artifacts.clone()),
            },
        };
        if self.queue.send(job).is_err() {
            warn!(path = %record.file_path, "file writer has stopped, dropping write");
        }
    }

    /// Resolves once every write queued before this call has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.queue.send(Job::Flush(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

fn rescan(index: &TaskIndex, store: &FileStore) -> Result<SyncReport, TaskhubError> {
    let scan = store.scan();
    let now = clock::now();
    let tasks = scan.tasks;

    let synced = index.rebuild(|current| {
        let ids: HashMap<&str, &str> = current
            .iter()
            .map(|r| (r.file_path.as_str(), r.id.as_str()))
            .collect();
        tasks
            .into_iter()
            .map(|task| {
                let id = ids
                    .get(task.file_path.as_str())
                    .map_or_else(TaskRecord::new_id, |id| (*id).to_owned());
                TaskRecord {
                    id,
                    title: task.title,
                    status: task.status,
                    file_path: task.file_path,
                    updated_at: task.updated_at.unwrap_or(now),
                    assignee: task.assignee,
                    priority: task.priority,
                    artifacts: task.artifacts,
                }
            })
            .collect()
    })?;
    Ok(SyncReport {
        synced,
        skipped: scan.skipped,
    })
}

async fn run_writer(store: Arc<FileStore>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Write { file_path, fields } => {
                let store = Arc::clone(&store);
                let path = file_path.clone();
                match tokio::task::spawn_blocking(move || store.write(&path, &fields)).await {
                    Ok(true) => debug!(path = %file_path, "wrote task file"),
                    Ok(false) => {}
                    Err(e) => warn!(path = %file_path, error = %e, "task file write panicked"),
                }
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("file writer stopped");
}
