#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::clock;
use crate::error::TaskhubError;
use crate::task::model::{TaskRecord, TaskStatus, TaskUpdate};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    tasks: Vec<TaskRecord>,
}

/// Ordered id → record map. Reads share the lock, every mutation holds it exclusively
/// for the stage-persist-commit cycle so concurrent status changes cannot lose updates.
#[derive(Debug, Default)]
pub struct TaskIndex {
    records: RwLock<Vec<TaskRecord>>,
    store_path: Option<PathBuf>,
}

impl TaskIndex {
    /// Index that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads the store file at `path` (absent file = empty index) and persists every
    /// later mutation back to it.
    pub fn open(path: PathBuf) -> Result<Self, TaskhubError> {
        let records = if path.exists() {
            let data =
                std::fs::read(&path).map_err(|e| TaskhubError::io("read", path.clone(), e))?;
            if data.iter().all(u8::is_ascii_whitespace) {
                Vec::new()
            } else {
                let file: StoreFile = serde_json::from_slice(&data).map_err(|e| {
                    TaskhubError::InvalidState(format!(
                        "task index {} is unreadable: {e}",
                        path.display()
                    ))
                })?;
                file.tasks
            }
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), tasks = records.len(), "opened task index");
        Ok(Self {
            records: RwLock::new(records),
            store_path: Some(path),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        self.records.read().iter().find(|r| r.id == id).cloned()
    }

    #[must_use]
    pub fn find_by_path(&self, file_path: &str) -> Option<TaskRecord> {
        self.records
            .read()
            .iter()
            .find(|r| r.file_path == file_path)
            .cloned()
    }

    #[must_use]
    pub fn list(&self) -> Vec<TaskRecord> {
        self.records.read().clone()
    }

    /// Records with `status`, in insertion order.
    #[must_use]
    pub fn list_by_status(&self, status: TaskStatus) -> Vec<TaskRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    pub fn insert(&self, record: TaskRecord) -> Result<(), TaskhubError> {
        let mut guard = self.records.write();
        if guard.iter().any(|r| r.id == record.id) {
            return Err(TaskhubError::InvalidState(format!(
                "task id {} is already indexed",
                record.id
            )));
        }
        if guard.iter().any(|r| r.file_path == record.file_path) {
            return Err(TaskhubError::InvalidState(format!(
                "{} is already indexed",
                record.file_path
            )));
        }
        let mut next = guard.clone();
        next.push(record);
        self.commit(&mut guard, next)
    }

    pub fn update(&self, id: &str, update: &TaskUpdate) -> Result<TaskRecord, TaskhubError> {
        let mut guard = self.records.write();
        let pos = guard
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| TaskhubError::task_not_found(id))?;
        let mut next = guard.clone();
        next[pos].apply(update, clock::now());
        let updated = next[pos].clone();
        self.commit(&mut guard, next)?;
        Ok(updated)
    }

    pub fn remove(&self, id: &str) -> Result<TaskRecord, TaskhubError> {
        let mut guard = self.records.write();
        let pos = guard
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| TaskhubError::task_not_found(id))?;
        let mut next = guard.clone();
        let removed = next.remove(pos);
        self.commit(&mut guard, next)?;
        Ok(removed)
    }

    pub fn clear(&self) -> Result<(), TaskhubError> {
        let mut guard = self.records.write();
        self.commit(&mut guard, Vec::new())
    }

    /// Swaps the whole content in one step; readers see either the old or the new set.
    pub fn replace_all(&self, records: Vec<TaskRecord>) -> Result<(), TaskhubError> {
        self.rebuild(|_| records).map(|_| ())
    }

    /// Replaces the content with what `build` makes of the current records. The write
    /// lock is held from the read to the commit, so no mutation can land in between.
    pub fn rebuild<F>(&self, build: F) -> Result<usize, TaskhubError>
    where
        F: FnOnce(&[TaskRecord]) -> Vec<TaskRecord>,
    {
        let mut guard = self.records.write();
        let next = build(guard.as_slice());
        let mut seen_ids = HashSet::new();
        let mut seen_paths = HashSet::new();
        for r in &next {
            if !seen_ids.insert(r.id.as_str()) || !seen_paths.insert(r.file_path.as_str()) {
                return Err(TaskhubError::InvalidState(format!(
                    "duplicate task {} ({}) in rebuild",
                    r.id, r.file_path
                )));
            }
        }
        let len = next.len();
        self.commit(&mut guard, next)?;
        Ok(len)
    }

    fn commit(&self, current: &mut Vec<TaskRecord>, next: Vec<TaskRecord>) -> Result<(), TaskhubError> {
        if let Some(path) = self.store_path.as_deref() {
            persist(path, &next)?;
        }
        *current = next;
        Ok(())
    }
}

fn persist(path: &Path, records: &[TaskRecord]) -> Result<(), TaskhubError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TaskhubError::io("create", parent, e))?;
    }
    let file = StoreFileRef { tasks: records };
    let data = serde_json::to_vec_pretty(&file)
        .map_err(|e| TaskhubError::InvalidState(format!("failed to serialize task index: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &data).map_err(|e| TaskhubError::io("write", tmp.clone(), e))?;
    std::fs::rename(&tmp, path).map_err(|e| TaskhubError::io("rename", path, e))?;
    Ok(())
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    tasks: &'a [TaskRecord],
}
