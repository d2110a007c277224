#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use taskhub::error::TaskhubError;
use taskhub::events::EventPublisher;
use taskhub::hub::{HubParts, TaskHub};
use taskhub::mux::{Mux, SessionInfo};
use taskhub::task::execution::{ExecutionManager, ExecutionSettings};
use taskhub::task::index::TaskIndex;
use taskhub::task::store::FileStore;

/// In-memory stand-in for tmux: sessions exist until killed or finished.
#[derive(Default)]
pub struct FakeMux {
    sessions: Mutex<HashSet<String>>,
    pub launches: Mutex<Vec<(String, String)>>,
}

impl FakeMux {
    pub fn finish(&self, name: &str) {
        self.sessions.lock().remove(name);
    }
}

impl Mux for FakeMux {
    fn has_session(&self, name: &str) -> Result<bool, TaskhubError> {
        Ok(self.sessions.lock().contains(name))
    }

    fn new_session(&self, name: &str, command: &str) -> Result<(), TaskhubError> {
        // Widen the window between the liveness check and the launch.
        std::thread::sleep(std::time::Duration::from_millis(20));
        self.sessions.lock().insert(name.to_owned());
        self.launches
            .lock()
            .push((name.to_owned(), command.to_owned()));
        Ok(())
    }

    fn kill(&self, name: &str) -> Result<bool, TaskhubError> {
        Ok(self.sessions.lock().remove(name))
    }

    fn list_sessions(&self) -> Result<Vec<SessionInfo>, TaskhubError> {
        Ok(self
            .sessions
            .lock()
            .iter()
            .map(|name| SessionInfo { name: name.clone() })
            .collect())
    }

    fn attach_command(&self, name: &str) -> String {
        format!("tmux attach-session -t {name}")
    }
}

/// A hub over `root` with a persisted index and the fake multiplexer.
pub fn hub_at(root: &Path) -> (Arc<TaskHub>, Arc<FakeMux>) {
    let mux = Arc::new(FakeMux::default());
    let index = TaskIndex::open(root.join("db").join("tasks_db.json")).expect("open index");
    let executions = ExecutionManager::new(
        root.join("tasks"),
        root.join("logs"),
        Arc::clone(&mux) as Arc<dyn Mux>,
        ExecutionSettings::default(),
    );
    let hub = TaskHub::new(HubParts {
        index: Arc::new(index),
        store: Arc::new(FileStore::new(root.join("tasks"))),
        executions,
        events: EventPublisher::new(64),
    });
    (Arc::new(hub), mux)
}

pub fn write_task(root: &Path, rel: &str, contents: &str) {
    let path = root.join("tasks").join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdir");
    }
    std::fs::write(path, contents).expect("write task file");
}
