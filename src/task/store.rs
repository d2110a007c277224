#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Context as _;
use regex::Regex;
use time::OffsetDateTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::{clock, naming};
use crate::task::frontmatter::{self, Document};
use crate::task::model::{Priority, TaskStatus};

static BODY_STATUS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)Status:\s*(todo|inprogress|review|done)").ok());

/// A task file as read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTask {
    /// Relative to the store root, `/`-separated.
    pub file_path: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
    pub tags: Vec<String>,
    pub created_at: Option<OffsetDateTime>,
    pub updated_at: Option<OffsetDateTime>,
    pub artifacts: Vec<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub file_path: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Scan {
    pub tasks: Vec<ParsedTask>,
    pub skipped: Vec<SkippedFile>,
}

/// Fields pushed from the index into a file's header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFields {
    pub status: TaskStatus,
    pub updated_at: OffsetDateTime,
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
    pub artifacts: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTaskFile {
    pub title: String,
    pub body: String,
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    reserved_names: Vec<String>,
}

impl FileStore {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            reserved_names: vec!["README.md".to_owned()],
        }
    }

    #[must_use]
    pub fn with_reserved_names(mut self, names: Vec<String>) -> Self {
        self.reserved_names = names;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create tasks dir {}", self.root.display()))
    }

    /// Absolute path for a relative task path, `None` if the path would escape the root.
    #[must_use]
    pub fn resolve(&self, rel_path: &str) -> Option<PathBuf> {
        naming::is_safe_relative(rel_path).then(|| self.root.join(rel_path))
    }

    #[must_use]
    pub fn exists(&self, rel_path: &str) -> bool {
        self.resolve(rel_path).is_some_and(|p| p.is_file())
    }

    /// Walks the root in lexical path order. Malformed files are reported in
    /// [`Scan::skipped`] and never stop the walk.
    #[must_use]
    pub fn scan(&self) -> Scan {
        let mut scan = Scan::default();
        if !self.root.is_dir() {
            return scan;
        }

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(root = %self.root.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.is_task_file(entry.path()) {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let rel = naming::to_slash(rel);
            match parse_task_file(entry.path(), &rel) {
                Ok(task) => scan.tasks.push(task),
                Err(e) => {
                    let reason = format!("{e:#}");
                    warn!(path = %rel, reason = %reason, "skipping malformed task file");
                    scan.skipped.push(SkippedFile {
                        file_path: rel,
                        reason,
                    });
                }
            }
        }
        debug!(
            root = %self.root.display(),
            tasks = scan.tasks.len(),
            skipped = scan.skipped.len(),
            "scanned task files"
        );
        scan
    }

    #[must_use]
    pub fn read(&self, rel_path: &str) -> Option<ParsedTask> {
        let path = self.resolve(rel_path)?;
        match parse_task_file(&path, rel_path) {
            Ok(task) => Some(task),
            Err(e) => {
                debug!(path = %rel_path, error = %format!("{e:#}"), "failed to read task file");
                None
            }
        }
    }

    /// Overlays `fields` on the file's header, keeping the body and any other keys.
    /// Missing files are created with an empty body.
    pub fn write(&self, rel_path: &str, fields: &FileFields) -> bool {
        match self.try_write(rel_path, fields) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %rel_path, error = %format!("{e:#}"), "failed to update task file");
                false
            }
        }
    }

    fn try_write(&self, rel_path: &str, fields: &FileFields) -> anyhow::Result<()> {
        let path = self
            .resolve(rel_path)
            .with_context(|| format!("refusing unsafe task path '{rel_path}'"))?;

        let mut doc = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            frontmatter::decode(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Document::default()
        };

        doc.set_str("status", fields.status.as_str());
        doc.set_str("updated_at", clock::format(fields.updated_at));
        if let Some(priority) = fields.priority {
            doc.set_str("priority", priority.as_str());
        }
        if let Some(assignee) = fields.assignee.as_deref() {
            doc.set_str("assignee", assignee);
        }
        if let Some(artifacts) = fields.artifacts.as_deref() {
            doc.set_list("artifacts", artifacts);
        }

        write_atomic(&path, &frontmatter::encode(&doc)?)
    }

    /// Creates a new `todo` task file. Existing files are left alone unless `overwrite`.
    pub fn create(&self, rel_path: &str, task: &NewTaskFile, overwrite: bool) -> bool {
        match self.try_create(rel_path, task, overwrite) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %rel_path, error = %format!("{e:#}"), "failed to create task file");
                false
            }
        }
    }

    fn try_create(&self, rel_path: &str, task: &NewTaskFile, overwrite: bool) -> anyhow::Result<()> {
        let path = self
            .resolve(rel_path)
            .with_context(|| format!("refusing unsafe task path '{rel_path}'"))?;
        if path.exists() && !overwrite {
            anyhow::bail!("{} already exists", path.display());
        }

        let now = clock::now_rfc3339();
        let mut doc = Document::new(task.body.as_str());
        doc.set_str("title", task.title.as_str());
        doc.set_str("status", TaskStatus::Todo.as_str());
        doc.set_str("created_at", now.as_str());
        doc.set_str("updated_at", now);
        if let Some(priority) = task.priority {
            doc.set_str("priority", priority.as_str());
        }
        if let Some(assignee) = task.assignee.as_deref() {
            doc.set_str("assignee", assignee);
        }

        write_atomic(&path, &frontmatter::encode(&doc)?)
    }

    pub fn remove(&self, rel_path: &str) -> bool {
        let Some(path) = self.resolve(rel_path) else {
            return false;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %rel_path, error = %e, "failed to remove task file");
                false
            }
        }
    }

    fn is_task_file(&self, path: &Path) -> bool {
        if path.extension().and_then(|s| s.to_str()) != Some("md") {
            return false;
        }
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
        !self.reserved_names.iter().any(|r| r == name)
    }
}

fn parse_task_file(path: &Path, rel_path: &str) -> anyhow::Result<ParsedTask> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let doc = frontmatter::decode(&raw)?;

    let status = match doc.get_str("status") {
        Some(s) => s.parse::<TaskStatus>().map_err(anyhow::Error::msg)?,
        None => status_from_body(&doc.body).unwrap_or_default(),
    };
    let priority = doc.get_str("priority").and_then(|p| match p.parse::<Priority>() {
        Ok(p) => Some(p),
        Err(e) => {
            debug!(path = %rel_path, error = %e, "ignoring priority");
            None
        }
    });
    let title = doc.get_str("title").unwrap_or_else(|| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_owned()
    });
    let updated_at = doc
        .get_str("updated_at")
        .and_then(|s| clock::parse(&s))
        .or_else(|| file_mtime(path));

    Ok(ParsedTask {
        file_path: rel_path.to_owned(),
        title,
        status,
        priority,
        assignee: doc.get_str("assignee"),
        tags: doc.get_list("tags"),
        created_at: doc.get_str("created_at").and_then(|s| clock::parse(&s)),
        updated_at,
        artifacts: doc.get_list("artifacts"),
        content: doc.body,
    })
}

fn status_from_body(body: &str) -> Option<TaskStatus> {
    let re = BODY_STATUS.as_ref()?;
    let caps = re.captures(body)?;
    caps.get(1)?.as_str().parse().ok()
}

fn file_mtime(path: &Path) -> Option<OffsetDateTime> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(OffsetDateTime::from(modified))
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("md.tmp");
    std::fs::write(&tmp, contents.as_bytes())
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[test]
    fn scan_walks_in_lexical_order_and_skips_reserved() {
        let (dir, store) = store();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("b/two.md"), "---\ntitle: Two\n---\n").unwrap();
        std::fs::write(dir.path().join("a.md"), "---\ntitle: One\n---\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "# docs\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let scan = store.scan();
        let paths: Vec<&str> = scan.tasks.iter().map(|t| t.file_path.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "b/two.md"]);
        assert!(scan.skipped.is_empty());
        assert_eq!(scan.tasks[0].title, "One");
        assert_eq!(scan.tasks[0].status, TaskStatus::Todo);
    }

    #[test]
    fn status_falls_back_to_body_pattern() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("plain.md"), "Some notes\n\nstatus: Review\n").unwrap();
        let task = store.read("plain.md").unwrap();
        assert_eq!(task.status, TaskStatus::Review);
        assert_eq!(task.title, "plain");
    }

    #[test]
    fn file_opening_with_a_rule_is_still_a_task() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("notes.md"), "---\nMeeting notes\n\nStatus: review\n").unwrap();

        let scan = store.scan();
        assert!(scan.skipped.is_empty());
        assert_eq!(scan.tasks.len(), 1);
        assert_eq!(scan.tasks[0].file_path, "notes.md");
        assert_eq!(scan.tasks[0].status, TaskStatus::Review);
    }

    #[test]
    fn malformed_files_are_skipped_not_fatal() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("bad.md"), "---\nstatus: blocked\n---\n").unwrap();
        std::fs::write(dir.path().join("broken.md"), "---\ntitle: [x\n---\n").unwrap();
        std::fs::write(dir.path().join("good.md"), "---\nstatus: done\n---\n").unwrap();

        let scan = store.scan();
        assert_eq!(scan.tasks.len(), 1);
        assert_eq!(scan.tasks[0].status, TaskStatus::Done);
        let skipped: Vec<&str> = scan.skipped.iter().map(|s| s.file_path.as_str()).collect();
        assert_eq!(skipped, vec!["bad.md", "broken.md"]);
    }

    #[test]
    fn write_preserves_body_and_unknown_keys() {
        let (dir, store) = store();
        std::fs::write(
            dir.path().join("t.md"),
            "---\ntitle: T\nstatus: todo\nestimate: 3d\n---\n\nKeep this body.\n",
        )
        .unwrap();

        let fields = FileFields {
            status: TaskStatus::Done,
            updated_at: clock::now(),
            priority: None,
            assignee: Some("ana".to_owned()),
            artifacts: Some(vec!["a.txt".to_owned(), "b.txt".to_owned()]),
        };
        assert!(store.write("t.md", &fields));

        let raw = std::fs::read_to_string(dir.path().join("t.md")).unwrap();
        assert!(raw.contains("status: done"));
        assert!(raw.contains("estimate: 3d"));
        assert!(raw.ends_with("\nKeep this body.\n"));
        let task = store.read("t.md").unwrap();
        assert_eq!(task.artifacts, vec!["a.txt", "b.txt"]);
        assert_eq!(task.assignee.as_deref(), Some("ana"));
        assert_eq!(task.priority, None);
        assert!(!dir.path().join("t.md.tmp").exists());
    }

    #[test]
    fn create_refuses_existing_files_unless_overwriting() {
        let (dir, store) = store();
        let new = NewTaskFile {
            title: "Write docs".to_owned(),
            body: "Explain things".to_owned(),
            priority: Some(Priority::High),
            assignee: None,
        };
        assert!(store.create("docs/write_docs.md", &new, false));
        assert!(!store.create("docs/write_docs.md", &new, false));
        assert!(store.create("docs/write_docs.md", &new, true));
        assert!(!store.create("../escape.md", &new, false));

        let task = store.read("docs/write_docs.md").unwrap();
        assert_eq!(task.title, "Write docs");
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.priority, Some(Priority::High));
        assert_eq!(task.content, "Explain things");
        assert!(task.created_at.is_some());
        assert!(dir.path().join("docs").is_dir());
    }
}
