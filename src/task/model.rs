#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::core::clock;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Review,
    Done,
}

impl TaskStatus {
    pub const ALL: [Self; 4] = [Self::Todo, Self::InProgress, Self::Review, Self::Done];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "inprogress",
            Self::Review => "review",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "todo" => Ok(Self::Todo),
            "inprogress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            other => Err(format!(
                "unknown status '{other}' (expected todo|inprogress|review|done)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!(
                "unknown priority '{other}' (expected low|medium|high)"
            )),
        }
    }
}

/// One row of the task index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub status: TaskStatus,
    pub file_path: String,
    #[serde(with = "clock::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl TaskRecord {
    #[must_use]
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            id: Self::new_id(),
            title: String::new(),
            status: TaskStatus::Todo,
            file_path: file_path.into(),
            updated_at: clock::now(),
            assignee: None,
            priority: None,
            artifacts: Vec::new(),
        }
    }

    #[must_use]
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Applies a partial update and stamps `updated_at`, never moving it backwards.
    pub fn apply(&mut self, update: &TaskUpdate, now: OffsetDateTime) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(priority) = update.priority {
            self.priority = Some(priority);
        }
        if let Some(assignee) = update.assignee.as_ref() {
            self.assignee = Some(assignee.clone());
        }
        if let Some(artifacts) = update.artifacts.as_ref() {
            self.artifacts.clone_from(artifacts);
        }
        self.updated_at = self.updated_at.max(now);
    }
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
    pub artifacts: Option<Vec<String>>,
}

impl TaskUpdate {
    #[must_use]
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_and_displays() {
        for s in TaskStatus::ALL {
            assert_eq!(s.as_str().parse::<TaskStatus>().unwrap(), s);
        }
        assert_eq!(" InProgress ".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert!("blocked".parse::<TaskStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"inprogress\""
        );
    }

    #[test]
    fn apply_keeps_updated_at_monotonic() {
        let mut rec = TaskRecord::new("a.md");
        let later = rec.updated_at + time::Duration::seconds(10);
        rec.updated_at = later;

        let earlier = later - time::Duration::seconds(60);
        rec.apply(&TaskUpdate::status(TaskStatus::Review), earlier);
        assert_eq!(rec.status, TaskStatus::Review);
        assert_eq!(rec.updated_at, later);

        let update = TaskUpdate {
            artifacts: Some(vec!["out.txt".to_owned()]),
            assignee: Some("sam".to_owned()),
            ..TaskUpdate::default()
        };
        rec.apply(&update, later + time::Duration::seconds(1));
        assert_eq!(rec.artifacts, vec!["out.txt"]);
        assert_eq!(rec.assignee.as_deref(), Some("sam"));
        assert_eq!(rec.status, TaskStatus::Review);
        assert!(rec.updated_at > later);
    }

    #[test]
    fn record_serializes_timestamps_as_rfc3339() {
        let mut rec = TaskRecord::new("a.md");
        rec.updated_at = clock::parse("2025-06-22T10:00:00Z").unwrap();
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["updated_at"], "2025-06-22T10:00:00Z");
        let back: TaskRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, rec);
    }
}
