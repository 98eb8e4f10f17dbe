use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::{fmt, str::FromStr};

/// The four hierarchy levels, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Master,
    Epic,
    Task,
    Subtask,
}

impl Level {
    pub const ALL: [Self; 4] = [Self::Master, Self::Epic, Self::Task, Self::Subtask];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Epic => "epic",
            Self::Task => "task",
            Self::Subtask => "subtask",
        }
    }

    /// One-based depth of this level in the hierarchy (`master` is 1).
    #[must_use]
    pub const fn depth(self) -> usize {
        match self {
            Self::Master => 1,
            Self::Epic => 2,
            Self::Task => 3,
            Self::Subtask => 4,
        }
    }

    /// The only level allowed as this level's parent (`None` for `master`).
    #[must_use]
    pub const fn parent_level(self) -> Option<Self> {
        match self {
            Self::Master => None,
            Self::Epic => Some(Self::Master),
            Self::Task => Some(Self::Epic),
            Self::Subtask => Some(Self::Task),
        }
    }

    /// Levels above `subtask` carry a derived completion percentage.
    #[must_use]
    pub const fn has_derived_completion(self) -> bool {
        !matches!(self, Self::Subtask)
    }

    pub(crate) const fn id_prefix(self) -> &'static str {
        match self {
            Self::Master => "ms",
            Self::Epic => "ep",
            Self::Task => "tk",
            Self::Subtask => "st",
        }
    }
}

/// Workflow status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Todo,
    InProgress,
    Done,
    Blocked,
}

impl Status {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Blocked => "blocked",
        }
    }

    #[must_use]
    pub const fn is_done(self) -> bool {
        matches!(self, Self::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

/// One line of a task's checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

impl ChecklistItem {
    #[must_use]
    pub fn new(text: impl Into<String>, done: bool) -> Self {
        Self {
            text: single_line(&text.into()),
            done,
        }
    }
}

/// Append-only record of a mutation applied to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub action: String,
    pub at: DateTime<Utc>,
    pub detail: String,
}

/// A node of the four-level hierarchy with all persisted fields.
///
/// The Markdown document on disk is the authoritative copy of this struct;
/// the index row is derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub level: Level,
    pub parent_id: Option<String>,
    pub path: String,
    pub path_order: u32,
    pub project: String,
    pub title: String,
    pub description: String,
    pub status: Status,
    pub priority: Priority,
    pub tags: BTreeSet<String>,
    pub estimated_hours: Option<f64>,
    pub actual_hours: Option<f64>,
    pub completion_percentage: u8,
    pub dependencies: BTreeSet<String>,
    pub checklist: Vec<ChecklistItem>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub activity_log: Vec<ActivityEntry>,
}

impl Task {
    /// Append an activity entry and bump `updated_at` to `at`.
    pub fn record(&mut self, action: &str, detail: impl AsRef<str>, at: DateTime<Utc>) {
        self.activity_log.push(ActivityEntry {
            action: action.to_string(),
            at,
            detail: single_line(detail.as_ref()),
        });
        if at > self.updated_at {
            self.updated_at = at;
        }
    }
}

/// Input for creating a task at a given level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub level: Level,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub estimated_hours: Option<f64>,
    #[serde(default)]
    pub actual_hours: Option<f64>,
    /// Only accepted for subtasks; other levels derive it.
    #[serde(default)]
    pub completion_percentage: Option<u8>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl NewTask {
    #[must_use]
    pub fn new(level: Level, title: impl Into<String>) -> Self {
        Self {
            level,
            parent_id: None,
            title: title.into(),
            description: String::new(),
            status: Status::default(),
            priority: Priority::default(),
            tags: BTreeSet::new(),
            estimated_hours: None,
            actual_hours: None,
            completion_percentage: None,
            dependencies: BTreeSet::new(),
            checklist: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn under(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub const fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Field changes accepted by `update`. `None` leaves a field untouched.
///
/// `id` and `level` exist so that callers passing them through are told the
/// change is not allowed instead of having it silently ignored.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskChanges {
    pub id: Option<String>,
    pub level: Option<Level>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub tags: Option<BTreeSet<String>>,
    pub estimated_hours: Option<Option<f64>>,
    pub actual_hours: Option<Option<f64>>,
    pub completion_percentage: Option<u8>,
    pub dependencies: Option<BTreeSet<String>>,
    pub checklist: Option<Vec<ChecklistItem>>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

impl TaskChanges {
    #[must_use]
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}

macro_rules! text_enum {
    ($ty:ident, $expected:literal, [$($variant:ident),+ $(,)?]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
                $(
                    if normalized == Self::$variant.as_str() {
                        return Ok(Self::$variant);
                    }
                )+
                Err(ParseEnumError {
                    expected: $expected,
                    got: s.to_string(),
                })
            }
        }
    };
}

text_enum!(Level, "level", [Master, Epic, Task, Subtask]);
text_enum!(Status, "status", [Todo, InProgress, Done, Blocked]);
text_enum!(Priority, "priority", [Low, Medium, High, Urgent]);

/// Collapse a string onto one line so it fits a list item in the document body.
pub(crate) fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trim blank lines around a description and trailing whitespace on each line.
pub(crate) fn normalize_description(text: &str) -> String {
    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    let start = lines.iter().position(|l| !l.is_empty()).unwrap_or(lines.len());
    let end = lines.iter().rposition(|l| !l.is_empty()).map_or(start, |i| i + 1);
    lines[start..end].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_adjacency_chain() {
        assert_eq!(Level::Master.parent_level(), None);
        assert_eq!(Level::Epic.parent_level(), Some(Level::Master));
        assert_eq!(Level::Task.parent_level(), Some(Level::Epic));
        assert_eq!(Level::Subtask.parent_level(), Some(Level::Task));
        assert_eq!(Level::Subtask.depth(), 4);
    }

    #[test]
    fn enums_parse_from_text() {
        assert_eq!("in-progress".parse::<Status>(), Ok(Status::InProgress));
        assert_eq!("EPIC".parse::<Level>(), Ok(Level::Epic));
        assert_eq!("urgent".parse::<Priority>(), Ok(Priority::Urgent));
        let err = "galaxy".parse::<Level>().unwrap_err();
        assert_eq!(err.to_string(), "invalid level: 'galaxy'");
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&Status::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn description_normalization_trims_blank_edges() {
        let raw = "\n\n  Objective:  \nship it\n\n\n";
        assert_eq!(normalize_description(raw), "  Objective:\nship it");
        assert_eq!(normalize_description("\n \n"), "");
    }

    #[test]
    fn checklist_text_is_single_line() {
        let item = ChecklistItem::new("write\nthe   handler", false);
        assert_eq!(item.text, "write the handler");
    }

    #[test]
    fn task_changes_detects_empty() {
        assert!(TaskChanges::default().is_empty());
        assert!(!TaskChanges::status(Status::Done).is_empty());
    }
}
