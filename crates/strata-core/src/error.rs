use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::Level;

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    TaskNotFound,
    ParentNotFound,
    CycleDetected,
    InvalidLevelAdjacency,
    MaxDepthExceeded,
    ImmutableFieldChange,
    InvalidField,
    MalformedDocument,
    CorruptIndex,
    StorageUnavailable,
    Busy,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::TaskNotFound => "E2001",
            Self::ParentNotFound => "E2002",
            Self::CycleDetected => "E2003",
            Self::InvalidLevelAdjacency => "E2004",
            Self::MaxDepthExceeded => "E2005",
            Self::ImmutableFieldChange => "E2006",
            Self::InvalidField => "E2007",
            Self::MalformedDocument => "E3001",
            Self::CorruptIndex => "E3002",
            Self::StorageUnavailable => "E5001",
            Self::Busy => "E5002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::TaskNotFound => "Task not found",
            Self::ParentNotFound => "Parent task not found",
            Self::CycleDetected => "Move would create a cycle",
            Self::InvalidLevelAdjacency => "Invalid level adjacency",
            Self::MaxDepthExceeded => "Maximum hierarchy depth exceeded",
            Self::ImmutableFieldChange => "Immutable field change",
            Self::InvalidField => "Invalid field value",
            Self::MalformedDocument => "Malformed task document",
            Self::CorruptIndex => "Corrupt SQLite index",
            Self::StorageUnavailable => "Task storage unavailable",
            Self::Busy => "Store busy",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in config.toml and retry."),
            Self::TaskNotFound | Self::ParentNotFound => None,
            Self::CycleDetected => Some("Pick a parent outside the task's own subtree."),
            Self::InvalidLevelAdjacency => {
                Some("Parents must be exactly one level up: master > epic > task > subtask.")
            }
            Self::MaxDepthExceeded => Some("Subtasks cannot have children."),
            Self::ImmutableFieldChange => Some("Create a new task instead of changing id or level."),
            Self::InvalidField => None,
            Self::MalformedDocument => {
                Some("Fix the front matter of the task file; it is skipped until then.")
            }
            Self::CorruptIndex => Some("Run `st rebuild` to regenerate the index from task files."),
            Self::StorageUnavailable => Some("Check disk space and write permissions."),
            Self::Busy => Some("Retry after the other process releases the project lock."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[allow(clippy::ref_option)]
fn describe_parent(parent: &Option<Level>) -> String {
    match parent {
        None => "the project root".to_string(),
        Some(Level::Epic) => "an epic".to_string(),
        Some(level) => format!("a {level}"),
    }
}

/// Errors returned by the task store.
///
/// Validation variants are returned before anything is written. I/O variants
/// abort a mutation before the index is touched.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: '{0}'")]
    TaskNotFound(String),

    #[error("parent task not found: '{0}'")]
    ParentNotFound(String),

    #[error("moving '{task_id}' under '{proposed_parent}' would create a cycle")]
    CycleDetected {
        task_id: String,
        proposed_parent: String,
    },

    #[error("{child} cannot be placed under {}", describe_parent(.parent))]
    InvalidLevelAdjacency { child: Level, parent: Option<Level> },

    #[error("hierarchy depth would exceed {max} levels")]
    MaxDepthExceeded { max: usize },

    #[error("field '{0}' cannot be changed after creation")]
    ImmutableFieldChange(&'static str),

    #[error("invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("malformed task document {}: {reason}", .path.display())]
    MalformedDocument { path: PathBuf, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("store busy: lock {} not acquired within {waited:?}", .path.display())]
    Busy { path: PathBuf, waited: Duration },

    #[error("storage unavailable: {context}: {source}")]
    StorageUnavailable {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("index error: {0:#}")]
    Index(#[from] anyhow::Error),

    #[error("store writer has shut down")]
    Closed,
}

impl StoreError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::TaskNotFound(_) => ErrorCode::TaskNotFound,
            Self::ParentNotFound(_) => ErrorCode::ParentNotFound,
            Self::CycleDetected { .. } => ErrorCode::CycleDetected,
            Self::InvalidLevelAdjacency { .. } => ErrorCode::InvalidLevelAdjacency,
            Self::MaxDepthExceeded { .. } => ErrorCode::MaxDepthExceeded,
            Self::ImmutableFieldChange(_) => ErrorCode::ImmutableFieldChange,
            Self::InvalidField { .. } => ErrorCode::InvalidField,
            Self::MalformedDocument { .. } => ErrorCode::MalformedDocument,
            Self::Config(_) => ErrorCode::ConfigParseError,
            Self::Busy { .. } => ErrorCode::Busy,
            Self::StorageUnavailable { .. } => ErrorCode::StorageUnavailable,
            Self::Index(_) => ErrorCode::CorruptIndex,
            Self::Closed => ErrorCode::InternalUnexpected,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// Validation errors are the caller's to fix; everything else is the store's.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound(_)
                | Self::ParentNotFound(_)
                | Self::CycleDetected { .. }
                | Self::InvalidLevelAdjacency { .. }
                | Self::MaxDepthExceeded { .. }
                | Self::ImmutableFieldChange(_)
                | Self::InvalidField { .. }
        )
    }

    /// Lock contention and I/O failures may clear up without any change to the input.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::StorageUnavailable { .. })
    }

    pub(crate) fn storage(context: impl Into<String>, source: io::Error) -> Self {
        Self::StorageUnavailable {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
