//! Task document format: YAML front matter plus a Markdown body.
//!
//! ```text
//! ---
//! id: tk-3f9a2c1b0e
//! level: task
//! ...
//! ---
//!
//! # Build API
//!
//! ## Description
//!
//! ## Checklist
//!
//! - [ ] write handler
//!
//! ## Activity Log
//!
//! - 2026-10-19T10:00:00.123456Z | created | level=task
//! ```
//!
//! Section boundaries are level-2 headings with a reserved name, located with
//! `pulldown-cmark` so that headings inside code fences do not split sections.

use chrono::{DateTime, SecondsFormat, Utc};
use pulldown_cmark::{Event, HeadingLevel, Parser, Tag, TagEnd};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::ops::Range;

use crate::model::task::normalize_description;
use crate::model::{ActivityEntry, ChecklistItem, Level, Priority, Status, Task};

const FENCE: &str = "---";

const DESCRIPTION: &str = "Description";
const CHECKLIST: &str = "Checklist";
const ACTIVITY: &str = "Activity Log";

/// Reasons a document cannot be turned back into a task.
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("document does not start with a front matter block")]
    MissingFrontMatter,

    #[error("front matter block is not terminated")]
    UnterminatedFrontMatter,

    #[error("invalid front matter: {0}")]
    FrontMatter(#[from] serde_yaml::Error),

    #[error("invalid value for '{field}': {reason}")]
    Field { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FrontMatter {
    id: String,
    level: Level,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    path: String,
    path_order: u32,
    project: String,
    title: String,
    status: Status,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    estimated_hours: Option<f64>,
    #[serde(default)]
    actual_hours: Option<f64>,
    #[serde(default)]
    completion_percentage: u8,
    #[serde(default)]
    dependencies: BTreeSet<String>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Description,
    Checklist,
    Activity,
}

impl Section {
    fn from_heading(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.eq_ignore_ascii_case(DESCRIPTION) {
            Some(Self::Description)
        } else if text.eq_ignore_ascii_case(CHECKLIST) {
            Some(Self::Checklist)
        } else if text.eq_ignore_ascii_case(ACTIVITY) {
            Some(Self::Activity)
        } else {
            None
        }
    }
}

/// Whether `description` reads back unchanged from a rendered document.
///
/// Text that moves a section boundary, such as an unclosed code fence or a
/// setext `Checklist` heading, cannot be stored as a description.
#[must_use]
pub fn description_round_trips(description: &str) -> bool {
    let expected = normalize_description(description);
    let mut text = String::new();
    write_body(&mut text, "-", &expected, &[], &[]);
    let body = read_body(&text);
    body.description == expected && body.checklist.is_empty() && body.activity_log.is_empty()
}

/// Serialize a task into its document text.
///
/// # Errors
///
/// Returns [`DocError::FrontMatter`] if the front matter cannot be encoded.
pub fn render(task: &Task) -> Result<String, DocError> {
    let front = FrontMatter {
        id: task.id.clone(),
        level: task.level,
        parent_id: task.parent_id.clone(),
        path: task.path.clone(),
        path_order: task.path_order,
        project: task.project.clone(),
        title: task.title.clone(),
        status: task.status,
        priority: task.priority,
        tags: task.tags.clone(),
        estimated_hours: task.estimated_hours,
        actual_hours: task.actual_hours,
        completion_percentage: task.completion_percentage,
        dependencies: task.dependencies.clone(),
        metadata: task.metadata.clone(),
        created_at: task.created_at,
        updated_at: task.updated_at,
    };
    let yaml = serde_yaml::to_string(&front)?;

    let mut out = String::with_capacity(yaml.len() + 256);
    out.push_str(FENCE);
    out.push('\n');
    out.push_str(&yaml);
    if !yaml.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(FENCE);
    out.push('\n');

    write_body(
        &mut out,
        &task.title,
        &task.description,
        &task.checklist,
        &task.activity_log,
    );
    Ok(out)
}

fn write_body(
    out: &mut String,
    title: &str,
    description: &str,
    checklist: &[ChecklistItem],
    activity_log: &[ActivityEntry],
) {
    let _ = write!(out, "\n# {title}\n\n## {DESCRIPTION}\n\n");
    if !description.is_empty() {
        out.push_str(description);
        out.push_str("\n\n");
    }

    let _ = write!(out, "## {CHECKLIST}\n\n");
    if !checklist.is_empty() {
        for item in checklist {
            let mark = if item.done { 'x' } else { ' ' };
            let _ = writeln!(out, "- [{mark}] {}", item.text);
        }
        out.push('\n');
    }

    let _ = write!(out, "## {ACTIVITY}\n\n");
    for entry in activity_log {
        let at = entry.at.to_rfc3339_opts(SecondsFormat::Micros, true);
        if entry.detail.is_empty() {
            let _ = writeln!(out, "- {at} | {}", entry.action);
        } else {
            let _ = writeln!(out, "- {at} | {} | {}", entry.action, entry.detail);
        }
    }
}

/// Parse document text back into a task.
///
/// # Errors
///
/// Returns a [`DocError`] when the front matter is missing, unterminated, not
/// valid YAML, or holds out-of-range values.
pub fn parse(text: &str) -> Result<Task, DocError> {
    let text = text.replace("\r\n", "\n");
    let (yaml, body) = split_front_matter(&text)?;
    let front: FrontMatter = serde_yaml::from_str(yaml)?;

    if front.path_order == 0 {
        return Err(DocError::Field {
            field: "path_order",
            reason: "must be at least 1".to_string(),
        });
    }
    if front.completion_percentage > 100 {
        return Err(DocError::Field {
            field: "completion_percentage",
            reason: format!("{} is above 100", front.completion_percentage),
        });
    }
    if front.id.trim().is_empty() {
        return Err(DocError::Field {
            field: "id",
            reason: "must not be empty".to_string(),
        });
    }

    let body = read_body(body);

    Ok(Task {
        id: front.id,
        level: front.level,
        parent_id: front.parent_id,
        path: front.path,
        path_order: front.path_order,
        project: front.project,
        title: front.title,
        description: body.description,
        status: front.status,
        priority: front.priority,
        tags: front.tags,
        estimated_hours: front.estimated_hours,
        actual_hours: front.actual_hours,
        completion_percentage: front.completion_percentage,
        dependencies: front.dependencies,
        checklist: body.checklist,
        metadata: front.metadata,
        created_at: front.created_at,
        updated_at: front.updated_at,
        activity_log: body.activity_log,
    })
}

struct Body {
    description: String,
    checklist: Vec<ChecklistItem>,
    activity_log: Vec<ActivityEntry>,
}

fn read_body(body: &str) -> Body {
    let mut description = String::new();
    let mut checklist = Vec::new();
    let mut activity_log = Vec::new();

    for (section, range) in sections(body) {
        let content = &body[range];
        match section {
            Section::Description => {
                if !description.is_empty() {
                    description.push('\n');
                }
                description.push_str(content);
            }
            Section::Checklist => checklist.extend(content.lines().filter_map(parse_checklist_line)),
            Section::Activity => activity_log.extend(content.lines().filter_map(parse_activity_line)),
        }
    }

    Body {
        description: normalize_description(&description),
        checklist,
        activity_log,
    }
}

fn split_front_matter(text: &str) -> Result<(&str, &str), DocError> {
    let rest = text
        .strip_prefix("---\n")
        .ok_or(DocError::MissingFrontMatter)?;

    if let Some(body) = rest.strip_prefix("---\n") {
        return Ok(("", body));
    }

    let end = rest
        .find("\n---\n")
        .map(|i| (i + 1, i + 5))
        .or_else(|| rest.strip_suffix("\n---").map(|head| (head.len() + 1, rest.len())))
        .ok_or(DocError::UnterminatedFrontMatter)?;

    Ok((&rest[..end.0], &rest[end.1..]))
}

/// Content ranges of the reserved sections, in document order.
fn sections(body: &str) -> Vec<(Section, Range<usize>)> {
    let mut headings: Vec<(Section, Range<usize>)> = Vec::new();
    let mut current: Option<(usize, String)> = None;

    for (event, range) in Parser::new(body).into_offset_iter() {
        match event {
            Event::Start(Tag::Heading {
                level: HeadingLevel::H2,
                ..
            }) => current = Some((range.start, String::new())),
            Event::Text(text) | Event::Code(text) => {
                if let Some((_, buf)) = current.as_mut() {
                    buf.push_str(&text);
                }
            }
            Event::End(TagEnd::Heading(HeadingLevel::H2)) => {
                if let Some((start, buf)) = current.take() {
                    if let Some(section) = Section::from_heading(&buf) {
                        headings.push((section, start..range.end));
                    }
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::with_capacity(headings.len());
    for (i, (section, heading)) in headings.iter().enumerate() {
        let end = headings
            .get(i + 1)
            .map_or(body.len(), |(_, next)| next.start);
        out.push((*section, heading.end..end.max(heading.end)));
    }
    out
}

fn parse_checklist_line(line: &str) -> Option<ChecklistItem> {
    let rest = line.trim();
    let rest = rest
        .strip_prefix("- ")
        .or_else(|| rest.strip_prefix("* "))?
        .trim_start();
    let (done, text) = if let Some(text) = rest.strip_prefix("[ ]") {
        (false, text)
    } else if let Some(text) = rest
        .strip_prefix("[x]")
        .or_else(|| rest.strip_prefix("[X]"))
    {
        (true, text)
    } else {
        return None;
    };
    Some(ChecklistItem::new(text, done))
}

fn parse_activity_line(line: &str) -> Option<ActivityEntry> {
    let rest = line.trim().strip_prefix("- ")?;
    let mut parts = rest.splitn(3, '|').map(str::trim);
    let at = parts.next()?;
    let action = parts.next()?;
    let detail = parts.next().unwrap_or("");

    match DateTime::parse_from_rfc3339(at) {
        Ok(at) if !action.is_empty() => Some(ActivityEntry {
            action: action.to_string(),
            at: at.with_timezone(&Utc),
            detail: detail.to_string(),
        }),
        _ => {
            tracing::debug!(line, "ignoring unparseable activity line");
            None
        }
    }
}
