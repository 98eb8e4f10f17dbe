//! Field validation shared by API mutations and reconciled hand edits.

use std::collections::BTreeSet;

use crate::doc::description_round_trips;
use crate::error::{Result, StoreError};
use crate::model::task::{normalize_description, single_line};
use crate::model::{ChecklistItem, Level, Task, TaskChanges};

pub(crate) fn title(raw: &str) -> Result<String> {
    let title = single_line(raw);
    if title.is_empty() {
        return Err(StoreError::invalid("title", "must not be empty"));
    }
    Ok(title)
}

pub(crate) fn description(raw: &str) -> Result<String> {
    if !description_round_trips(raw) {
        return Err(StoreError::invalid(
            "description",
            "would split the document sections (unclosed code fence or reserved heading)",
        ));
    }
    Ok(normalize_description(raw))
}

pub(crate) fn hours(field: &'static str, value: Option<f64>) -> Result<Option<f64>> {
    match value {
        Some(h) if !h.is_finite() || h < 0.0 => Err(StoreError::invalid(
            field,
            format!("must be a non-negative number, got {h}"),
        )),
        other => Ok(other),
    }
}

pub(crate) fn tags(raw: &BTreeSet<String>) -> Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    for tag in raw {
        let tag = single_line(tag);
        if tag.is_empty() {
            return Err(StoreError::invalid("tags", "tags must not be blank"));
        }
        out.insert(tag);
    }
    Ok(out)
}

pub(crate) fn completion(level: Level, value: u8) -> Result<u8> {
    if level.has_derived_completion() {
        return Err(StoreError::invalid(
            "completion_percentage",
            format!("derived from children for {level}; only subtasks accept it"),
        ));
    }
    if value > 100 {
        return Err(StoreError::invalid(
            "completion_percentage",
            format!("must be between 0 and 100, got {value}"),
        ));
    }
    Ok(value)
}

pub(crate) fn dependencies(task_id: &str, raw: &BTreeSet<String>) -> Result<BTreeSet<String>> {
    let deps: BTreeSet<String> = raw
        .iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect();
    if deps.contains(task_id) {
        return Err(StoreError::invalid(
            "dependencies",
            "a task cannot depend on itself",
        ));
    }
    Ok(deps)
}

pub(crate) fn checklist(raw: &[ChecklistItem]) -> Vec<ChecklistItem> {
    raw.iter()
        .map(|item| ChecklistItem::new(item.text.clone(), item.done))
        .filter(|item| !item.text.is_empty())
        .collect()
}

/// Check a whole task as parsed from a document.
pub(crate) fn document(task: &Task) -> Result<()> {
    title(&task.title)?;
    description(&task.description)?;
    hours("estimated_hours", task.estimated_hours)?;
    hours("actual_hours", task.actual_hours)?;
    tags(&task.tags)?;
    dependencies(&task.id, &task.dependencies)?;
    if task.completion_percentage > 100 {
        return Err(StoreError::invalid(
            "completion_percentage",
            format!("must be between 0 and 100, got {}", task.completion_percentage),
        ));
    }
    Ok(())
}

/// Apply `changes` to `task`, returning the names of fields that changed.
///
/// Nothing is modified when an error is returned.
pub(crate) fn apply_changes(task: &mut Task, changes: &TaskChanges) -> Result<Vec<&'static str>> {
    if let Some(id) = &changes.id {
        if *id != task.id {
            return Err(StoreError::ImmutableFieldChange("id"));
        }
    }
    if let Some(level) = changes.level {
        if level != task.level {
            return Err(StoreError::ImmutableFieldChange("level"));
        }
    }

    let mut next = task.clone();
    if let Some(raw) = &changes.title {
        next.title = title(raw)?;
    }
    if let Some(raw) = &changes.description {
        next.description = description(raw)?;
    }
    if let Some(status) = changes.status {
        next.status = status;
    }
    if let Some(priority) = changes.priority {
        next.priority = priority;
    }
    if let Some(raw) = &changes.tags {
        next.tags = tags(raw)?;
    }
    if let Some(value) = changes.estimated_hours {
        next.estimated_hours = hours("estimated_hours", value)?;
    }
    if let Some(value) = changes.actual_hours {
        next.actual_hours = hours("actual_hours", value)?;
    }
    match changes.completion_percentage {
        Some(value) => next.completion_percentage = completion(next.level, value)?,
        None => {
            if next.level == Level::Subtask && next.status.is_done() && !task.status.is_done() {
                next.completion_percentage = 100;
            }
        }
    }
    if let Some(raw) = &changes.dependencies {
        next.dependencies = dependencies(&next.id, raw)?;
    }
    if let Some(raw) = &changes.checklist {
        next.checklist = checklist(raw);
    }
    if let Some(metadata) = &changes.metadata {
        next.metadata.clone_from(metadata);
    }

    let changed = changed_fields(task, &next);
    *task = next;
    Ok(changed)
}

/// Names of the user-editable fields that differ between two versions.
pub(crate) fn changed_fields(before: &Task, after: &Task) -> Vec<&'static str> {
    let mut out = Vec::new();
    let mut check = |name: &'static str, differs: bool| {
        if differs {
            out.push(name);
        }
    };
    check("parent_id", before.parent_id != after.parent_id);
    check("title", before.title != after.title);
    check("description", before.description != after.description);
    check("status", before.status != after.status);
    check("priority", before.priority != after.priority);
    check("tags", before.tags != after.tags);
    check("estimated_hours", before.estimated_hours != after.estimated_hours);
    check("actual_hours", before.actual_hours != after.actual_hours);
    check(
        "completion_percentage",
        before.completion_percentage != after.completion_percentage,
    );
    check("dependencies", before.dependencies != after.dependencies);
    check("checklist", before.checklist != after.checklist);
    check("metadata", before.metadata != after.metadata);
    out
}
