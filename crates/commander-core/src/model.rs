use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::home::{new_id, now_rfc3339};

pub const PROMOTED_TITLE_LIMIT: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("{collection} contains an entity with an empty id")]
    EmptyId { collection: &'static str },
    #[error("{collection} contains duplicate id {id}")]
    DuplicateId { collection: &'static str, id: String },
    #[error("Project '{0}' not found")]
    ProjectNotFound(String),
    #[error("Run '{0}' not found")]
    RunNotFound(String),
    #[error("Run name '{0}' already exists")]
    DuplicateRunName(String),
    #[error("Invalid run name '{0}': use letters, digits, '.', '_' or '-'")]
    InvalidRunName(String),
    #[error("Task '{0}' not found")]
    TaskNotFound(String),
    #[error("Task prefix '{0}' is ambiguous")]
    AmbiguousTask(String),
    #[error("Inbox item '{0}' not found")]
    InboxItemNotFound(String),
    #[error("Inbox item prefix '{0}' is ambiguous")]
    AmbiguousInboxItem(String),
    #[error("No focus project set")]
    NoFocus,
    #[error("Inbox text must not be empty")]
    EmptyText,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Finished,
    Cleaned,
    Missing,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Finished => "finished",
            RunState::Cleaned => "cleaned",
            RunState::Missing => "missing",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskColumn {
    Todo,
    Doing,
    Preview,
    Blocked,
    Done,
}

impl TaskColumn {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskColumn::Todo => "todo",
            TaskColumn::Doing => "doing",
            TaskColumn::Preview => "preview",
            TaskColumn::Blocked => "blocked",
            TaskColumn::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "todo" => Some(Self::Todo),
            "doing" => Some(Self::Doing),
            "preview" => Some(Self::Preview),
            "blocked" => Some(Self::Blocked),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

impl fmt::Display for TaskColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub repo_path: String,
    pub status: String,
    pub last_touched_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub project_id: String,
    pub run_name: String,
    pub state: RunState,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub last_command: Option<String>,
    #[serde(default)]
    pub last_result: Option<String>,
    #[serde(default)]
    pub last_touched_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub column: TaskColumn,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InboxItem {
    pub id: String,
    pub text: String,
    pub created_at: String,
    #[serde(default)]
    pub triage_status: Option<String>,
}

impl InboxItem {
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

/// Aggregate root persisted as `state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct State {
    #[serde(default)]
    pub focus_project_id: Option<String>,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub runs: Vec<Run>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub inbox: Vec<InboxItem>,
}

/// Input for recording a provisioned run.
#[derive(Debug, Clone, Default)]
pub struct NewRun {
    pub project_id: String,
    pub run_name: String,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    pub last_command: Option<String>,
}

impl State {
    /// Ids must be non-empty and unique per collection. A dangling focus is allowed.
    pub fn validate(&self) -> Result<(), ModelError> {
        check_ids("projects", self.projects.iter().map(|p| p.id.as_str()))?;
        check_ids("runs", self.runs.iter().map(|r| r.id.as_str()))?;
        check_ids("tasks", self.tasks.iter().map(|t| t.id.as_str()))?;
        check_ids("inbox", self.inbox.iter().map(|i| i.id.as_str()))?;
        Ok(())
    }

    pub fn project(&self, id: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == id)
    }

    /// Match by id first, then by display name.
    pub fn project_by_ref(&self, reference: &str) -> Option<&Project> {
        let reference = reference.trim();
        self.project(reference)
            .or_else(|| self.projects.iter().find(|p| p.name == reference))
    }

    pub fn project_by_path(&self, path: &Path) -> Option<&Project> {
        let wanted = canonical_string(path);
        self.projects
            .iter()
            .find(|p| canonical_string(Path::new(&p.repo_path)) == wanted)
    }

    pub fn focus_project(&self) -> Option<&Project> {
        self.focus_project_id
            .as_deref()
            .and_then(|id| self.project(id))
    }

    pub fn run(&self, id: &str) -> Option<&Run> {
        self.runs.iter().find(|r| r.id == id)
    }

    pub fn run_by_name(&self, run_name: &str) -> Option<&Run> {
        self.runs.iter().find(|r| r.run_name == run_name)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn inbox_item(&self, id: &str) -> Option<&InboxItem> {
        self.inbox.iter().find(|i| i.id == id)
    }

    /// Exact id, or a unique (case-insensitive) id prefix as printed by the CLI.
    pub fn inbox_item_by_prefix(&self, prefix: &str) -> Result<&InboxItem, ModelError> {
        let prefix = prefix.trim();
        find_by_prefix(&self.inbox, prefix).map_err(|miss| match miss {
            PrefixMiss::Ambiguous => ModelError::AmbiguousInboxItem(prefix.to_string()),
            PrefixMiss::NotFound => ModelError::InboxItemNotFound(prefix.to_string()),
        })
    }

    pub fn task_by_prefix(&self, prefix: &str) -> Result<&Task, ModelError> {
        let prefix = prefix.trim();
        find_by_prefix(&self.tasks, prefix).map_err(|miss| match miss {
            PrefixMiss::Ambiguous => ModelError::AmbiguousTask(prefix.to_string()),
            PrefixMiss::NotFound => ModelError::TaskNotFound(prefix.to_string()),
        })
    }

    /// Prefix that `inbox_item_by_prefix` resolves back to `item`.
    pub fn inbox_display_id<'a>(&self, item: &'a InboxItem) -> &'a str {
        display_id(&self.inbox, item)
    }

    /// Prefix that `task_by_prefix` resolves back to `task`.
    pub fn task_display_id<'a>(&self, task: &'a Task) -> &'a str {
        display_id(&self.tasks, task)
    }

    /// Register a repository, reusing an existing project with the same path.
    pub fn register_project(&mut self, name: &str, repo_path: &Path) -> (Project, bool) {
        if let Some(existing) = self.project_by_path(repo_path) {
            return (existing.clone(), false);
        }
        let name = name.trim();
        let name = if name.is_empty() {
            repo_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("project")
                .to_string()
        } else {
            name.to_string()
        };
        let project = Project {
            id: new_id(),
            name,
            repo_path: canonical_string(repo_path),
            status: "active".to_string(),
            last_touched_at: now_rfc3339(),
        };
        self.projects.push(project.clone());
        (project, true)
    }

    pub fn set_focus(&mut self, reference: &str) -> Result<Project, ModelError> {
        let project = self
            .project_by_ref(reference)
            .cloned()
            .ok_or_else(|| ModelError::ProjectNotFound(reference.trim().to_string()))?;
        self.focus_project_id = Some(project.id.clone());
        Ok(project)
    }

    pub fn record_run(&mut self, input: NewRun) -> Result<Run, ModelError> {
        validate_run_name(&input.run_name)?;
        if self.project(&input.project_id).is_none() {
            return Err(ModelError::ProjectNotFound(input.project_id));
        }
        if self.run_by_name(&input.run_name).is_some() {
            return Err(ModelError::DuplicateRunName(input.run_name));
        }
        let now = now_rfc3339();
        let run = Run {
            id: new_id(),
            project_id: input.project_id.clone(),
            run_name: input.run_name,
            state: RunState::Running,
            worktree_path: input.worktree_path,
            branch_name: input.branch_name,
            last_command: input.last_command,
            last_result: None,
            last_touched_at: Some(now.clone()),
        };
        self.touch_project(&input.project_id, &now);
        self.runs.push(run.clone());
        Ok(run)
    }

    pub fn set_run_state(
        &mut self,
        run_name: &str,
        state: RunState,
        last_result: Option<&str>,
    ) -> Result<Run, ModelError> {
        let now = now_rfc3339();
        let run = self
            .runs
            .iter_mut()
            .find(|r| r.run_name == run_name)
            .ok_or_else(|| ModelError::RunNotFound(run_name.to_string()))?;
        run.state = state;
        if let Some(result) = last_result {
            run.last_result = Some(result.to_string());
        }
        run.last_touched_at = Some(now.clone());
        let run = run.clone();
        self.touch_project(&run.project_id, &now);
        Ok(run)
    }

    /// The only mutation that removes a run from state.
    pub fn forget_run(&mut self, run_name: &str) -> Result<Run, ModelError> {
        let index = self
            .runs
            .iter()
            .position(|r| r.run_name == run_name)
            .ok_or_else(|| ModelError::RunNotFound(run_name.to_string()))?;
        Ok(self.runs.remove(index))
    }

    pub fn capture(&mut self, text: &str) -> Result<InboxItem, ModelError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ModelError::EmptyText);
        }
        let item = InboxItem {
            id: new_id(),
            text: text.to_string(),
            created_at: now_rfc3339(),
            triage_status: None,
        };
        self.inbox.push(item.clone());
        Ok(item)
    }

    /// Convert an inbox item into a `todo` task owned by the focus project.
    pub fn promote_inbox(&mut self, reference: &str) -> Result<Task, ModelError> {
        let focus_id = self.focus_project_id.clone().ok_or(ModelError::NoFocus)?;
        if self.project(&focus_id).is_none() {
            return Err(ModelError::ProjectNotFound(focus_id));
        }
        let item = self.inbox_item_by_prefix(reference)?.clone();
        let task = Task {
            id: new_id(),
            project_id: focus_id,
            title: item.text.chars().take(PROMOTED_TITLE_LIMIT).collect(),
            column: TaskColumn::Todo,
            created_at: now_rfc3339(),
        };
        self.inbox.retain(|i| i.id != item.id);
        self.tasks.push(task.clone());
        Ok(task)
    }

    pub fn dismiss_inbox(&mut self, reference: &str) -> Result<InboxItem, ModelError> {
        let item = self.inbox_item_by_prefix(reference)?.clone();
        self.inbox.retain(|i| i.id != item.id);
        Ok(item)
    }

    pub fn add_task(&mut self, project_id: &str, title: &str) -> Result<Task, ModelError> {
        if self.project(project_id).is_none() {
            return Err(ModelError::ProjectNotFound(project_id.to_string()));
        }
        let task = Task {
            id: new_id(),
            project_id: project_id.to_string(),
            title: title.trim().to_string(),
            column: TaskColumn::Todo,
            created_at: now_rfc3339(),
        };
        self.tasks.push(task.clone());
        Ok(task)
    }

    pub fn move_task(&mut self, reference: &str, column: TaskColumn) -> Result<Task, ModelError> {
        let id = self.task_by_prefix(reference)?.id.clone();
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| ModelError::TaskNotFound(reference.to_string()))?;
        task.column = column;
        Ok(task.clone())
    }

    fn touch_project(&mut self, project_id: &str, now: &str) {
        if let Some(project) = self.projects.iter_mut().find(|p| p.id == project_id) {
            project.last_touched_at = now.to_string();
        }
    }
}

pub fn validate_run_name(run_name: &str) -> Result<(), ModelError> {
    static RUN_NAME: OnceLock<Regex> = OnceLock::new();
    let re = RUN_NAME.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,99}$").expect("regex"));
    if re.is_match(run_name) {
        Ok(())
    } else {
        Err(ModelError::InvalidRunName(run_name.to_string()))
    }
}

/// First eight characters, the form shown to operators.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for InboxItem {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Task {
    fn key(&self) -> &str {
        &self.id
    }
}

enum PrefixMiss {
    NotFound,
    Ambiguous,
}

/// Exact id first, then a case-insensitive prefix that must match exactly one entry.
fn find_by_prefix<'a, T: Keyed>(items: &'a [T], reference: &str) -> Result<&'a T, PrefixMiss> {
    if let Some(item) = items.iter().find(|i| i.key() == reference) {
        return Ok(item);
    }
    let needle = reference.to_lowercase();
    if needle.is_empty() {
        return Err(PrefixMiss::NotFound);
    }
    let mut matches = items
        .iter()
        .filter(|i| i.key().to_lowercase().starts_with(&needle));
    match (matches.next(), matches.next()) {
        (Some(item), None) => Ok(item),
        (Some(_), Some(_)) => Err(PrefixMiss::Ambiguous),
        _ => Err(PrefixMiss::NotFound),
    }
}

/// The 8-character short id, extended until no sibling shares it.
fn display_id<'a, T: Keyed>(items: &[T], item: &'a T) -> &'a str {
    let id = item.key();
    let others: Vec<String> = items
        .iter()
        .map(|other| other.key())
        .filter(|other| *other != id)
        .map(str::to_lowercase)
        .collect();
    let ends = id
        .char_indices()
        .map(|(idx, _)| idx)
        .skip(8)
        .chain(std::iter::once(id.len()));
    for end in ends {
        let candidate = &id[..end];
        let needle = candidate.to_lowercase();
        if !others.iter().any(|other| other.starts_with(&needle)) {
            return candidate;
        }
    }
    id
}

pub(crate) fn canonical_string(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string()
}

fn check_ids<'a>(
    collection: &'static str,
    ids: impl Iterator<Item = &'a str>,
) -> Result<(), ModelError> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            return Err(ModelError::EmptyId { collection });
        }
        if !seen.insert(id) {
            return Err(ModelError::DuplicateId {
                collection,
                id: id.to_string(),
            });
        }
    }
    Ok(())
}
