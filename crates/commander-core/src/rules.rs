//! Priority-ordered recommendation of the single next operator action.

use serde::Serialize;

use crate::model::{RunState, State, TaskColumn};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NextAction {
    /// Command line the operator should run next.
    pub action: String,
    pub why: String,
    /// What the world looks like once the action is done.
    pub done: String,
}

impl NextAction {
    fn new(action: impl Into<String>, why: impl Into<String>, done: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            why: why.into(),
            done: done.into(),
        }
    }
}

/// First matching rule wins. Reads only the given snapshot.
pub fn compute_next_action(state: &State) -> NextAction {
    if let Some(run) = state.runs.iter().find(|r| r.state == RunState::Finished) {
        let project = state
            .project(&run.project_id)
            .map(|p| p.name.as_str())
            .unwrap_or("unknown");
        return NextAction::new(
            format!("commander clean {}", run.run_name),
            format!(
                "Run '{}' in {} is finished and should be cleaned up",
                run.run_name, project
            ),
            "Worktree deleted, run marked as cleaned",
        );
    }

    if state.focus_project_id.is_none() {
        if state.projects.is_empty() {
            return NextAction::new(
                "commander start <run-name>",
                "No projects exist. Start your first run to create a project.",
                "New worktree created, project registered, run started",
            );
        }
        return NextAction::new(
            "commander focus set <project-id>",
            "No focus project set. Choose a project to focus on.",
            "Focus project set, subsequent commands target this project",
        );
    }

    if let Some(task) = state
        .tasks
        .iter()
        .find(|t| matches!(t.column, TaskColumn::Doing | TaskColumn::Preview))
    {
        return NextAction::new(
            format!("# Work on task: {}", task.title),
            format!(
                "Task '{}' is in {} - continue implementation",
                task.title,
                task.column.as_str().to_uppercase()
            ),
            "Task completed, move to 'done' or 'preview'",
        );
    }

    if let Some(task) = state.tasks.iter().find(|t| t.column == TaskColumn::Todo) {
        return NextAction::new(
            "commander start <run-name>",
            format!("Task '{}' is ready to start", task.title),
            "Run started, task moved to 'doing'",
        );
    }

    if let Some(item) = state.inbox.first() {
        return NextAction::new(
            format!("commander inbox promote {}", state.inbox_display_id(item)),
            format!(
                "Inbox has {} item(s). Promote to create tasks.",
                state.inbox.len()
            ),
            "Inbox item converted to task in focus project",
        );
    }

    let project = state
        .focus_project()
        .map(|p| p.name.as_str())
        .unwrap_or("unknown");
    NextAction::new(
        format!("commander start <run-name> --project {project}"),
        "No active tasks or inbox items. Start a new run to begin work.",
        format!("New run started for {project}"),
    )
}
