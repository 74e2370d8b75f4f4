mod signals;

use std::io;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{json, Value};
use tokio::task::JoinError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use commander_core::backend::{BackendError, GitHarnessBackend, WorkspaceBackend};
use commander_core::config::{load_config, resolve_harness_root_with_source, CommanderConfig};
use commander_core::doctor::{doctor_report, repair_state};
use commander_core::events::{read_events, session_events};
use commander_core::home::CommanderHome;
use commander_core::lock::ControllerLock;
use commander_core::model::{short_id, validate_run_name, ModelError, NewRun, RunState, State, TaskColumn};
use commander_core::reconcile::Reconciler;
use commander_core::rules::compute_next_action;
use commander_core::safety::{check_dirty_tree, validate_worktree_path, DirtyPolicy};
use commander_core::session::Session;
use commander_core::state::StateStore;

use crate::signals::{shutdown_signal, HeldLock, LockSlot};

#[derive(Parser)]
#[command(name = "commander", version, about = "Coordinate agent runs across git worktrees")]
struct Cli {
    /// Application home (default: ~/.cloud-harness)
    #[arg(long, env = "COMMANDER_HOME", global = true)]
    home: Option<PathBuf>,
    /// Repository whose runs/ directory holds the run worktrees
    #[arg(long, global = true)]
    harness_root: Option<PathBuf>,
    /// Displace a controller that is alive but hung
    #[arg(long, global = true)]
    force_takeover: bool,
    /// Machine-readable output
    #[arg(long, global = true)]
    json: bool,
    /// Raise diagnostic verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Emit diagnostics as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show controller, focus, active run and counts without taking the lock
    Status,
    /// Recommend the single next action
    Next,
    /// Show or change the focus project
    Focus {
        #[command(subcommand)]
        command: Option<FocusCommand>,
    },
    /// Capture and triage ideas
    Inbox {
        #[command(subcommand)]
        command: InboxCommand,
    },
    /// Manage tasks on the board
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Register repositories
    Project {
        #[command(subcommand)]
        command: ProjectCommand,
    },
    /// Provision a worktree for a new run and record it
    Start {
        run_name: String,
        #[arg(long, default_value = "main")]
        base: String,
        /// Project id or name (default: focus project)
        #[arg(long)]
        project: Option<String>,
    },
    /// Mark a run finished
    Finish { run_name: String },
    /// Remove a run's worktree and mark it cleaned
    Clean {
        run_name: String,
        /// Proceed even with uncommitted changes
        #[arg(long)]
        allow_dirty: bool,
        /// Also delete the run branch
        #[arg(long)]
        delete_branch: bool,
    },
    /// Drop a run from state without touching its workspace
    Forget { run_name: String },
    /// Align state with the runs on disk
    Reconcile {
        /// Ignore cached results
        #[arg(long)]
        force: bool,
    },
    /// Inspect the controller lock
    Lock {
        #[command(subcommand)]
        command: LockCommand,
    },
    /// Show recent audit events
    Events {
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Diagnose the home directory and harness root
    Doctor {
        /// Set an unreadable state file aside and rebuild from the backend
        #[arg(long)]
        repair_state: bool,
    },
}

#[derive(Subcommand)]
enum FocusCommand {
    Set { project: String },
}

#[derive(Subcommand)]
enum InboxCommand {
    Add {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    List,
    Promote { id: String },
    Dismiss { id: String },
}

#[derive(Subcommand)]
enum TaskCommand {
    Add {
        #[arg(required = true, num_args = 1..)]
        title: Vec<String>,
        #[arg(long)]
        project: Option<String>,
    },
    Move { id: String, column: String },
    List,
}

#[derive(Subcommand)]
enum ProjectCommand {
    Add {
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
        /// Make it the focus project
        #[arg(long)]
        focus: bool,
    },
    List,
}

#[derive(Subcommand)]
enum LockCommand {
    Status,
}

fn init_tracing(verbose: u8, json: bool) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_env("COMMANDER_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

enum Finished {
    Command(Result<Result<()>, JoinError>),
    Signal(io::Result<&'static str>),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let slot = LockSlot::default();
    let mut work = tokio::task::spawn_blocking({
        let slot = slot.clone();
        move || run(cli, slot)
    });

    let finished = tokio::select! {
        joined = &mut work => Finished::Command(joined),
        received = shutdown_signal() => Finished::Signal(received),
    };
    match finished {
        Finished::Command(joined) => joined.context("command task failed")?,
        Finished::Signal(Ok(name)) => {
            slot.release();
            eprintln!("commander: received {name}, controller lock released");
            std::process::exit(130);
        }
        Finished::Signal(Err(err)) => {
            warn!(error = %err, "signal handlers unavailable");
            work.await.context("command task failed")?
        }
    }
}

struct Ctx {
    home: CommanderHome,
    config: CommanderConfig,
    harness_root: PathBuf,
    harness_source: &'static str,
    force_takeover: bool,
    json: bool,
    slot: LockSlot,
}

impl Ctx {
    fn backend(&self) -> GitHarnessBackend {
        GitHarnessBackend::new(&self.harness_root)
    }

    fn reconciler(&self) -> Reconciler<GitHarnessBackend> {
        Reconciler::with_cache_window(self.backend(), self.config.reconcile_cache())
    }

    fn session(&self) -> Result<Session> {
        let session = Session::start(self.home.clone(), self.config.clone(), self.force_takeover)
            .context("start session")?;
        if let Some(handle) = session.lock_handle() {
            self.slot.hold(Some(HeldLock {
                handle,
                events: session.events().clone(),
            }));
        }
        Ok(session)
    }

    /// A session that may write, or an error explaining who holds the lock.
    fn controller(&self) -> Result<Session> {
        let session = self.session()?;
        if !session.is_controller() {
            let holder = session
                .holder()
                .map(|h| format!("pid {}", h.pid))
                .unwrap_or_else(|| "another session".to_string());
            bail!(
                "controller lock held by {holder} ({}); this session is read-only. \
                 Rerun with --force-takeover if that controller is hung",
                session.acquire_reason()
            );
        }
        Ok(session)
    }

    fn close(&self, session: Session) -> Result<()> {
        self.slot.clear();
        session.end()?;
        Ok(())
    }

    fn snapshot(&self) -> Result<State> {
        let mut store = StateStore::open(self.home.state_path());
        Ok(store.read_snapshot()?)
    }

    fn emit(&self, value: &Value, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }
}

/// Record the failure in the audit log before returning it.
fn checked<T, E>(session: &Session, command: &str, result: Result<T, E>) -> Result<T>
where
    E: Into<anyhow::Error>,
{
    match result {
        Ok(value) => Ok(value),
        Err(err) => {
            let err = err.into();
            session
                .events()
                .command_verify_fail(command, &format!("{err:#}"))?;
            Err(err)
        }
    }
}

fn run(cli: Cli, slot: LockSlot) -> Result<()> {
    let home = match cli.home.as_ref() {
        Some(path) => CommanderHome::at(path),
        None => CommanderHome::resolve()?,
    };
    let config = match load_config(&home) {
        Ok(config) => config,
        Err(err) if matches!(cli.command, Command::Doctor { .. }) => {
            warn!(error = %err, "config unusable, doctor runs with defaults");
            CommanderConfig::default()
        }
        Err(err) => return Err(err.into()),
    };
    let (harness_root, harness_source) =
        resolve_harness_root_with_source(cli.harness_root.as_deref(), &config);
    let harness_root = harness_root.canonicalize().unwrap_or(harness_root);
    let ctx = Ctx {
        home,
        config,
        harness_root,
        harness_source,
        force_takeover: cli.force_takeover,
        json: cli.json,
        slot,
    };

    match cli.command {
        Command::Status => status(&ctx),
        Command::Next => next(&ctx),
        Command::Focus { command } => match command {
            None => focus_show(&ctx),
            Some(FocusCommand::Set { project }) => focus_set(&ctx, &project),
        },
        Command::Inbox { command } => inbox(&ctx, command),
        Command::Task { command } => task(&ctx, command),
        Command::Project { command } => project(&ctx, command),
        Command::Start {
            run_name,
            base,
            project,
        } => start(&ctx, &run_name, &base, project.as_deref()),
        Command::Finish { run_name } => finish(&ctx, &run_name),
        Command::Clean {
            run_name,
            allow_dirty,
            delete_branch,
        } => clean(&ctx, &run_name, allow_dirty, delete_branch),
        Command::Forget { run_name } => forget(&ctx, &run_name),
        Command::Reconcile { force } => reconcile(&ctx, force),
        Command::Lock {
            command: LockCommand::Status,
        } => lock_status(&ctx),
        Command::Events { session, limit } => events(&ctx, session.as_deref(), limit),
        Command::Doctor { repair_state } => doctor(&ctx, repair_state),
    }
}

fn status(ctx: &Ctx) -> Result<()> {
    let state = ctx.snapshot()?;
    let lock = ControllerLock::new(&ctx.home)
        .with_heartbeat_timeout(ctx.config.heartbeat_timeout())
        .inspect()?;
    let focus = state.focus_project();
    let active_run = state
        .runs
        .iter()
        .filter(|r| r.state == RunState::Running)
        .find(|r| focus.map(|p| p.id == r.project_id).unwrap_or(true));
    let count_runs = |wanted: RunState| state.runs.iter().filter(|r| r.state == wanted).count();
    let controller = lock.lock.as_ref().map(|l| {
        json!({
            "pid": l.pid,
            "sessionId": l.session_id,
            "alive": lock.holder_alive,
            "active": lock.is_active(),
        })
    });

    let value = json!({
        "home": ctx.home.root().to_string_lossy(),
        "harnessRoot": ctx.harness_root.to_string_lossy(),
        "harnessRootSource": ctx.harness_source,
        "controller": controller,
        "focus": focus,
        "activeRun": active_run,
        "counts": {
            "projects": state.projects.len(),
            "running": count_runs(RunState::Running),
            "finished": count_runs(RunState::Finished),
            "missing": count_runs(RunState::Missing),
            "cleaned": count_runs(RunState::Cleaned),
            "tasks": state.tasks.len(),
            "inbox": state.inbox.len(),
        },
    });
    ctx.emit(&value, || {
        let controller = match lock.lock.as_ref() {
            Some(l) if lock.is_active() => format!("pid {} (active)", l.pid),
            Some(l) if !lock.holder_alive => format!("pid {} (dead, will be taken over)", l.pid),
            Some(l) => format!("pid {} (heartbeat stale or inconsistent)", l.pid),
            None => "none".to_string(),
        };
        let focus = focus
            .map(|p| format!("{} ({})", p.name, short_id(&p.id)))
            .unwrap_or_else(|| "none".to_string());
        let active = active_run
            .map(|r| r.run_name.clone())
            .unwrap_or_else(|| "none".to_string());
        format!(
            "Controller: {controller}\nFocus: {focus}\nActive run: {active}\n\
             Projects: {}  Runs: {} running, {} finished, {} missing  Tasks: {}  Inbox: {}",
            state.projects.len(),
            count_runs(RunState::Running),
            count_runs(RunState::Finished),
            count_runs(RunState::Missing),
            state.tasks.len(),
            state.inbox.len(),
        )
    })
}

fn next(ctx: &Ctx) -> Result<()> {
    let mut session = ctx.session()?;
    let drift = if session.is_controller() {
        Some(session.reconcile(&ctx.reconciler(), false)?)
    } else {
        None
    };
    let action = compute_next_action(session.state());
    let mode = session.mode();
    let holder_pid = session.holder().map(|h| h.pid);
    ctx.close(session)?;

    let value = json!({
        "mode": mode,
        "action": action.action,
        "why": action.why,
        "done": action.done,
        "drift": drift,
    });
    ctx.emit(&value, || {
        let mut text = format!(
            "Next: {}\nWhy: {}\nDone when: {}",
            action.action, action.why, action.done
        );
        if let Some(pid) = holder_pid.filter(|_| drift.is_none()) {
            text.push_str(&format!(
                "\n(read-only: controller pid {pid} holds the lock; showing last saved state)"
            ));
        }
        text
    })
}

fn focus_show(ctx: &Ctx) -> Result<()> {
    let state = ctx.snapshot()?;
    let focus = state.focus_project();
    ctx.emit(&json!({ "focus": focus }), || match focus {
        Some(p) => format!("Focus: {} ({}) {}", p.name, short_id(&p.id), p.repo_path),
        None => "No focus project set".to_string(),
    })
}

fn focus_set(ctx: &Ctx, reference: &str) -> Result<()> {
    let mut session = ctx.controller()?;
    let project = session.mutate("focus set", |state| Ok(state.set_focus(reference)?))?;
    ctx.close(session)?;
    ctx.emit(&json!({ "ok": true, "focus": project }), || {
        format!("Focus set to {} ({})", project.name, short_id(&project.id))
    })
}

fn inbox(ctx: &Ctx, command: InboxCommand) -> Result<()> {
    match command {
        InboxCommand::Add { text } => {
            let text = text.join(" ");
            let mut session = ctx.controller()?;
            let item = session.mutate("inbox add", |state| Ok(state.capture(&text)?))?;
            let shown = session.state().inbox_display_id(&item).to_string();
            ctx.close(session)?;
            ctx.emit(&json!({ "ok": true, "item": item, "ref": shown }), || {
                format!("Captured {shown}: {}", item.text)
            })
        }
        InboxCommand::List => {
            let state = ctx.snapshot()?;
            ctx.emit(&json!({ "inbox": state.inbox }), || {
                if state.inbox.is_empty() {
                    return "Inbox is empty".to_string();
                }
                state
                    .inbox
                    .iter()
                    .map(|i| format!("{}  {}", state.inbox_display_id(i), i.text))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        InboxCommand::Promote { id } => {
            let mut session = ctx.controller()?;
            let task = session.mutate("inbox promote", |state| Ok(state.promote_inbox(&id)?))?;
            ctx.close(session)?;
            ctx.emit(&json!({ "ok": true, "task": task }), || {
                format!("Promoted to task {}: {}", short_id(&task.id), task.title)
            })
        }
        InboxCommand::Dismiss { id } => {
            let mut session = ctx.controller()?;
            let item = session.mutate("inbox dismiss", |state| Ok(state.dismiss_inbox(&id)?))?;
            ctx.close(session)?;
            ctx.emit(&json!({ "ok": true, "dismissed": item }), || {
                format!("Dismissed {}", item.short_id())
            })
        }
    }
}

fn task(ctx: &Ctx, command: TaskCommand) -> Result<()> {
    match command {
        TaskCommand::Add { title, project } => {
            let title = title.join(" ");
            let mut session = ctx.controller()?;
            let task = session.mutate("task add", |state| {
                let project_id = match project.as_deref() {
                    Some(reference) => state
                        .project_by_ref(reference)
                        .map(|p| p.id.clone())
                        .ok_or_else(|| ModelError::ProjectNotFound(reference.to_string()))?,
                    None => state
                        .focus_project()
                        .map(|p| p.id.clone())
                        .ok_or(ModelError::NoFocus)?,
                };
                Ok(state.add_task(&project_id, &title)?)
            })?;
            ctx.close(session)?;
            ctx.emit(&json!({ "ok": true, "task": task }), || {
                format!("Added task {}: {}", short_id(&task.id), task.title)
            })
        }
        TaskCommand::Move { id, column } => {
            let column = TaskColumn::parse(&column).ok_or_else(|| {
                anyhow!("Unknown column '{column}' (todo, doing, preview, blocked, done)")
            })?;
            let mut session = ctx.controller()?;
            let task = session.mutate("task move", |state| Ok(state.move_task(&id, column)?))?;
            ctx.close(session)?;
            ctx.emit(&json!({ "ok": true, "task": task }), || {
                format!("Moved {} to {}", short_id(&task.id), task.column)
            })
        }
        TaskCommand::List => {
            let state = ctx.snapshot()?;
            ctx.emit(&json!({ "tasks": state.tasks }), || {
                if state.tasks.is_empty() {
                    return "No tasks".to_string();
                }
                state
                    .tasks
                    .iter()
                    .map(|t| {
                        let project = state
                            .project(&t.project_id)
                            .map(|p| p.name.as_str())
                            .unwrap_or("unknown");
                        format!(
                            "{}  [{}] {} ({project})",
                            state.task_display_id(t),
                            t.column,
                            t.title
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
    }
}

fn project(ctx: &Ctx, command: ProjectCommand) -> Result<()> {
    match command {
        ProjectCommand::Add { path, name, focus } => {
            let path = path
                .canonicalize()
                .with_context(|| format!("resolve project path {}", path.display()))?;
            let mut session = ctx.controller()?;
            let (project, created) = session.mutate("project add", |state| {
                let (project, created) = state.register_project(name.as_deref().unwrap_or(""), &path);
                if focus {
                    state.set_focus(&project.id)?;
                }
                Ok((project, created))
            })?;
            ctx.close(session)?;
            ctx.emit(
                &json!({ "ok": true, "created": created, "project": project }),
                || {
                    let verb = if created { "Registered" } else { "Already registered" };
                    format!("{verb} {} ({}) at {}", project.name, short_id(&project.id), project.repo_path)
                },
            )
        }
        ProjectCommand::List => {
            let state = ctx.snapshot()?;
            ctx.emit(&json!({ "projects": state.projects }), || {
                if state.projects.is_empty() {
                    return "No projects".to_string();
                }
                state
                    .projects
                    .iter()
                    .map(|p| {
                        let marker = if state.focus_project_id.as_deref() == Some(p.id.as_str()) {
                            "*"
                        } else {
                            " "
                        };
                        format!("{marker} {}  {}  {}", short_id(&p.id), p.name, p.repo_path)
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
    }
}

fn start(ctx: &Ctx, run_name: &str, base: &str, project: Option<&str>) -> Result<()> {
    validate_run_name(run_name)?;
    let mut session = ctx.controller()?;
    let reconciler = ctx.reconciler();
    session.reconcile(&reconciler, false)?;
    if session.state().run_by_name(run_name).is_some() {
        bail!("Run '{run_name}' already exists; use `commander forget {run_name}` to drop it");
    }
    if let Some(reference) = project {
        if session.state().project_by_ref(reference).is_none() {
            bail!(ModelError::ProjectNotFound(reference.to_string()));
        }
    }

    let backend = reconciler.backend();
    session.plan(
        "start",
        json!({
            "run": run_name,
            "base": base,
            "path": backend.run_dir(run_name).to_string_lossy(),
        }),
    )?;
    let provisioned = checked(&session, "start", backend.provision(run_name, base))?;

    let harness_root = ctx.harness_root.clone();
    let run = session.mutate("start", |state| {
        let project_id = match project {
            Some(reference) => state
                .project_by_ref(reference)
                .map(|p| p.id.clone())
                .ok_or_else(|| ModelError::ProjectNotFound(reference.to_string()))?,
            None => match state.focus_project() {
                Some(p) => p.id.clone(),
                None => {
                    let (p, _) = state.register_project("", &harness_root);
                    state.focus_project_id = Some(p.id.clone());
                    p.id
                }
            },
        };
        Ok(state.record_run(NewRun {
            project_id,
            run_name: run_name.to_string(),
            worktree_path: Some(provisioned.worktree_path.to_string_lossy().to_string()),
            branch_name: provisioned.branch.clone(),
            last_command: Some(format!("commander start {run_name}")),
        })?)
    })?;
    ctx.close(session)?;
    ctx.emit(&json!({ "ok": true, "run": run }), || {
        format!(
            "Started run {} on {} at {}",
            run.run_name,
            run.branch_name.as_deref().unwrap_or("?"),
            run.worktree_path.as_deref().unwrap_or("?")
        )
    })
}

fn finish(ctx: &Ctx, run_name: &str) -> Result<()> {
    let mut session = ctx.controller()?;
    let run = session.mutate("finish", |state| {
        Ok(state.set_run_state(run_name, RunState::Finished, Some("finished"))?)
    })?;
    match ctx.backend().set_status(run_name, "finished") {
        Ok(_) | Err(BackendError::NotFound(_)) => {}
        Err(err) => warn!(run = %run_name, error = %err, "could not update run metadata"),
    }
    ctx.close(session)?;
    ctx.emit(&json!({ "ok": true, "run": run }), || {
        format!("Run {} finished; next: commander clean {}", run.run_name, run.run_name)
    })
}

fn clean(ctx: &Ctx, run_name: &str, allow_dirty: bool, delete_branch: bool) -> Result<()> {
    let mut session = ctx.controller()?;
    let backend = ctx.backend();
    let run = session
        .state()
        .run_by_name(run_name)
        .cloned()
        .ok_or_else(|| ModelError::RunNotFound(run_name.to_string()))?;
    let path = run
        .worktree_path
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| backend.run_dir(run_name));

    let mut warning = None;
    let removed = if path.exists() {
        let projects: Vec<PathBuf> = session
            .state()
            .projects
            .iter()
            .map(|p| PathBuf::from(&p.repo_path))
            .collect();
        let safe = checked(
            &session,
            "clean",
            validate_worktree_path(&path, &backend.runs_dir(), &projects),
        )?;
        let policy = if allow_dirty {
            DirtyPolicy::Warn
        } else {
            DirtyPolicy::Refuse
        };
        let check = checked(&session, "clean", check_dirty_tree(&backend, &safe, policy))?;
        warning = check.warning;
        session.plan(
            "clean",
            json!({
                "run": run_name,
                "path": safe.to_string_lossy(),
                "deleteBranch": delete_branch,
            }),
        )?;
        checked(&session, "clean", backend.remove(run_name, &safe, delete_branch))?;
        true
    } else {
        false
    };

    let run = session.mutate("clean", |state| {
        Ok(state.set_run_state(run_name, RunState::Cleaned, Some("cleaned"))?)
    })?;
    ctx.close(session)?;
    ctx.emit(
        &json!({ "ok": true, "run": run, "removed": removed, "warning": warning }),
        || {
            let mut text = match removed {
                true => format!("Cleaned run {} and removed its worktree", run.run_name),
                false => format!("Cleaned run {} (worktree already gone)", run.run_name),
            };
            if let Some(warning) = warning.as_deref() {
                text = format!("warning: {warning}\n{text}");
            }
            text
        },
    )
}

fn forget(ctx: &Ctx, run_name: &str) -> Result<()> {
    let mut session = ctx.controller()?;
    let run = session.mutate("forget", |state| Ok(state.forget_run(run_name)?))?;
    ctx.close(session)?;
    ctx.emit(&json!({ "ok": true, "forgotten": run }), || {
        format!("Forgot run {}", run.run_name)
    })
}

fn reconcile(ctx: &Ctx, force: bool) -> Result<()> {
    let mut session = ctx.controller()?;
    let report = session.reconcile(&ctx.reconciler(), force)?;
    ctx.close(session)?;
    ctx.emit(&serde_json::to_value(&report)?, || {
        if !report.drift_detected {
            return "No drift".to_string();
        }
        format!(
            "Drift reconciled: {} run(s) adopted, {} updated, {} parked, {} project(s) added",
            report.runs_added, report.runs_updated, report.runs_parked, report.projects_added
        )
    })
}

fn lock_status(ctx: &Ctx) -> Result<()> {
    let status = ControllerLock::new(&ctx.home)
        .with_heartbeat_timeout(ctx.config.heartbeat_timeout())
        .inspect()?;
    ctx.emit(&serde_json::to_value(&status)?, || match status.lock.as_ref() {
        None => "Lock is free".to_string(),
        Some(lock) => format!(
            "Held by pid {} (session {}, since {})\nHolder alive: {}  Consistent: {}  Heartbeat: {}",
            lock.pid,
            short_id(&lock.session_id),
            lock.start_time,
            status.holder_alive,
            status.consistent,
            status
                .heartbeat
                .as_ref()
                .map(|hb| {
                    let stale = if status.heartbeat_stale == Some(true) { " (stale)" } else { "" };
                    format!("{}{stale}", hb.last_beat_at)
                })
                .unwrap_or_else(|| "missing".to_string()),
        ),
    })
}

fn events(ctx: &Ctx, session: Option<&str>, limit: usize) -> Result<()> {
    let path = ctx.home.events_path();
    let mut events = match session {
        Some(id) => session_events(&path, id)?,
        None => read_events(&path, Some(limit))?,
    };
    if events.len() > limit {
        events.drain(..events.len() - limit);
    }
    ctx.emit(&json!({ "events": events }), || {
        events
            .iter()
            .map(|e| format!("{}  {:<20} {}  {}", e.timestamp, e.event_type, short_id(&e.session_id), e.data))
            .collect::<Vec<_>>()
            .join("\n")
    })
}

fn doctor(ctx: &Ctx, repair: bool) -> Result<()> {
    if repair {
        let result = repair_state(&ctx.home, &ctx.config, &ctx.reconciler(), ctx.force_takeover)?;
        return ctx.emit(&result, || match result["preserved_at"].as_str() {
            Some(path) => format!("State repaired; unreadable file preserved at {path}"),
            None => "State file was readable; nothing set aside".to_string(),
        });
    }
    let report = doctor_report(&ctx.home, &ctx.backend(), "commander");
    ctx.emit(&report, || {
        let issues: Vec<String> = report["issues"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(|s| format!("- {s}")))
                    .collect()
            })
            .unwrap_or_default();
        if issues.is_empty() {
            "All checks passed".to_string()
        } else {
            format!("Issues:\n{}", issues.join("\n"))
        }
    })
}
