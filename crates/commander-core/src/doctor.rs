use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tracing::info;

use crate::atomic::{purge_temp, temp_path_for};
use crate::backend::{GitHarnessBackend, WorkspaceBackend};
use crate::config::{load_config, CommanderConfig};
use crate::events::EventLog;
use crate::home::CommanderHome;
use crate::lock::ControllerLock;
use crate::reconcile::Reconciler;
use crate::state::{StateError, StateStore};

fn git_version() -> Option<(PathBuf, String)> {
    let path = which::which("git").ok()?;
    let output = std::process::Command::new(&path)
        .arg("--version")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Some((path, raw))
}

fn leftover_temp_files(home: &CommanderHome) -> Vec<PathBuf> {
    [home.state_path(), home.lock_path(), home.heartbeat_path()]
        .iter()
        .map(|path| temp_path_for(path))
        .filter(|tmp| tmp.exists())
        .collect()
}

fn state_section(home: &CommanderHome, issues: &mut Vec<String>) -> Value {
    let path = home.state_path();
    let mut store = StateStore::open(&path);
    match store.read_snapshot() {
        Ok(state) => json!({
            "path": path.to_string_lossy().to_string(),
            "present": path.exists(),
            "readable": true,
            "projects": state.projects.len(),
            "runs": state.runs.len(),
            "tasks": state.tasks.len(),
            "inbox": state.inbox.len(),
            "focus_dangling": state.focus_project_id.is_some() && state.focus_project().is_none(),
        }),
        Err(err) => {
            if matches!(err, StateError::Corrupted { .. } | StateError::Invalid { .. }) {
                issues.push("state file unreadable; run `commander doctor --repair-state`".to_string());
            } else {
                issues.push(format!("state file error: {err}"));
            }
            json!({
                "path": path.to_string_lossy().to_string(),
                "present": path.exists(),
                "readable": false,
                "error": err.to_string(),
            })
        }
    }
}

fn harness_section(backend: &GitHarnessBackend, issues: &mut Vec<String>) -> Value {
    let runs = match backend.list_runs() {
        Ok(runs) => runs,
        Err(err) => {
            issues.push(format!("cannot list runs: {err}"));
            return json!({
                "root": backend.root().to_string_lossy().to_string(),
                "error": err.to_string(),
            });
        }
    };
    let registered: Vec<PathBuf> = backend
        .list_git_worktrees()
        .map(|entries| {
            entries
                .into_iter()
                .map(|entry| {
                    let path = PathBuf::from(entry.path);
                    path.canonicalize().unwrap_or(path)
                })
                .collect()
        })
        .unwrap_or_default();
    let unregistered: Vec<String> = runs
        .iter()
        .filter(|run| {
            let path = run
                .worktree_path
                .canonicalize()
                .unwrap_or_else(|_| run.worktree_path.clone());
            !registered.contains(&path)
        })
        .map(|run| run.name.clone())
        .collect();
    if !unregistered.is_empty() {
        issues.push(format!(
            "runs not registered as git worktrees: {}",
            unregistered.join(", ")
        ));
    }
    json!({
        "root": backend.root().to_string_lossy().to_string(),
        "runs_dir": backend.runs_dir().to_string_lossy().to_string(),
        "runs": runs.iter().map(|r| r.name.clone()).collect::<Vec<_>>(),
        "unregistered_worktrees": unregistered,
    })
}

/// Machine-readable health report for the home directory and the harness root.
pub fn doctor_report(
    home: &CommanderHome,
    backend: &GitHarnessBackend,
    running_binary: &str,
) -> Value {
    let mut issues = Vec::new();

    let git = git_version();
    if git.is_none() {
        issues.push("git not found on PATH".to_string());
    }

    let config = match load_config(home) {
        Ok(config) => json!({
            "path": home.config_path().to_string_lossy().to_string(),
            "present": home.config_path().exists(),
            "loaded": config,
        }),
        Err(err) => {
            issues.push(format!("config error: {err}"));
            json!({
                "path": home.config_path().to_string_lossy().to_string(),
                "present": true,
                "error": err.to_string(),
            })
        }
    };

    let lock = match ControllerLock::new(home).inspect() {
        Ok(status) => {
            if status.lock.is_some() && !status.holder_alive {
                issues.push("lock held by a dead process; next controller will take it over".to_string());
            } else if status.lock.is_some() && !status.consistent {
                issues.push("lock and heartbeat disagree; use --force-takeover if the holder is hung".to_string());
            } else if status.heartbeat_stale == Some(true) && status.lock.is_some() {
                issues.push("controller heartbeat is stale".to_string());
            }
            serde_json::to_value(status).unwrap_or(Value::Null)
        }
        Err(err) => {
            issues.push(format!("lock error: {err}"));
            json!({ "error": err.to_string() })
        }
    };

    let temp_files = leftover_temp_files(home);
    if !temp_files.is_empty() {
        issues.push(format!("{} leftover temp file(s)", temp_files.len()));
    }

    let state = state_section(home, &mut issues);
    let harness = harness_section(backend, &mut issues);

    json!({
        "binary": running_binary,
        "version": crate::version(),
        "home": {
            "path": home.root().to_string_lossy().to_string(),
            "exists": home.root().exists(),
        },
        "git": git.map(|(path, version)| json!({
            "path": path.to_string_lossy().to_string(),
            "version": version,
        })),
        "config": config,
        "lock": lock,
        "leftover_temp_files": temp_files
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect::<Vec<_>>(),
        "state": state,
        "harness": harness,
        "issues": issues,
        "ok": issues.is_empty(),
    })
}

/// Explicit repair: set an unreadable state file aside, commit an empty state,
/// then re-adopt whatever runs the backend still has. Requires the controller lock.
pub fn repair_state<B: WorkspaceBackend>(
    home: &CommanderHome,
    config: &CommanderConfig,
    reconciler: &Reconciler<B>,
    force_takeover: bool,
) -> Result<Value> {
    home.ensure_dirs()?;
    let lock = ControllerLock::new(home).with_heartbeat_timeout(config.heartbeat_timeout());
    let outcome = lock.acquire(force_takeover).context("acquire controller lock")?;
    let reason = outcome.reason;
    let Some(guard) = outcome.guard else {
        bail!("cannot repair state: controller lock denied ({reason})");
    };
    let events = EventLog::new(home.events_path(), guard.session_id());
    events.session_started("repair")?;
    events.lock_acquired(reason.as_str())?;

    let mut removed_temp = Vec::new();
    for path in [home.lock_path(), home.heartbeat_path()] {
        if purge_temp(&path).with_context(|| format!("purge temp for {}", path.display()))? {
            removed_temp.push(temp_path_for(&path).to_string_lossy().to_string());
        }
    }

    let mut store = StateStore::open(home.state_path());
    events.command_execute("doctor --repair-state")?;
    let repaired = store.repair().context("repair state file")?;
    if let Some(path) = repaired.preserved_at.as_ref() {
        info!(preserved = %path.display(), "state repaired");
    }
    let report = reconciler
        .reconcile_now(&mut store, &events)
        .context("reconcile after repair")?;
    events.command_verify_ok("doctor --repair-state")?;

    if guard.release()?.lock_removed {
        events.lock_released()?;
    }
    events.session_ended()?;

    Ok(json!({
        "preserved_at": repaired
            .preserved_at
            .map(|p| p.to_string_lossy().to_string()),
        "removed_temp_files": removed_temp,
        "reconcile": report,
    }))
}
