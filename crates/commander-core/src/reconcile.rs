use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, BackendRun, WorkspaceBackend};
use crate::config::DEFAULT_RECONCILE_CACHE_SECS;
use crate::events::{EventLog, EventLogError};
use crate::home::{new_id, now_rfc3339};
use crate::model::{Run, RunState, State};
use crate::state::{StateError, StateStore};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Workspace backend failed: {0}")]
    Backend(#[from] BackendError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Events(#[from] EventLogError),
    #[error("Failed to encode reconcile result: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Counts of what one reconciliation pass changed.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub projects_added: usize,
    pub projects_removed: usize,
    pub runs_added: usize,
    pub runs_removed: usize,
    pub runs_updated: usize,
    pub runs_parked: usize,
    pub drift_detected: bool,
    /// Project ids whose repository path no longer exists. Reported, never acted on.
    pub orphaned_projects: Vec<String>,
}

impl DriftReport {
    fn finish(mut self) -> Self {
        self.drift_detected = self.projects_added
            + self.projects_removed
            + self.runs_added
            + self.runs_removed
            + self.runs_updated
            + self.runs_parked
            > 0;
        self
    }
}

/// Backend status strings mapped onto run states.
pub fn map_backend_status(status: &str) -> RunState {
    match status.trim().to_lowercase().as_str() {
        "finished" | "failed" => RunState::Finished,
        _ => RunState::Running,
    }
}

/// Pure drift computation: the next state plus what changed.
pub fn plan_reconcile(
    state: &State,
    backend_runs: &[BackendRun],
    backend_root: &Path,
) -> (State, DriftReport) {
    let now = now_rfc3339();
    let mut next = state.clone();
    let mut report = DriftReport::default();
    let by_name: HashMap<&str, &BackendRun> =
        backend_runs.iter().map(|r| (r.name.as_str(), r)).collect();

    for run in next.runs.iter_mut() {
        match by_name.get(run.run_name.as_str()) {
            None => {
                if matches!(run.state, RunState::Missing | RunState::Cleaned) {
                    continue;
                }
                warn!(run = %run.run_name, previous = %run.state, "run vanished from backend, parking");
                run.state = RunState::Missing;
                run.last_touched_at = Some(now.clone());
                report.runs_parked += 1;
            }
            Some(found) => {
                if sync_run(run, found) {
                    run.last_touched_at = Some(now.clone());
                    report.runs_updated += 1;
                }
            }
        }
    }

    let known: HashSet<String> = next.runs.iter().map(|r| r.run_name.clone()).collect();
    let mut adopted = Vec::new();
    for found in backend_runs.iter().filter(|r| !known.contains(&r.name)) {
        let (project, created) = next.register_project("", backend_root);
        if created {
            report.projects_added += 1;
        }
        info!(run = %found.name, project = %project.name, "adopting run discovered in backend");
        adopted.push(Run {
            id: new_id(),
            project_id: project.id,
            run_name: found.name.clone(),
            state: map_backend_status(&found.status),
            worktree_path: Some(found.worktree_path.to_string_lossy().to_string()),
            branch_name: found.branch.clone(),
            last_command: None,
            last_result: None,
            last_touched_at: Some(now.clone()),
        });
        report.runs_added += 1;
    }
    next.runs.extend(adopted);

    report.orphaned_projects = next
        .projects
        .iter()
        .filter(|p| !Path::new(&p.repo_path).exists())
        .map(|p| p.id.clone())
        .collect();

    (next, report.finish())
}

fn sync_run(run: &mut Run, found: &BackendRun) -> bool {
    let mut changed = false;
    let mapped = map_backend_status(&found.status);
    match run.state {
        RunState::Missing => {
            run.state = mapped;
            changed = true;
        }
        RunState::Running if mapped == RunState::Finished => {
            run.state = RunState::Finished;
            changed = true;
        }
        _ => {}
    }
    let path = found.worktree_path.to_string_lossy().to_string();
    if run.worktree_path.as_deref() != Some(path.as_str()) {
        run.worktree_path = Some(path);
        changed = true;
    }
    if found.branch.is_some() && run.branch_name != found.branch {
        run.branch_name = found.branch.clone();
        changed = true;
    }
    changed
}

type CacheKey = (PathBuf, String);

/// Brings persisted state in line with the backend, caching recent results.
pub struct Reconciler<B> {
    backend: B,
    window: Duration,
    cache: Mutex<HashMap<CacheKey, (Instant, DriftReport)>>,
}

impl<B: WorkspaceBackend> Reconciler<B> {
    pub fn new(backend: B) -> Self {
        Self::with_cache_window(backend, Duration::from_secs(DEFAULT_RECONCILE_CACHE_SECS))
    }

    pub fn with_cache_window(backend: B, window: Duration) -> Self {
        Self {
            backend,
            window,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Reuses a result younger than the cache window for the same state file and backend.
    pub fn reconcile(
        &self,
        store: &mut StateStore,
        events: &EventLog,
    ) -> Result<DriftReport, ReconcileError> {
        let key = self.key_for(store);
        if let Some((at, report)) = self.cache().get(&key) {
            if at.elapsed() < self.window {
                debug!(age_ms = at.elapsed().as_millis() as u64, "reconcile cache hit");
                return Ok(report.clone());
            }
        }
        self.reconcile_now(store, events)
    }

    pub fn reconcile_now(
        &self,
        store: &mut StateStore,
        events: &EventLog,
    ) -> Result<DriftReport, ReconcileError> {
        events.reconcile_start()?;
        let backend_runs = match self.backend.list_runs() {
            Ok(runs) => runs,
            Err(err) => {
                warn!(error = %err, "reconcile aborted, backend unavailable");
                events.reconcile_result(json!({ "error": err.to_string() }))?;
                return Err(err.into());
            }
        };

        let state = store.load()?;
        let (next, report) = plan_reconcile(&state, &backend_runs, self.backend.root());
        if report.drift_detected {
            store.replace(next)?;
            events.reconcile_result(serde_json::to_value(&report)?)?;
            info!(
                added = report.runs_added,
                updated = report.runs_updated,
                parked = report.runs_parked,
                "reconciled drift"
            );
        } else {
            debug!("no drift");
        }

        self.cache()
            .insert(self.key_for(store), (Instant::now(), report.clone()));
        Ok(report)
    }

    pub fn clear_cache(&self) {
        self.cache().clear();
    }

    fn key_for(&self, store: &StateStore) -> CacheKey {
        (store.path().to_path_buf(), self.backend.cache_key())
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, (Instant, DriftReport)>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TreeStatus;
    use crate::events::read_events;
    use crate::model::NewRun;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct FakeBackend {
        root: PathBuf,
        runs: Arc<Mutex<Vec<BackendRun>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl FakeBackend {
        fn set_runs(&self, runs: Vec<BackendRun>) {
            *self.runs.lock().expect("runs") = runs;
        }

        fn set_fail(&self, fail: bool) {
            *self.fail.lock().expect("fail") = fail;
        }
    }

    impl WorkspaceBackend for FakeBackend {
        fn root(&self) -> &Path {
            &self.root
        }

        fn cache_key(&self) -> String {
            "fake".to_string()
        }

        fn list_runs(&self) -> Result<Vec<BackendRun>, BackendError> {
            if *self.fail.lock().expect("fail") {
                return Err(BackendError::Git {
                    command: "worktree list".to_string(),
                    stderr: "not a git repository".to_string(),
                });
            }
            Ok(self.runs.lock().expect("runs").clone())
        }

        fn tree_status(&self, _path: &Path) -> Result<TreeStatus, BackendError> {
            Ok(TreeStatus {
                branch: None,
                clean: true,
                files_changed: 0,
            })
        }
    }

    fn backend_run(root: &Path, name: &str, status: &str) -> BackendRun {
        BackendRun {
            name: name.to_string(),
            branch: Some(format!("run/{name}")),
            status: status.to_string(),
            worktree_path: root.join("runs").join(name),
        }
    }

    struct Fixture {
        _temp: TempDir,
        backend: FakeBackend,
        store: StateStore,
        events: EventLog,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().expect("tempdir");
        let repo = temp.path().join("repo");
        fs::create_dir_all(&repo).expect("repo");
        let backend = FakeBackend {
            root: repo,
            ..FakeBackend::default()
        };
        let store = StateStore::open(temp.path().join("state.json"));
        let events = EventLog::new(temp.path().join("events.log"), "test-session");
        Fixture {
            _temp: temp,
            backend,
            store,
            events,
        }
    }

    fn seed_running(fx: &mut Fixture, names: &[&str]) {
        let mut state = fx.store.load().expect("load");
        let (project, _) = state.register_project("repo", &fx.backend.root);
        for name in names {
            state
                .record_run(NewRun {
                    project_id: project.id.clone(),
                    run_name: name.to_string(),
                    worktree_path: Some(
                        fx.backend.root.join("runs").join(name).to_string_lossy().to_string(),
                    ),
                    branch_name: Some(format!("run/{name}")),
                    last_command: None,
                })
                .expect("record");
        }
        fx.store.replace(state).expect("replace");
    }

    #[test]
    fn vanished_runs_are_parked_not_deleted() {
        let mut fx = fixture();
        seed_running(&mut fx, &["alpha", "beta"]);
        fx.backend
            .set_runs(vec![backend_run(&fx.backend.root, "beta", "active")]);
        let reconciler = Reconciler::new(fx.backend.clone());

        let report = reconciler
            .reconcile_now(&mut fx.store, &fx.events)
            .expect("reconcile");
        assert_eq!(report.runs_parked, 1);
        assert!(report.drift_detected);

        let state = fx.store.load().expect("load");
        assert_eq!(state.runs.len(), 2);
        assert_eq!(
            state.run_by_name("alpha").map(|r| r.state),
            Some(RunState::Missing)
        );
        assert_eq!(
            state.run_by_name("beta").map(|r| r.state),
            Some(RunState::Running)
        );
    }

    #[test]
    fn second_pass_is_idempotent_and_leaves_file_untouched() {
        let mut fx = fixture();
        seed_running(&mut fx, &["alpha", "beta"]);
        fx.backend.set_runs(vec![
            backend_run(&fx.backend.root, "beta", "finished"),
            backend_run(&fx.backend.root, "gamma", "active"),
        ]);
        let reconciler = Reconciler::new(fx.backend.clone());

        let first = reconciler
            .reconcile_now(&mut fx.store, &fx.events)
            .expect("first");
        assert!(first.drift_detected);
        let bytes = fs::read(fx.store.path()).expect("read");

        let second = reconciler
            .reconcile_now(&mut fx.store, &fx.events)
            .expect("second");
        assert!(!second.drift_detected);
        assert_eq!(second.runs_parked, 0);
        assert_eq!(fs::read(fx.store.path()).expect("read"), bytes);

        let results = read_events(fx.events.path(), None)
            .expect("events")
            .into_iter()
            .filter(|e| e.event_type == "RECONCILE_RESULT")
            .count();
        assert_eq!(results, 1);
    }

    #[test]
    fn discovered_runs_are_adopted_under_the_backend_project() {
        let mut fx = fixture();
        fx.backend.set_runs(vec![
            backend_run(&fx.backend.root, "found", "failed"),
            backend_run(&fx.backend.root, "live", "active"),
        ]);
        let reconciler = Reconciler::new(fx.backend.clone());
        let report = reconciler
            .reconcile_now(&mut fx.store, &fx.events)
            .expect("reconcile");
        assert_eq!(report.projects_added, 1);
        assert_eq!(report.runs_added, 2);

        let state = fx.store.load().expect("load");
        assert_eq!(state.projects.len(), 1);
        let found = state.run_by_name("found").expect("adopted");
        assert_eq!(found.state, RunState::Finished);
        assert_eq!(found.project_id, state.projects[0].id);
        assert_eq!(found.branch_name.as_deref(), Some("run/found"));
        assert_eq!(
            state.run_by_name("live").map(|r| r.state),
            Some(RunState::Running)
        );
    }

    #[test]
    fn missing_run_that_reappears_takes_backend_state() {
        let mut fx = fixture();
        seed_running(&mut fx, &["alpha"]);
        let reconciler = Reconciler::new(fx.backend.clone());
        reconciler
            .reconcile_now(&mut fx.store, &fx.events)
            .expect("park");

        fx.backend
            .set_runs(vec![backend_run(&fx.backend.root, "alpha", "active")]);
        let report = reconciler
            .reconcile_now(&mut fx.store, &fx.events)
            .expect("restore");
        assert_eq!(report.runs_updated, 1);
        assert_eq!(
            fx.store.load().expect("load").run_by_name("alpha").map(|r| r.state),
            Some(RunState::Running)
        );
    }

    #[test]
    fn backend_failure_leaves_state_untouched() {
        let mut fx = fixture();
        seed_running(&mut fx, &["alpha"]);
        let before = fs::read(fx.store.path()).expect("read");
        fx.backend.set_fail(true);
        let reconciler = Reconciler::new(fx.backend.clone());

        let err = reconciler
            .reconcile_now(&mut fx.store, &fx.events)
            .expect_err("backend down");
        assert!(matches!(err, ReconcileError::Backend(_)));
        assert_eq!(fs::read(fx.store.path()).expect("read"), before);

        let events = read_events(fx.events.path(), None).expect("events");
        let last = events.last().expect("result event");
        assert_eq!(last.event_type, "RECONCILE_RESULT");
        assert!(last.data["error"].as_str().unwrap_or("").contains("not a git"));
    }

    #[test]
    fn cached_result_is_reused_within_window() {
        let mut fx = fixture();
        seed_running(&mut fx, &["alpha"]);
        fx.backend
            .set_runs(vec![backend_run(&fx.backend.root, "alpha", "active")]);
        let reconciler = Reconciler::new(fx.backend.clone());
        let first = reconciler
            .reconcile(&mut fx.store, &fx.events)
            .expect("first");
        assert!(!first.drift_detected);

        fx.backend.set_runs(Vec::new());
        let cached = reconciler
            .reconcile(&mut fx.store, &fx.events)
            .expect("cached");
        assert_eq!(cached, first);
        assert_eq!(
            fx.store.load().expect("load").run_by_name("alpha").map(|r| r.state),
            Some(RunState::Running)
        );

        reconciler.clear_cache();
        let fresh = reconciler
            .reconcile(&mut fx.store, &fx.events)
            .expect("fresh");
        assert_eq!(fresh.runs_parked, 1);
    }

    #[test]
    fn zero_window_never_caches() {
        let mut fx = fixture();
        seed_running(&mut fx, &["alpha"]);
        let reconciler = Reconciler::with_cache_window(fx.backend.clone(), Duration::ZERO);
        reconciler.reconcile(&mut fx.store, &fx.events).expect("one");
        reconciler.reconcile(&mut fx.store, &fx.events).expect("two");
        let starts = read_events(fx.events.path(), None)
            .expect("events")
            .into_iter()
            .filter(|e| e.event_type == "RECONCILE_START")
            .count();
        assert_eq!(starts, 2);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(map_backend_status("active"), RunState::Running);
        assert_eq!(map_backend_status("FAILED"), RunState::Finished);
        assert_eq!(map_backend_status("finished"), RunState::Finished);
        assert_eq!(map_backend_status("paused"), RunState::Running);
    }
}
