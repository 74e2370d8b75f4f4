use std::fs;

use commander_core::backend::GitHarnessBackend;
use commander_core::config::CommanderConfig;
use commander_core::events::read_events;
use commander_core::home::CommanderHome;
use commander_core::lock::LockReason;
use commander_core::model::RunState;
use commander_core::reconcile::Reconciler;
use commander_core::rules::compute_next_action;
use commander_core::session::{Session, SessionMode};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

#[test]
fn empty_home_to_task_recommendation() {
    let temp = TempDir::new().expect("tempdir");
    let home = CommanderHome::at(temp.path().join("home"));
    let repo = temp.path().join("repo");
    fs::create_dir_all(&repo).expect("repo");

    let mut session =
        Session::start(home.clone(), CommanderConfig::default(), false).expect("start");
    assert_eq!(session.mode(), SessionMode::Controller);
    assert_eq!(session.acquire_reason(), LockReason::Acquired);

    let reconciler = Reconciler::new(GitHarnessBackend::new(&repo));
    let report = session.reconcile(&reconciler, true).expect("reconcile");
    assert!(!report.drift_detected);

    assert_eq!(
        compute_next_action(session.state()).action,
        "commander start <run-name>"
    );

    let project = session
        .mutate("project add", |state| {
            let (project, _) = state.register_project("repo", &repo);
            state.set_focus(&project.id)?;
            state.add_task(&project.id, "ship the thing")?;
            Ok(project)
        })
        .expect("mutate");
    assert_eq!(session.state().focus_project_id, Some(project.id.clone()));

    let next = compute_next_action(session.state());
    assert_eq!(next.action, "commander start <run-name>");
    assert!(next.why.contains("ship the thing"));

    session.end().expect("end");
    let events = read_events(&home.events_path(), None).expect("events");
    let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(kinds.first(), Some(&"SESSION_STARTED"));
    assert!(kinds.contains(&"RECONCILE_START"));
    assert!(!kinds.contains(&"RECONCILE_RESULT"));
    assert_eq!(kinds.last(), Some(&"SESSION_ENDED"));
}

#[test]
fn crashed_controller_state_survives_and_runs_are_parked() {
    let temp = TempDir::new().expect("tempdir");
    let home = CommanderHome::at(temp.path().join("home"));
    let repo = temp.path().join("repo");
    let run_dir = repo.join("runs").join("alpha");
    fs::create_dir_all(&run_dir).expect("run");
    fs::write(
        run_dir.join(".run.json"),
        r#"{"name":"alpha","branch":"run/alpha","created_at":1.0,"status":"active","project_dir":""}"#,
    )
    .expect("metadata");

    {
        let mut session =
            Session::start(home.clone(), CommanderConfig::default(), false).expect("start");
        let reconciler = Reconciler::new(GitHarnessBackend::new(&repo));
        let report = session.reconcile(&reconciler, true).expect("adopt");
        assert_eq!(report.runs_added, 1);
    }

    fs::remove_dir_all(&run_dir).expect("remove run");

    let mut session =
        Session::start(home.clone(), CommanderConfig::default(), false).expect("restart");
    assert_eq!(session.mode(), SessionMode::Controller);
    let reconciler = Reconciler::new(GitHarnessBackend::new(&repo));
    let report = session.reconcile(&reconciler, true).expect("park");
    assert_eq!(report.runs_parked, 1);
    assert_eq!(
        session.state().run_by_name("alpha").map(|r| r.state),
        Some(RunState::Missing)
    );
}
