use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;

use chrono::{Duration, TimeZone, Utc};
use commander_core::home::{format_timestamp, CommanderHome};
use commander_core::lock::{ControllerLock, HeartbeatInfo, LockInfo, LockReason};
use commander_core::process::current_pid;
use tempfile::TempDir;

fn controller(temp: &TempDir) -> ControllerLock {
    let home = CommanderHome::at(temp.path());
    home.ensure_dirs().expect("dirs");
    ControllerLock::new(&home)
}

fn seed(lock: &ControllerLock, pid: u32, session: &str, heartbeat: Option<(&str, String)>) {
    let info = LockInfo {
        pid,
        start_time: "2026-01-01T00:00:00.000000Z".to_string(),
        session_id: session.to_string(),
    };
    fs::write(
        lock.lock_path(),
        serde_json::to_string(&info).expect("lock json"),
    )
    .expect("write lock");
    match heartbeat {
        Some((session_id, at)) => {
            let beat = HeartbeatInfo {
                session_id: session_id.to_string(),
                last_beat_at: at,
            };
            fs::write(
                lock.heartbeat_path(),
                serde_json::to_string(&beat).expect("heartbeat json"),
            )
            .expect("write heartbeat");
        }
        None => {
            let _ = fs::remove_file(lock.heartbeat_path());
        }
    }
}

#[test]
fn second_acquire_is_denied_while_first_holds() {
    let temp = TempDir::new().expect("tempdir");
    let lock = controller(&temp);
    let first = lock.acquire(false).expect("first");
    assert!(first.granted());
    assert_eq!(first.reason, LockReason::Acquired);

    let second = lock.acquire(false).expect("second");
    assert!(!second.granted());
    assert_eq!(second.reason, LockReason::LockDenied);
    assert_eq!(second.holder.map(|h| h.pid), Some(current_pid()));
}

#[test]
fn concurrent_acquires_grant_exactly_one() {
    let temp = TempDir::new().expect("tempdir");
    let home = CommanderHome::at(temp.path());
    home.ensure_dirs().expect("dirs");
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let home = home.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let lock = ControllerLock::new(&home);
                barrier.wait();
                lock.acquire(false).expect("acquire")
            })
        })
        .collect();
    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("join"))
        .collect();
    assert_eq!(outcomes.iter().filter(|o| o.granted()).count(), 1);
}

#[test]
fn dead_pid_is_taken_over_without_force() {
    let temp = TempDir::new().expect("tempdir");
    let lock = controller(&temp);
    seed(
        &lock,
        99_999_999,
        "ghost",
        Some(("ghost", format_timestamp(Utc::now()))),
    );
    let outcome = lock.acquire(false).expect("acquire");
    assert!(outcome.granted());
    assert_eq!(outcome.reason, LockReason::StaleTakeoverPidDead);
    assert_eq!(outcome.holder.map(|h| h.session_id), Some("ghost".to_string()));

    let written = lock.read_lock_info().expect("read").expect("lock");
    assert_eq!(written.pid, current_pid());
    assert_ne!(written.session_id, "ghost");
}

#[test]
fn heartbeat_boundary_without_force() {
    let temp = TempDir::new().expect("tempdir");
    let lock = controller(&temp);
    let beat = Utc
        .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .expect("timestamp");
    seed(&lock, current_pid(), "s1", Some(("s1", format_timestamp(beat))));

    let at_threshold = lock
        .acquire_at(false, beat + Duration::seconds(300))
        .expect("at");
    assert_eq!(at_threshold.reason, LockReason::LockDenied);

    let past_threshold = lock
        .acquire_at(false, beat + Duration::seconds(301))
        .expect("past");
    assert_eq!(past_threshold.reason, LockReason::LockDeniedStaleHeartbeat);
    assert!(!past_threshold.granted());
}

#[test]
fn heartbeat_boundary_with_force() {
    let temp = TempDir::new().expect("tempdir");
    let lock = controller(&temp);
    let beat = Utc
        .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .expect("timestamp");

    seed(&lock, current_pid(), "s1", Some(("s1", format_timestamp(beat))));
    let at_threshold = lock
        .acquire_at(true, beat + Duration::seconds(300))
        .expect("at");
    assert_eq!(at_threshold.reason, LockReason::ForceTakeover);
    assert!(at_threshold.granted());
    drop(at_threshold);

    seed(&lock, current_pid(), "s1", Some(("s1", format_timestamp(beat))));
    let past_threshold = lock
        .acquire_at(true, beat + Duration::seconds(301))
        .expect("past");
    assert_eq!(past_threshold.reason, LockReason::StaleTakeoverHeartbeatTimeout);
}

#[test]
fn inconsistent_heartbeat_needs_force() {
    let temp = TempDir::new().expect("tempdir");
    let lock = controller(&temp);
    seed(
        &lock,
        current_pid(),
        "s1",
        Some(("other", format_timestamp(Utc::now()))),
    );
    assert_eq!(
        lock.acquire(false).expect("denied").reason,
        LockReason::LockDeniedInconsistent
    );
    assert_eq!(
        lock.acquire(true).expect("forced").reason,
        LockReason::StaleTakeover
    );
}

#[test]
fn missing_heartbeat_with_live_pid_needs_force() {
    let temp = TempDir::new().expect("tempdir");
    let lock = controller(&temp);
    seed(&lock, current_pid(), "s1", None);
    assert_eq!(
        lock.acquire(false).expect("denied").reason,
        LockReason::LockDenied
    );
    let forced = lock.acquire(true).expect("forced");
    assert_eq!(forced.reason, LockReason::StaleTakeover);
    assert!(lock.read_heartbeat_info().expect("read").is_some());
}

#[test]
fn displaced_session_does_not_remove_new_holder() {
    let temp = TempDir::new().expect("tempdir");
    let lock = controller(&temp);
    let first = lock.acquire(false).expect("first");
    let second = lock.acquire(true).expect("forced");
    let new_session = second.guard.as_ref().expect("guard").session_id().to_string();

    let report = first.guard.expect("guard").release().expect("release");
    assert!(!report.lock_removed);
    assert!(!report.heartbeat_removed);
    assert_eq!(
        lock.read_lock_info().expect("read").map(|l| l.session_id),
        Some(new_session)
    );

    let report = second.guard.expect("guard").release().expect("release");
    assert!(report.lock_removed);
    assert!(lock.read_lock_info().expect("read").is_none());
}
