//! Releasing the controller lock when the process is interrupted.

use std::io;
use std::sync::{Arc, Mutex};

use commander_core::events::EventLog;
use commander_core::lock::LockHandle;
use tracing::warn;

/// Lock currently held by the running command, if any.
pub struct HeldLock {
    pub handle: LockHandle,
    pub events: EventLog,
}

#[derive(Clone, Default)]
pub struct LockSlot(Arc<Mutex<Option<HeldLock>>>);

impl LockSlot {
    pub fn hold(&self, held: Option<HeldLock>) {
        *self.guard() = held;
    }

    pub fn clear(&self) {
        self.guard().take();
    }

    /// Release synchronously; the process is about to exit.
    pub fn release(&self) {
        let Some(held) = self.guard().take() else {
            return;
        };
        match held.handle.release() {
            Ok(report) => {
                if report.lock_removed {
                    let _ = held.events.lock_released();
                }
                let _ = held.events.session_ended();
            }
            Err(err) => warn!(error = %err, "failed to release lock on signal"),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Option<HeldLock>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Resolves with the name of the first termination signal received.
#[cfg(unix)]
pub async fn shutdown_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => Ok("SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;
    use commander_core::config::CommanderConfig;
    use commander_core::events::read_events;
    use commander_core::home::CommanderHome;
    use commander_core::session::Session;
    use tempfile::TempDir;

    fn start(home: &CommanderHome) -> Session {
        Session::start(home.clone(), CommanderConfig::default(), false).expect("session")
    }

    fn hold(slot: &LockSlot, session: &Session) {
        slot.hold(session.lock_handle().map(|handle| HeldLock {
            handle,
            events: session.events().clone(),
        }));
    }

    fn event_types(home: &CommanderHome, session_id: &str) -> Vec<String> {
        read_events(&home.events_path(), None)
            .expect("events")
            .into_iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.event_type)
            .collect()
    }

    #[test]
    fn release_frees_the_lock_and_closes_the_session() {
        let temp = TempDir::new().expect("tempdir");
        let home = CommanderHome::at(temp.path());
        let session = start(&home);
        let session_id = session.session_id().to_string();
        let slot = LockSlot::default();
        hold(&slot, &session);

        slot.release();
        assert!(!home.lock_path().exists());
        assert!(!home.heartbeat_path().exists());
        let types = event_types(&home, &session_id);
        assert!(types.iter().any(|t| t == "LOCK_RELEASED"));
        assert_eq!(types.last().map(String::as_str), Some("SESSION_ENDED"));

        slot.release();
        let next = start(&home);
        assert!(next.is_controller());
        drop(session);
        assert!(home.lock_path().exists(), "late drop must not free the new holder's lock");
        let released = event_types(&home, &session_id)
            .into_iter()
            .filter(|t| t == "LOCK_RELEASED")
            .count();
        assert_eq!(released, 1);
    }

    #[test]
    fn cleared_slot_leaves_the_lock_alone() {
        let temp = TempDir::new().expect("tempdir");
        let home = CommanderHome::at(temp.path());
        let session = start(&home);
        let slot = LockSlot::default();
        hold(&slot, &session);

        slot.clear();
        slot.release();
        assert!(home.lock_path().exists());
        session.end().expect("end");
        assert!(!home.lock_path().exists());
    }
}
