//! One invocation's view of the world: home, config, lock, state and audit log.
//!
//! A session starts by trying to become the controller. Denial is not an error:
//! the session continues as an observer that reads a snapshot and never writes.

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::WorkspaceBackend;
use crate::config::CommanderConfig;
use crate::events::{EventLog, EventLogError};
use crate::home::{new_session_id, CommanderHome};
use crate::lock::{
    ControllerLock, HeartbeatTimer, LockError, LockGuard, LockHandle, LockInfo, LockReason,
};
use crate::model::{ModelError, State};
use crate::reconcile::{DriftReport, ReconcileError, Reconciler};
use crate::state::{StateError, StateStore};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Read-only session: controller lock is held elsewhere ({reason})")]
    NotController { reason: LockReason },
    #[error("Controller lock was taken over; session {session_id} is now read-only")]
    Displaced { session_id: String },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Events(#[from] EventLogError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Controller,
    Observer,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::Controller => "controller",
            SessionMode::Observer => "observer",
        }
    }
}

// Field order matters: the timer must stop before the guard releases.
struct Control {
    timer: HeartbeatTimer,
    guard: LockGuard,
}

pub struct Session {
    home: CommanderHome,
    config: CommanderConfig,
    store: StateStore,
    events: EventLog,
    state: State,
    reason: LockReason,
    holder: Option<LockInfo>,
    control: Option<Control>,
    ended: bool,
}

impl Session {
    /// Try to become the controller and load state accordingly.
    pub fn start(
        home: CommanderHome,
        config: CommanderConfig,
        force_takeover: bool,
    ) -> Result<Self, SessionError> {
        home.ensure_dirs()?;
        let lock =
            ControllerLock::new(&home).with_heartbeat_timeout(config.heartbeat_timeout());
        let outcome = lock.acquire(force_takeover)?;
        let reason = outcome.reason;
        let holder = outcome.holder;

        let mut store = StateStore::open(home.state_path());
        let (events, control, state) = match outcome.guard {
            Some(guard) => {
                let events = EventLog::new(home.events_path(), guard.session_id());
                events.session_started(SessionMode::Controller.as_str())?;
                if reason.is_takeover() {
                    events.lock_stale_takeover(
                        reason.as_str(),
                        holder.as_ref().map(|h| h.session_id.as_str()),
                    )?;
                }
                events.lock_acquired(reason.as_str())?;
                let state = store.load()?;
                let timer = HeartbeatTimer::spawn(guard.handle().clone(), config.heartbeat_interval());
                (events, Some(Control { timer, guard }), state)
            }
            None => {
                let events = EventLog::new(home.events_path(), new_session_id());
                events.session_started(SessionMode::Observer.as_str())?;
                events.lock_denied(reason.as_str(), holder.as_ref().map(|h| h.pid))?;
                let state = store.read_snapshot()?;
                (events, None, state)
            }
        };
        let mode = if control.is_some() {
            SessionMode::Controller
        } else {
            SessionMode::Observer
        };
        info!(
            mode = mode.as_str(),
            reason = %reason,
            session = %events.session_id(),
            "session started"
        );

        Ok(Self {
            home,
            config,
            store,
            events,
            state,
            reason,
            holder,
            control,
            ended: false,
        })
    }

    pub fn mode(&self) -> SessionMode {
        if self.control.is_some() {
            SessionMode::Controller
        } else {
            SessionMode::Observer
        }
    }

    pub fn is_controller(&self) -> bool {
        self.control.is_some()
    }

    pub fn session_id(&self) -> &str {
        self.events.session_id()
    }

    pub fn acquire_reason(&self) -> LockReason {
        self.reason
    }

    /// Lock descriptor present when this session started.
    pub fn holder(&self) -> Option<&LockInfo> {
        self.holder.as_ref()
    }

    pub fn home(&self) -> &CommanderHome {
        &self.home
    }

    pub fn config(&self) -> &CommanderConfig {
        &self.config
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Latest snapshot: fresh for controllers, possibly stale for observers.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Handle for releasing the lock from a signal handler.
    pub fn lock_handle(&self) -> Option<LockHandle> {
        self.control.as_ref().map(|c| c.guard.handle().clone())
    }

    pub fn heartbeat_running(&self) -> bool {
        self.control
            .as_ref()
            .map(|c| c.timer.is_running())
            .unwrap_or(false)
    }

    /// Handle of a lock this session still holds on disk. A session whose lock
    /// was taken over drops to observer mode here.
    fn require_controller(&mut self) -> Result<LockHandle, SessionError> {
        let handle = match &self.control {
            Some(control) => control.guard.handle().clone(),
            None => {
                return Err(SessionError::NotController {
                    reason: self.reason,
                })
            }
        };
        if handle.is_controller() {
            Ok(handle)
        } else {
            Err(self.demote())
        }
    }

    fn demote(&mut self) -> SessionError {
        if let Some(Control { timer, guard }) = self.control.take() {
            timer.stop();
            // Only descriptors still carrying our session id are removed.
            if let Err(err) = guard.release() {
                warn!(error = %err, "failed to clean up after takeover");
            }
        }
        warn!(session = %self.session_id(), "controller lock taken over, continuing as observer");
        SessionError::Displaced {
            session_id: self.session_id().to_string(),
        }
    }

    fn lost_lock(&mut self, err: SessionError) -> SessionError {
        match err {
            SessionError::Lock(LockError::NotHolder { .. }) => self.demote(),
            other => other,
        }
    }

    fn verify_fail(&self, command: &str, err: SessionError) -> SessionError {
        if let Err(log_err) = self.events.command_verify_fail(command, &err.to_string()) {
            warn!(command, error = %log_err, "failed to record COMMAND_VERIFY_FAIL");
        }
        err
    }

    pub fn plan(&self, command: &str, plan: Value) -> Result<(), SessionError> {
        self.events.command_plan(command, plan)?;
        Ok(())
    }

    /// Apply `change` to a freshly loaded state and persist it as one generation.
    /// Nothing is written when `change` fails or the lock has changed hands.
    pub fn mutate<T, F>(&mut self, command: &str, change: F) -> Result<T, SessionError>
    where
        F: FnOnce(&mut State) -> Result<T, SessionError>,
    {
        let handle = self.require_controller()?;
        self.events.command_execute(command)?;
        let mut next = match self.store.load() {
            Ok(state) => state,
            Err(err) => return Err(self.verify_fail(command, err.into())),
        };
        let value = match change(&mut next) {
            Ok(value) => value,
            Err(err) => return Err(self.verify_fail(command, err)),
        };
        let store = &mut self.store;
        let written =
            handle.while_holding(|| store.replace(next.clone()).map_err(SessionError::from));
        if let Err(err) = written {
            let err = self.lost_lock(err);
            return Err(self.verify_fail(command, err));
        }
        self.state = next;
        if let Err(err) = self.events.state_updated(json!({ "command": command })) {
            return Err(self.verify_fail(command, err.into()));
        }
        self.events.command_verify_ok(command)?;
        Ok(value)
    }

    /// Align state with the backend. `fresh` skips the result cache.
    pub fn reconcile<B: WorkspaceBackend>(
        &mut self,
        reconciler: &Reconciler<B>,
        fresh: bool,
    ) -> Result<DriftReport, SessionError> {
        let handle = self.require_controller()?;
        let store = &mut self.store;
        let events = &self.events;
        let reconciled = handle.while_holding(|| {
            let report = if fresh {
                reconciler.reconcile_now(store, events)?
            } else {
                reconciler.reconcile(store, events)?
            };
            Ok::<_, SessionError>(report)
        });
        let report = match reconciled {
            Ok(report) => report,
            Err(err) => return Err(self.lost_lock(err)),
        };
        self.state = self.store.load()?;
        Ok(report)
    }

    /// Stop the heartbeat, release the lock and close the session in the log.
    pub fn end(mut self) -> Result<(), SessionError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), SessionError> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        if let Some(Control { timer, guard }) = self.control.take() {
            timer.stop();
            let report = guard.release()?;
            if report.lock_removed {
                self.events.lock_released()?;
            }
        }
        self.events.session_ended()?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!(error = %err, "session did not shut down cleanly");
        }
    }
}
