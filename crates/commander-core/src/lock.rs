//! Controller lock: a lock descriptor plus a heartbeat descriptor.
//!
//! The two descriptors are separate files so that a crash between writing one
//! and the other is itself detectable (missing heartbeat, or a heartbeat whose
//! session id does not match the lock). Pid liveness catches hard crashes;
//! heartbeat age catches holders that are alive but no longer making progress.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::atomic::write_atomic;
use crate::home::{format_timestamp, new_session_id, parse_timestamp, CommanderHome};
use crate::process::{current_pid, is_pid_alive};

pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to serialize lock descriptor: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Session {session_id} no longer holds the controller lock")]
    NotHolder { session_id: String },
}

/// Contents of `commander.lock`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub pid: u32,
    pub start_time: String,
    pub session_id: String,
}

/// Contents of `commander.heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatInfo {
    pub session_id: String,
    pub last_beat_at: String,
}

/// Reason codes returned by [`ControllerLock::acquire`], surfaced verbatim to operators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockReason {
    Acquired,
    StaleTakeoverPidDead,
    StaleTakeover,
    StaleTakeoverHeartbeatTimeout,
    ForceTakeover,
    LockDenied,
    LockDeniedInconsistent,
    LockDeniedStaleHeartbeat,
}

impl LockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            LockReason::Acquired => "ACQUIRED",
            LockReason::StaleTakeoverPidDead => "STALE_TAKEOVER_PID_DEAD",
            LockReason::StaleTakeover => "STALE_TAKEOVER",
            LockReason::StaleTakeoverHeartbeatTimeout => "STALE_TAKEOVER_HEARTBEAT_TIMEOUT",
            LockReason::ForceTakeover => "FORCE_TAKEOVER",
            LockReason::LockDenied => "LOCK_DENIED",
            LockReason::LockDeniedInconsistent => "LOCK_DENIED_INCONSISTENT",
            LockReason::LockDeniedStaleHeartbeat => "LOCK_DENIED_STALE_HEARTBEAT",
        }
    }

    pub fn is_granted(self) -> bool {
        !matches!(
            self,
            LockReason::LockDenied
                | LockReason::LockDeniedInconsistent
                | LockReason::LockDeniedStaleHeartbeat
        )
    }

    /// Granted by displacing an earlier holder.
    pub fn is_takeover(self) -> bool {
        self.is_granted() && self != LockReason::Acquired
    }
}

impl fmt::Display for LockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one acquisition attempt. Denial is a normal outcome, not an error.
#[derive(Debug)]
pub struct AcquireOutcome {
    pub reason: LockReason,
    /// Descriptor that was present before the attempt, if any.
    pub holder: Option<LockInfo>,
    pub guard: Option<LockGuard>,
}

impl AcquireOutcome {
    pub fn granted(&self) -> bool {
        self.guard.is_some()
    }
}

/// Read-only view of the descriptors, for status and doctor output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LockStatus {
    pub lock: Option<LockInfo>,
    pub heartbeat: Option<HeartbeatInfo>,
    pub holder_alive: bool,
    pub consistent: bool,
    pub heartbeat_stale: Option<bool>,
}

impl LockStatus {
    /// A live holder with a matching, fresh heartbeat.
    pub fn is_active(&self) -> bool {
        self.lock.is_some() && self.holder_alive && self.consistent && self.heartbeat_stale == Some(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub lock_removed: bool,
    pub heartbeat_removed: bool,
}

#[derive(Debug, Clone)]
struct LockPaths {
    lock: PathBuf,
    heartbeat: PathBuf,
    section: PathBuf,
}

impl LockPaths {
    fn new(lock: PathBuf, heartbeat: PathBuf) -> Self {
        let section = lock.with_file_name("commander.acquire");
        Self {
            lock,
            heartbeat,
            section,
        }
    }

    fn io_error(path: &Path, source: io::Error) -> LockError {
        LockError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Serialises check-then-write between processes. This advisory flock only
    /// guards the decision window; ownership itself lives in the descriptors.
    fn enter(&self) -> Result<CriticalSection, LockError> {
        if let Some(parent) = self.section.parent() {
            fs::create_dir_all(parent).map_err(|source| Self::io_error(parent, source))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.section)
            .map_err(|source| Self::io_error(&self.section, source))?;
        file.lock_exclusive()
            .map_err(|source| Self::io_error(&self.section, source))?;
        Ok(CriticalSection { file })
    }

    fn read_lock(&self) -> Result<Option<LockInfo>, LockError> {
        read_descriptor::<LockInfo>(&self.lock)
    }

    fn read_heartbeat(&self) -> Result<Option<HeartbeatInfo>, LockError> {
        read_descriptor::<HeartbeatInfo>(&self.heartbeat)
    }

    fn write_lock(&self, info: &LockInfo) -> Result<(), LockError> {
        let body = serde_json::to_string_pretty(info)?;
        write_atomic(&self.lock, body.as_bytes()).map_err(|source| Self::io_error(&self.lock, source))
    }

    fn write_heartbeat(&self, info: &HeartbeatInfo) -> Result<(), LockError> {
        let body = serde_json::to_string_pretty(info)?;
        write_atomic(&self.heartbeat, body.as_bytes())
            .map_err(|source| Self::io_error(&self.heartbeat, source))
    }
}

struct CriticalSection {
    file: File,
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Missing file and unparsable content both read as "absent".
fn read_descriptor<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, LockError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(LockPaths::io_error(path, source)),
    };
    match serde_json::from_str::<T>(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable lock descriptor");
            Ok(None)
        }
    }
}

/// Strictly older than `timeout` is stale; exactly `timeout` is still fresh.
/// An unparsable timestamp counts as stale.
pub fn is_heartbeat_stale(heartbeat: &HeartbeatInfo, now: DateTime<Utc>, timeout: Duration) -> bool {
    let Some(last_beat) = parse_timestamp(&heartbeat.last_beat_at) else {
        return true;
    };
    match now.signed_duration_since(last_beat).to_std() {
        Ok(age) => age > timeout,
        // Beat recorded in the future (clock skew): not stale.
        Err(_) => false,
    }
}

/// Mutual-exclusion primitive over the lock and heartbeat descriptors.
#[derive(Debug, Clone)]
pub struct ControllerLock {
    paths: LockPaths,
    heartbeat_timeout: Duration,
    pid: u32,
}

impl ControllerLock {
    pub fn new(home: &CommanderHome) -> Self {
        Self::with_paths(home.lock_path(), home.heartbeat_path())
    }

    pub fn with_paths(lock_path: impl Into<PathBuf>, heartbeat_path: impl Into<PathBuf>) -> Self {
        Self {
            paths: LockPaths::new(lock_path.into(), heartbeat_path.into()),
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            pid: current_pid(),
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.paths.lock
    }

    pub fn heartbeat_path(&self) -> &Path {
        &self.paths.heartbeat
    }

    pub fn read_lock_info(&self) -> Result<Option<LockInfo>, LockError> {
        self.paths.read_lock()
    }

    pub fn read_heartbeat_info(&self) -> Result<Option<HeartbeatInfo>, LockError> {
        self.paths.read_heartbeat()
    }

    pub fn acquire(&self, force_takeover: bool) -> Result<AcquireOutcome, LockError> {
        self.acquire_at(force_takeover, Utc::now())
    }

    /// [`acquire`](Self::acquire) evaluated against an explicit clock reading.
    pub fn acquire_at(
        &self,
        force_takeover: bool,
        now: DateTime<Utc>,
    ) -> Result<AcquireOutcome, LockError> {
        let _section = self.paths.enter()?;
        let holder = self.paths.read_lock()?;
        let reason = match holder.as_ref() {
            None => LockReason::Acquired,
            Some(lock) => self.evaluate_held(lock, force_takeover, now)?,
        };

        if !reason.is_granted() {
            match holder.as_ref() {
                Some(lock) => info!(pid = lock.pid, reason = %reason, "controller lock denied"),
                None => info!(reason = %reason, "controller lock denied"),
            }
            return Ok(AcquireOutcome {
                reason,
                holder,
                guard: None,
            });
        }

        let session_id = new_session_id();
        let stamp = format_timestamp(now);
        self.paths.write_lock(&LockInfo {
            pid: self.pid,
            start_time: stamp.clone(),
            session_id: session_id.clone(),
        })?;
        self.paths.write_heartbeat(&HeartbeatInfo {
            session_id: session_id.clone(),
            last_beat_at: stamp,
        })?;
        if reason.is_takeover() {
            warn!(reason = %reason, previous = ?holder.as_ref().map(|l| l.pid), "controller lock taken over");
        }
        info!(pid = self.pid, session = %session_id, "controller lock acquired");

        Ok(AcquireOutcome {
            reason,
            holder,
            guard: Some(LockGuard {
                handle: LockHandle {
                    paths: self.paths.clone(),
                    session_id,
                },
                released: false,
            }),
        })
    }

    fn evaluate_held(
        &self,
        lock: &LockInfo,
        force_takeover: bool,
        now: DateTime<Utc>,
    ) -> Result<LockReason, LockError> {
        if !is_pid_alive(lock.pid) {
            return Ok(LockReason::StaleTakeoverPidDead);
        }
        let Some(heartbeat) = self.paths.read_heartbeat()? else {
            // Alive holder that never wrote a heartbeat: legacy or half-written
            // acquisition. Only an explicit force displaces it.
            return Ok(if force_takeover {
                LockReason::StaleTakeover
            } else {
                LockReason::LockDenied
            });
        };
        if heartbeat.session_id != lock.session_id {
            return Ok(if force_takeover {
                LockReason::StaleTakeover
            } else {
                LockReason::LockDeniedInconsistent
            });
        }
        if is_heartbeat_stale(&heartbeat, now, self.heartbeat_timeout) {
            return Ok(if force_takeover {
                LockReason::StaleTakeoverHeartbeatTimeout
            } else {
                LockReason::LockDeniedStaleHeartbeat
            });
        }
        Ok(if force_takeover {
            LockReason::ForceTakeover
        } else {
            LockReason::LockDenied
        })
    }

    /// Snapshot of the descriptors without acquiring anything.
    pub fn inspect(&self) -> Result<LockStatus, LockError> {
        let lock = self.paths.read_lock()?;
        let heartbeat = self.paths.read_heartbeat()?;
        let holder_alive = lock.as_ref().map(|l| is_pid_alive(l.pid)).unwrap_or(false);
        let consistent = match (&lock, &heartbeat) {
            (Some(lock), Some(hb)) => lock.session_id == hb.session_id,
            (None, None) => true,
            _ => false,
        };
        let heartbeat_stale = heartbeat
            .as_ref()
            .map(|hb| is_heartbeat_stale(hb, Utc::now(), self.heartbeat_timeout));
        Ok(LockStatus {
            lock,
            heartbeat,
            holder_alive,
            consistent,
            heartbeat_stale,
        })
    }
}

/// Cloneable reference to a granted session, usable from the heartbeat thread
/// and from signal handlers.
#[derive(Debug, Clone)]
pub struct LockHandle {
    paths: LockPaths,
    session_id: String,
}

impl LockHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Refresh `lastBeatAt`. Refuses once another session owns the lock, so a
    /// displaced holder never overwrites the new holder's heartbeat.
    pub fn heartbeat(&self) -> Result<(), LockError> {
        self.heartbeat_at(Utc::now())
    }

    pub fn heartbeat_at(&self, now: DateTime<Utc>) -> Result<(), LockError> {
        let _section = self.paths.enter()?;
        self.verify_holder()?;
        self.paths.write_heartbeat(&HeartbeatInfo {
            session_id: self.session_id.clone(),
            last_beat_at: format_timestamp(now),
        })?;
        debug!(session = %self.session_id, "heartbeat updated");
        Ok(())
    }

    /// Run `write` inside the critical section, only while the lock descriptor
    /// still names this session. A takeover cannot interleave with `write`.
    /// `write` must not enter the section itself.
    pub fn while_holding<T, E>(&self, write: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<LockError>,
    {
        let _section = self.paths.enter()?;
        self.verify_holder()?;
        write()
    }

    fn verify_holder(&self) -> Result<(), LockError> {
        match self.paths.read_lock()? {
            Some(lock) if lock.session_id == self.session_id => Ok(()),
            _ => Err(LockError::NotHolder {
                session_id: self.session_id.clone(),
            }),
        }
    }

    pub fn is_controller(&self) -> bool {
        matches!(
            self.paths.read_lock(),
            Ok(Some(lock)) if lock.session_id == self.session_id
        )
    }

    /// Delete each descriptor only while it still carries this session id.
    /// Safe to call repeatedly.
    pub fn release(&self) -> Result<ReleaseReport, LockError> {
        let _section = self.paths.enter()?;
        let mut report = ReleaseReport::default();
        if matches!(self.paths.read_lock()?, Some(lock) if lock.session_id == self.session_id) {
            remove_if_present(&self.paths.lock)?;
            report.lock_removed = true;
        }
        if matches!(self.paths.read_heartbeat()?, Some(hb) if hb.session_id == self.session_id) {
            remove_if_present(&self.paths.heartbeat)?;
            report.heartbeat_removed = true;
        }
        if report.lock_removed || report.heartbeat_removed {
            info!(session = %self.session_id, "controller lock released");
        }
        Ok(report)
    }
}

fn remove_if_present(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LockPaths::io_error(path, source)),
    }
}

/// Scoped ownership of the controller lock; dropping it releases.
#[derive(Debug)]
pub struct LockGuard {
    handle: LockHandle,
    released: bool,
}

impl LockGuard {
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    pub fn session_id(&self) -> &str {
        self.handle.session_id()
    }

    pub fn release(mut self) -> Result<ReleaseReport, LockError> {
        self.released = true;
        self.handle.release()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.handle.release() {
            warn!(session = %self.handle.session_id, error = %err, "failed to release controller lock");
        }
    }
}

/// Background thread refreshing the heartbeat on a fixed period.
///
/// Write failures are logged and survived; losing the lock to a takeover stops
/// the timer. Dropping the timer stops it without waiting out the period.
#[derive(Debug)]
pub struct HeartbeatTimer {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl HeartbeatTimer {
    pub fn spawn(handle: LockHandle, period: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("commander-heartbeat".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => match handle.heartbeat() {
                        Ok(()) => {}
                        Err(LockError::NotHolder { session_id }) => {
                            warn!(session = %session_id, "lock taken over; stopping heartbeat");
                            break;
                        }
                        Err(err) => warn!(error = %err, "heartbeat write failed"),
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });
        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(err) => {
                warn!(error = %err, "failed to start heartbeat thread");
                None
            }
        };
        Self {
            stop: Some(stop),
            thread,
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| !thread.is_finished())
            .unwrap_or(false)
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
