use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::home::now_rfc3339;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("Failed to write event log: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    SessionStarted,
    SessionEnded,
    LockAcquired,
    LockDenied,
    LockReleased,
    LockStaleTakeover,
    ReconcileStart,
    ReconcileResult,
    CommandPlan,
    CommandExecute,
    CommandVerifyOk,
    CommandVerifyFail,
    StateUpdated,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::SessionStarted => "SESSION_STARTED",
            EventType::SessionEnded => "SESSION_ENDED",
            EventType::LockAcquired => "LOCK_ACQUIRED",
            EventType::LockDenied => "LOCK_DENIED",
            EventType::LockReleased => "LOCK_RELEASED",
            EventType::LockStaleTakeover => "LOCK_STALE_TAKEOVER",
            EventType::ReconcileStart => "RECONCILE_START",
            EventType::ReconcileResult => "RECONCILE_RESULT",
            EventType::CommandPlan => "COMMAND_PLAN",
            EventType::CommandExecute => "COMMAND_EXECUTE",
            EventType::CommandVerifyOk => "COMMAND_VERIFY_OK",
            EventType::CommandVerifyFail => "COMMAND_VERIFY_FAIL",
            EventType::StateUpdated => "STATE_UPDATED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of `events.log`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub session_id: String,
    #[serde(default)]
    pub data: Value,
}

/// Append-only, session-tagged audit sink. Nothing reads it back to make decisions.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
    session_id: String,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            session_id: session_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Same file, events tagged with another session (used once a lock is granted).
    pub fn with_session(&self, session_id: impl Into<String>) -> Self {
        Self::new(self.path.clone(), session_id)
    }

    pub fn append(&self, event_type: EventType, data: Value) -> Result<(), EventLogError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let event = Event {
            timestamp: now_rfc3339(),
            event_type: event_type.as_str().to_string(),
            session_id: self.session_id.clone(),
            data,
        };
        let line = serde_json::to_string(&event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        debug!(event = %event_type, "logged event");
        Ok(())
    }

    pub fn session_started(&self, mode: &str) -> Result<(), EventLogError> {
        self.append(
            EventType::SessionStarted,
            json!({ "mode": mode, "sessionId": self.session_id }),
        )
    }

    pub fn session_ended(&self) -> Result<(), EventLogError> {
        self.append(EventType::SessionEnded, json!({}))
    }

    pub fn lock_acquired(&self, reason: &str) -> Result<(), EventLogError> {
        self.append(
            EventType::LockAcquired,
            json!({ "sessionId": self.session_id, "reason": reason }),
        )
    }

    pub fn lock_denied(&self, reason: &str, controller_pid: Option<u32>) -> Result<(), EventLogError> {
        self.append(
            EventType::LockDenied,
            json!({ "reason": reason, "controllerPid": controller_pid }),
        )
    }

    pub fn lock_released(&self) -> Result<(), EventLogError> {
        self.append(EventType::LockReleased, json!({}))
    }

    pub fn lock_stale_takeover(
        &self,
        reason: &str,
        previous_session_id: Option<&str>,
    ) -> Result<(), EventLogError> {
        self.append(
            EventType::LockStaleTakeover,
            json!({ "reason": reason, "previousSessionId": previous_session_id }),
        )
    }

    pub fn reconcile_start(&self) -> Result<(), EventLogError> {
        self.append(EventType::ReconcileStart, json!({}))
    }

    pub fn reconcile_result(&self, changes: Value) -> Result<(), EventLogError> {
        self.append(EventType::ReconcileResult, changes)
    }

    pub fn command_plan(&self, command: &str, plan: Value) -> Result<(), EventLogError> {
        self.append(
            EventType::CommandPlan,
            json!({ "command": command, "plan": plan }),
        )
    }

    pub fn command_execute(&self, command: &str) -> Result<(), EventLogError> {
        self.append(EventType::CommandExecute, json!({ "command": command }))
    }

    pub fn command_verify_ok(&self, command: &str) -> Result<(), EventLogError> {
        self.append(EventType::CommandVerifyOk, json!({ "command": command }))
    }

    pub fn command_verify_fail(&self, command: &str, error: &str) -> Result<(), EventLogError> {
        self.append(
            EventType::CommandVerifyFail,
            json!({ "command": command, "error": error }),
        )
    }

    pub fn state_updated(&self, changes: Value) -> Result<(), EventLogError> {
        self.append(EventType::StateUpdated, changes)
    }
}

/// Read events back for postmortems. Malformed lines are skipped; `limit` keeps the most recent.
pub fn read_events(path: &Path, limit: Option<usize>) -> Result<Vec<Event>, EventLogError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(trimmed) {
            Ok(event) => events.push(event),
            Err(err) => warn!(line = idx + 1, error = %err, "skipping malformed event log line"),
        }
    }
    if let Some(limit) = limit {
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }
    }
    Ok(events)
}

pub fn session_events(path: &Path, session_id: &str) -> Result<Vec<Event>, EventLogError> {
    Ok(read_events(path, None)?
        .into_iter()
        .filter(|event| event.session_id == session_id)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_writes_one_json_object_per_line() {
        let temp = TempDir::new().expect("tempdir");
        let log = EventLog::new(temp.path().join("events.log"), "session-a");
        log.session_started("controller").expect("start");
        log.lock_stale_takeover("STALE_TAKEOVER_PID_DEAD", Some("old"))
            .expect("takeover");

        let raw = fs::read_to_string(log.path()).expect("read");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["type"], "SESSION_STARTED");
        assert_eq!(first["sessionId"], "session-a");
        assert_eq!(first["data"]["mode"], "controller");
        assert!(first["timestamp"].as_str().unwrap_or("").ends_with('Z'));
    }

    #[test]
    fn read_skips_malformed_lines_and_applies_limit() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("events.log");
        let log = EventLog::new(&path, "s1");
        log.reconcile_start().expect("start");
        {
            let mut file = OpenOptions::new().append(true).open(&path).expect("open");
            writeln!(file, "{{ torn line").expect("write");
            writeln!(file).expect("blank");
        }
        log.reconcile_result(json!({ "runsParked": 1 })).expect("result");
        log.with_session("s2").session_ended().expect("end");

        let all = read_events(&path, None).expect("read");
        assert_eq!(all.len(), 3);
        let recent = read_events(&path, Some(2)).expect("read");
        assert_eq!(recent[0].event_type, "RECONCILE_RESULT");
        assert_eq!(recent[1].session_id, "s2");

        let s1 = session_events(&path, "s1").expect("filter");
        assert_eq!(s1.len(), 2);
    }

    #[test]
    fn missing_log_reads_empty() {
        let temp = TempDir::new().expect("tempdir");
        assert!(read_events(&temp.path().join("nope.log"), None)
            .expect("read")
            .is_empty());
    }
}
