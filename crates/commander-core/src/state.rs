use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::atomic::{purge_temp, temp_path_for, write_atomic};
use crate::model::{InboxItem, ModelError, Project, Run, State, Task};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("State IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "State file {path} is corrupted ({source}); run `commander doctor --repair-state` to set it aside and start fresh"
    )]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("State file {path} is inconsistent: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: ModelError,
    },
    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of an explicit repair of the committed state file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairOutcome {
    /// Where the unreadable generation was moved, when there was one.
    pub preserved_at: Option<PathBuf>,
}

/// Sole owner and writer of the persisted [`State`].
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: Option<State>,
}

impl StateStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn temp_path(&self) -> PathBuf {
        temp_path_for(&self.path)
    }

    /// Last loaded or replaced snapshot.
    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    /// Read the committed generation, discarding any leftover temp file first.
    /// A missing file is initialised with an empty state and persisted.
    pub fn load(&mut self) -> Result<State, StateError> {
        if purge_temp(&self.path).map_err(|source| self.io_error(source))? {
            warn!(path = %self.temp_path().display(), "discarded incomplete state write");
        }

        let state = match fs::read_to_string(&self.path) {
            Ok(raw) => self.parse(&raw)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "state file missing, creating empty state");
                let state = State::default();
                self.persist(&state)?;
                state
            }
            Err(source) => return Err(self.io_error(source)),
        };
        self.state = Some(state.clone());
        Ok(state)
    }

    /// Read the committed generation without writing anything. A missing file
    /// reads as an empty state and a leftover temp file is left alone.
    pub fn read_snapshot(&mut self) -> Result<State, StateError> {
        let state = match fs::read_to_string(&self.path) {
            Ok(raw) => self.parse(&raw)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => State::default(),
            Err(source) => return Err(self.io_error(source)),
        };
        self.state = Some(state.clone());
        Ok(state)
    }

    /// Persist `new_state` as the next committed generation.
    pub fn replace(&mut self, new_state: State) -> Result<(), StateError> {
        new_state.validate().map_err(|source| StateError::Invalid {
            path: self.path.clone(),
            source,
        })?;
        self.persist(&new_state)?;
        info!(path = %self.path.display(), "state saved");
        self.state = Some(new_state);
        Ok(())
    }

    pub fn project(&self, id: &str) -> Option<&Project> {
        self.state.as_ref().and_then(|state| state.project(id))
    }

    pub fn run(&self, id: &str) -> Option<&Run> {
        self.state.as_ref().and_then(|state| state.run(id))
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.state.as_ref().and_then(|state| state.task(id))
    }

    pub fn inbox_item(&self, id: &str) -> Option<&InboxItem> {
        self.state.as_ref().and_then(|state| state.inbox_item(id))
    }

    /// Explicit operator repair: an unreadable committed file is moved aside
    /// (never deleted) and an empty state is committed in its place.
    pub fn repair(&mut self) -> Result<RepairOutcome, StateError> {
        purge_temp(&self.path).map_err(|source| self.io_error(source))?;
        let readable = match fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str::<State>(&raw)
                .ok()
                .filter(|state| state.validate().is_ok()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Some(State::default()),
            Err(source) => return Err(self.io_error(source)),
        };
        if let Some(state) = readable {
            if !self.path.exists() {
                self.persist(&state)?;
            }
            self.state = Some(state);
            return Ok(RepairOutcome { preserved_at: None });
        }

        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let mut aside = self.path.clone().into_os_string();
        aside.push(format!(".corrupt-{stamp}"));
        let aside = PathBuf::from(aside);
        fs::rename(&self.path, &aside).map_err(|source| self.io_error(source))?;
        warn!(preserved = %aside.display(), "moved corrupted state aside");

        let state = State::default();
        self.persist(&state)?;
        self.state = Some(state);
        Ok(RepairOutcome {
            preserved_at: Some(aside),
        })
    }

    fn parse(&self, raw: &str) -> Result<State, StateError> {
        let state: State = serde_json::from_str(raw).map_err(|source| StateError::Corrupted {
            path: self.path.clone(),
            source,
        })?;
        state.validate().map_err(|source| StateError::Invalid {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "loaded state");
        Ok(state)
    }

    fn persist(&self, state: &State) -> Result<(), StateError> {
        let body = serde_json::to_string_pretty(state)?;
        write_atomic(&self.path, body.as_bytes()).map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::stage;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn load_creates_and_persists_empty_state() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("state.json");
        let mut store = StateStore::open(&path);
        let state = store.load().expect("load");
        assert_eq!(state, State::default());
        assert!(path.exists());
    }

    #[test]
    fn replace_then_reload_round_trips() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("state.json");
        let mut store = StateStore::open(&path);
        let mut state = store.load().expect("load");
        let item = state.capture("write docs").expect("capture");
        store.replace(state.clone()).expect("replace");

        let mut reopened = StateStore::open(&path);
        assert_eq!(reopened.load().expect("reload"), state);
        assert_eq!(
            reopened.inbox_item(&item.id).map(|i| i.text.as_str()),
            Some("write docs")
        );
    }

    #[test]
    fn interrupted_write_leaves_committed_generation() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("state.json");
        let mut store = StateStore::open(&path);
        let mut state = store.load().expect("load");
        state.capture("first").expect("capture");
        store.replace(state.clone()).expect("replace");
        let committed = fs::read(&path).expect("read");

        // Process dies after the temp file is written but before rename.
        stage(&path, b"{\"inbox\": [ {\"id\": \"half").expect("stage");

        let mut next = StateStore::open(&path);
        assert_eq!(next.load().expect("load"), state);
        assert_eq!(fs::read(&path).expect("read"), committed);
        assert!(!next.temp_path().exists());
    }

    #[test]
    fn snapshot_read_never_writes() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("state.json");
        let mut store = StateStore::open(&path);
        assert_eq!(store.read_snapshot().expect("read"), State::default());
        assert!(!path.exists());

        stage(&path, b"partial").expect("stage");
        store.read_snapshot().expect("read");
        assert!(store.temp_path().exists());
    }

    #[test]
    fn corrupted_file_is_reported_not_reset() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("state.json");
        fs::write(&path, "{ not json").expect("write");
        let mut store = StateStore::open(&path);
        let err = store.load().expect_err("corrupted");
        assert!(matches!(err, StateError::Corrupted { .. }));
        assert_eq!(fs::read_to_string(&path).expect("read"), "{ not json");
    }

    #[test]
    fn repair_preserves_corrupted_generation() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("state.json");
        fs::write(&path, "{ not json").expect("write");
        let mut store = StateStore::open(&path);
        let outcome = store.repair().expect("repair");
        let aside = outcome.preserved_at.expect("moved aside");
        assert_eq!(fs::read_to_string(aside).expect("read"), "{ not json");
        assert_eq!(store.load().expect("load"), State::default());
    }

    #[test]
    fn repair_of_healthy_state_is_a_no_op() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("state.json");
        let mut store = StateStore::open(&path);
        let mut state = store.load().expect("load");
        state.capture("keep me").expect("capture");
        store.replace(state.clone()).expect("replace");
        let outcome = store.repair().expect("repair");
        assert!(outcome.preserved_at.is_none());
        assert_eq!(store.load().expect("load"), state);
    }

    #[test]
    fn replace_rejects_invalid_state() {
        let temp = TempDir::new().expect("tempdir");
        let mut store = StateStore::open(temp.path().join("state.json"));
        let mut state = store.load().expect("load");
        state.capture("a").expect("capture");
        state.inbox[0].id.clear();
        assert!(matches!(
            store.replace(state),
            Err(StateError::Invalid { .. })
        ));
    }
}
