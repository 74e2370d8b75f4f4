use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use ulid::Ulid;
use uuid::Uuid;

/// Layout of the application home directory shared by every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommanderHome {
    root: PathBuf,
}

impl CommanderHome {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve() -> Result<Self> {
        resolve_commander_home().map(Self::at)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.locks_dir().join("commander.lock")
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.locks_dir().join("commander.heartbeat")
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join("events.log")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.locks_dir())
            .with_context(|| format!("create locks dir under {}", self.root.display()))?;
        Ok(())
    }
}

pub fn resolve_commander_home() -> Result<PathBuf> {
    if let Ok(value) = std::env::var("COMMANDER_HOME") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }
    home_dir()
        .map(|home| home.join(".cloud-harness"))
        .ok_or_else(|| {
            anyhow!("Unable to resolve home directory; set COMMANDER_HOME to an absolute path")
        })
}

fn home_dir() -> Option<PathBuf> {
    if let Ok(home) = std::env::var("HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    if let Ok(profile) = std::env::var("USERPROFILE") {
        let trimmed = profile.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    None
}

/// UTC timestamp in RFC 3339 with a `Z` suffix, the format of every persisted time.
pub fn now_rfc3339() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

/// Entity id. Random from the first character, so the 8-character display
/// prefix does not repeat for items created in the same second.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Session ids sort by creation time in the event log.
pub fn new_session_id() -> String {
    Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn home_layout_is_rooted() {
        let home = CommanderHome::at("/tmp/ch");
        assert_eq!(home.state_path(), PathBuf::from("/tmp/ch/state.json"));
        assert_eq!(
            home.lock_path(),
            PathBuf::from("/tmp/ch/locks/commander.lock")
        );
        assert_eq!(
            home.heartbeat_path(),
            PathBuf::from("/tmp/ch/locks/commander.heartbeat")
        );
        assert_eq!(home.events_path(), PathBuf::from("/tmp/ch/events.log"));
    }

    #[test]
    fn timestamps_round_trip_in_utc() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let raw = format_timestamp(at);
        assert!(raw.ends_with('Z'));
        assert_eq!(parse_timestamp(&raw), Some(at));
        assert_eq!(parse_timestamp("not a time"), None);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_id(), new_id());
        assert_ne!(new_session_id(), new_session_id());
    }

    #[test]
    fn back_to_back_ids_differ_in_display_prefix() {
        let ids: Vec<String> = (0..64).map(|_| new_id()).collect();
        let prefixes: std::collections::HashSet<&str> = ids.iter().map(|id| &id[..8]).collect();
        assert_eq!(prefixes.len(), ids.len());
    }

    #[test]
    #[serial_test::serial]
    fn env_override_wins_and_blank_is_ignored() {
        let previous = std::env::var_os("COMMANDER_HOME");

        std::env::set_var("COMMANDER_HOME", "  /srv/commander  ");
        assert_eq!(
            resolve_commander_home().expect("resolve"),
            PathBuf::from("/srv/commander")
        );

        std::env::set_var("COMMANDER_HOME", "   ");
        let fallback = resolve_commander_home().expect("resolve");
        assert!(fallback.ends_with(".cloud-harness"));

        match previous {
            Some(value) => std::env::set_var("COMMANDER_HOME", value),
            None => std::env::remove_var("COMMANDER_HOME"),
        }
    }
}
