//! Workspace backend boundary and its git-worktree implementation.
//!
//! The reconciler only needs to list runs and ask whether a workspace is clean;
//! provisioning and removal live here as thin plumbing for the CLI.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::model::{validate_run_name, ModelError};
use crate::safety::MARKER_FILE;

pub const RUN_METADATA_FILE: &str = ".run.json";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },
    #[error("Invalid run metadata {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Run directory {0} already exists")]
    AlreadyExists(PathBuf),
    #[error("Run '{0}' not found in backend")]
    NotFound(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// `.run.json` as written at provisioning time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    pub name: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub created_at: f64,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub project_dir: String,
}

fn default_status() -> String {
    "unknown".to_string()
}

/// One run as the backend sees it (ground truth for reconciliation).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackendRun {
    pub name: String,
    pub branch: Option<String>,
    /// Raw backend status: `active`, `finished`, `failed`, ...
    pub status: String,
    pub worktree_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TreeStatus {
    pub branch: Option<String>,
    pub clean: bool,
    pub files_changed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitWorktreeEntry {
    pub path: String,
    #[serde(default)]
    pub head: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub bare: bool,
}

pub trait WorkspaceBackend {
    /// Repository that owns the runs.
    fn root(&self) -> &Path;

    /// Directory managed run workspaces are created under.
    fn runs_dir(&self) -> PathBuf {
        self.root().join("runs")
    }

    /// Identity used to key cached reconciliation results.
    fn cache_key(&self) -> String;

    fn list_runs(&self) -> Result<Vec<BackendRun>, BackendError>;

    fn tree_status(&self, path: &Path) -> Result<TreeStatus, BackendError>;
}

/// Runs are git worktrees at `<root>/runs/<name>` on branch `run/<name>`.
#[derive(Debug, Clone)]
pub struct GitHarnessBackend {
    root: PathBuf,
}

impl GitHarnessBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, name: &str) -> PathBuf {
        self.runs_dir().join(name)
    }

    pub fn branch_for(name: &str) -> String {
        format!("run/{name}")
    }

    /// Create the worktree, then drop metadata and the ownership marker into it.
    pub fn provision(&self, name: &str, base_branch: &str) -> Result<BackendRun, BackendError> {
        validate_run_name(name)?;
        let run_dir = self.run_dir(name);
        if run_dir.exists() {
            return Err(BackendError::AlreadyExists(run_dir));
        }
        let runs_dir = self.runs_dir();
        fs::create_dir_all(&runs_dir).map_err(|source| io_error(&runs_dir, source))?;

        let branch = Self::branch_for(name);
        let run_dir_arg = run_dir.to_string_lossy().to_string();
        git(
            &self.root,
            &["worktree", "add", "-b", &branch, &run_dir_arg, base_branch.trim()],
        )?;

        let metadata = RunMetadata {
            name: name.to_string(),
            branch: branch.clone(),
            created_at: unix_seconds(),
            status: "active".to_string(),
            project_dir: run_dir
                .canonicalize()
                .unwrap_or_else(|_| run_dir.clone())
                .to_string_lossy()
                .to_string(),
        };
        write_metadata(&run_dir, &metadata)?;
        let marker = run_dir.join(MARKER_FILE);
        fs::write(&marker, format!("{name}\n")).map_err(|source| io_error(&marker, source))?;

        Ok(BackendRun {
            name: name.to_string(),
            branch: Some(branch),
            status: metadata.status,
            worktree_path: run_dir,
        })
    }

    /// Update the status recorded in `.run.json`.
    pub fn set_status(&self, name: &str, status: &str) -> Result<RunMetadata, BackendError> {
        let run_dir = self.run_dir(name);
        let mut metadata = read_metadata(&run_dir)?.ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        metadata.status = status.to_string();
        write_metadata(&run_dir, &metadata)?;
        Ok(metadata)
    }

    /// Remove the worktree at `path`. Callers must run the safety checks first.
    pub fn remove(&self, name: &str, path: &Path, delete_branch: bool) -> Result<(), BackendError> {
        if path.exists() {
            let path_arg = path.to_string_lossy().to_string();
            if let Err(err) = git(&self.root, &["worktree", "remove", "--force", &path_arg]) {
                warn!(path = %path.display(), error = %err, "git worktree remove failed, deleting directory");
            }
            if path.exists() {
                fs::remove_dir_all(path).map_err(|source| io_error(path, source))?;
            }
        }
        if let Err(err) = git(&self.root, &["worktree", "prune"]) {
            warn!(error = %err, "git worktree prune failed");
        }
        if delete_branch {
            let branch = Self::branch_for(name);
            if let Err(err) = git(&self.root, &["branch", "-D", &branch]) {
                warn!(branch = %branch, error = %err, "could not delete run branch");
            }
        }
        Ok(())
    }

    pub fn list_git_worktrees(&self) -> Result<Vec<GitWorktreeEntry>, BackendError> {
        let raw = git(&self.root, &["worktree", "list", "--porcelain"])?;
        Ok(parse_git_worktree_list(&raw))
    }
}

impl WorkspaceBackend for GitHarnessBackend {
    fn root(&self) -> &Path {
        &self.root
    }

    fn cache_key(&self) -> String {
        format!("git:{}", self.root.display())
    }

    fn list_runs(&self) -> Result<Vec<BackendRun>, BackendError> {
        let runs_dir = self.runs_dir();
        let read_dir = match fs::read_dir(&runs_dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&runs_dir, source)),
        };

        let mut runs = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|source| io_error(&runs_dir, source))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let metadata = match read_metadata(&path) {
                Ok(Some(metadata)) => metadata,
                Ok(None) => continue,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping run with unreadable metadata");
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().to_string();
            runs.push(BackendRun {
                name,
                branch: Some(metadata.branch).filter(|b| !b.trim().is_empty()),
                status: metadata.status,
                worktree_path: path,
            });
        }
        runs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(runs)
    }

    fn tree_status(&self, path: &Path) -> Result<TreeStatus, BackendError> {
        let branch = git(path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty() && raw != "HEAD");
        let porcelain = git(path, &["status", "--porcelain"])?;
        let files_changed = count_changed_files(&porcelain);
        Ok(TreeStatus {
            branch,
            clean: files_changed == 0,
            files_changed,
        })
    }
}

/// Porcelain lines, ignoring the metadata and marker files the manager writes itself.
pub fn count_changed_files(porcelain: &str) -> usize {
    porcelain
        .lines()
        .filter(|line| line.len() > 3)
        .filter(|line| {
            let path = line[3..].trim().trim_matches('"');
            path != RUN_METADATA_FILE && path != MARKER_FILE
        })
        .count()
}

pub fn read_metadata(run_dir: &Path) -> Result<Option<RunMetadata>, BackendError> {
    let path = run_dir.join(RUN_METADATA_FILE);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(io_error(&path, source)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| BackendError::Metadata { path, source })
}

fn write_metadata(run_dir: &Path, metadata: &RunMetadata) -> Result<(), BackendError> {
    let path = run_dir.join(RUN_METADATA_FILE);
    let body = serde_json::to_string_pretty(metadata).map_err(|source| BackendError::Metadata {
        path: path.clone(),
        source,
    })?;
    fs::write(&path, body).map_err(|source| io_error(&path, source))
}

fn git(cwd: &Path, args: &[&str]) -> Result<String, BackendError> {
    let output = Command::new("git")
        .arg("-C")
        .arg(cwd)
        .args(args)
        .output()
        .map_err(|source| io_error(cwd, source))?;
    if !output.status.success() {
        return Err(BackendError::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub fn parse_git_worktree_list(raw: &str) -> Vec<GitWorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<GitWorktreeEntry> = None;
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            continue;
        }
        if let Some(value) = trimmed.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(GitWorktreeEntry {
                path: value.trim().to_string(),
                head: None,
                branch: None,
                bare: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(value) = trimmed.strip_prefix("HEAD ") {
            entry.head = Some(value.trim().to_string());
        } else if let Some(value) = trimmed.strip_prefix("branch ") {
            let value = value.trim();
            entry.branch = Some(value.strip_prefix("refs/heads/").unwrap_or(value).to_string());
        } else if trimmed == "bare" {
            entry.bare = true;
        }
    }
    if let Some(entry) = current.take() {
        entries.push(entry);
    }
    entries
}

fn io_error(path: &Path, source: io::Error) -> BackendError {
    BackendError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_run(root: &Path, name: &str, status: &str) {
        let dir = root.join("runs").join(name);
        fs::create_dir_all(&dir).expect("run dir");
        let metadata = RunMetadata {
            name: name.to_string(),
            branch: format!("run/{name}"),
            created_at: 1.0,
            status: status.to_string(),
            project_dir: dir.to_string_lossy().to_string(),
        };
        write_metadata(&dir, &metadata).expect("metadata");
    }

    #[test]
    fn list_runs_reads_metadata_and_skips_strays() {
        let temp = TempDir::new().expect("tempdir");
        write_run(temp.path(), "beta", "finished");
        write_run(temp.path(), "alpha", "active");
        fs::create_dir_all(temp.path().join("runs").join("no-metadata")).expect("stray");
        fs::write(temp.path().join("runs").join("loose-file"), "x").expect("file");
        let broken = temp.path().join("runs").join("broken");
        fs::create_dir_all(&broken).expect("broken");
        fs::write(broken.join(RUN_METADATA_FILE), "{").expect("broken metadata");

        let backend = GitHarnessBackend::new(temp.path());
        let runs = backend.list_runs().expect("list");
        let names: Vec<&str> = runs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(runs[0].branch.as_deref(), Some("run/alpha"));
        assert_eq!(runs[1].status, "finished");
    }

    #[test]
    fn list_runs_without_runs_dir_is_empty() {
        let temp = TempDir::new().expect("tempdir");
        let backend = GitHarnessBackend::new(temp.path());
        assert!(backend.list_runs().expect("list").is_empty());
    }

    #[test]
    fn set_status_rewrites_metadata() {
        let temp = TempDir::new().expect("tempdir");
        write_run(temp.path(), "alpha", "active");
        let backend = GitHarnessBackend::new(temp.path());
        backend.set_status("alpha", "finished").expect("set");
        let metadata = read_metadata(&backend.run_dir("alpha"))
            .expect("read")
            .expect("present");
        assert_eq!(metadata.status, "finished");
        assert!(matches!(
            backend.set_status("ghost", "finished"),
            Err(BackendError::NotFound(_))
        ));
    }

    #[test]
    fn changed_files_ignore_manager_files() {
        let porcelain = "?? .run.json\n?? .commander-worktree\n M src/lib.rs\n?? notes.txt\n";
        assert_eq!(count_changed_files(porcelain), 2);
        assert_eq!(count_changed_files(""), 0);
    }

    #[test]
    fn parse_git_worktree_list_parses_entries() {
        let raw = "\
worktree /repo/main
HEAD abcdef
branch refs/heads/main

worktree /repo/runs/feature
HEAD 123456
branch refs/heads/run/feature
";
        let parsed = parse_git_worktree_list(raw);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].branch.as_deref(), Some("main"));
        assert_eq!(parsed[1].branch.as_deref(), Some("run/feature"));
        assert_eq!(parsed[1].path, "/repo/runs/feature");
    }
}
