//! Checks that guard destructive workspace operations.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::backend::{BackendError, TreeStatus, WorkspaceBackend};

/// Written into every workspace the manager provisions.
pub const MARKER_FILE: &str = ".commander-worktree";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsafeReason {
    Unresolvable,
    MissingMarker,
    OutsideAllowedRoots,
    ProjectRoot,
}

impl UnsafeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            UnsafeReason::Unresolvable => "path does not resolve to an existing directory",
            UnsafeReason::MissingMarker => "workspace marker file is missing",
            UnsafeReason::OutsideAllowedRoots => {
                "path is outside the runs directory and every registered project"
            }
            UnsafeReason::ProjectRoot => "path is a registered project root",
        }
    }
}

impl fmt::Display for UnsafeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("Refusing to touch {path}: {reason}")]
    UnsafePath { path: PathBuf, reason: UnsafeReason },
    #[error("Workspace {path} has {files_changed} uncommitted change(s); pass --allow-dirty to proceed")]
    Dirty { path: PathBuf, files_changed: usize },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyPolicy {
    Refuse,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyCheck {
    pub status: TreeStatus,
    /// Set when the tree is dirty and the policy let the caller proceed.
    pub warning: Option<String>,
}

pub fn check_dirty_tree(
    backend: &dyn WorkspaceBackend,
    path: &Path,
    policy: DirtyPolicy,
) -> Result<DirtyCheck, SafetyError> {
    let status = backend.tree_status(path)?;
    if status.clean {
        return Ok(DirtyCheck {
            status,
            warning: None,
        });
    }
    match policy {
        DirtyPolicy::Refuse => Err(SafetyError::Dirty {
            path: path.to_path_buf(),
            files_changed: status.files_changed,
        }),
        DirtyPolicy::Warn => {
            let message = format!(
                "{} has {} uncommitted change(s); proceeding anyway",
                path.display(),
                status.files_changed
            );
            warn!(path = %path.display(), files = status.files_changed, "dirty workspace");
            Ok(DirtyCheck {
                status,
                warning: Some(message),
            })
        }
    }
}

/// Returns the canonical path when it is a marked workspace strictly inside
/// the runs directory or a registered project.
pub fn validate_worktree_path(
    path: &Path,
    runs_dir: &Path,
    project_paths: &[PathBuf],
) -> Result<PathBuf, SafetyError> {
    let refuse = |reason| SafetyError::UnsafePath {
        path: path.to_path_buf(),
        reason,
    };

    let canonical = path
        .canonicalize()
        .ok()
        .filter(|p| p.is_dir())
        .ok_or_else(|| refuse(UnsafeReason::Unresolvable))?;

    let roots: Vec<PathBuf> = std::iter::once(runs_dir)
        .chain(project_paths.iter().map(PathBuf::as_path))
        .filter_map(|root| root.canonicalize().ok())
        .collect();

    if project_paths
        .iter()
        .filter_map(|p| p.canonicalize().ok())
        .any(|p| p == canonical)
    {
        return Err(refuse(UnsafeReason::ProjectRoot));
    }
    if !roots
        .iter()
        .any(|root| canonical != *root && canonical.starts_with(root))
    {
        return Err(refuse(UnsafeReason::OutsideAllowedRoots));
    }
    if !canonical.join(MARKER_FILE).is_file() {
        return Err(refuse(UnsafeReason::MissingMarker));
    }
    Ok(canonical)
}
