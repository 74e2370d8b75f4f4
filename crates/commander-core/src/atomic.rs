//! Temp-write, fsync, rename.
//!
//! At every instant the committed path holds either the previous complete
//! generation or the next one. A leftover `*.tmp` sibling is always the residue
//! of an interrupted write and never newer than what it would have replaced.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Sibling temp path used while writing `path` (`state.json` -> `state.json.tmp`).
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to the temp sibling of `path` and force them to storage.
pub fn stage(path: &Path, bytes: &[u8]) -> io::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path_for(path);
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()?;
    Ok(tmp)
}

/// Atomically move a staged temp file over the committed path.
pub fn commit(tmp: &Path, path: &Path) -> io::Result<()> {
    fs::rename(tmp, path)?;
    sync_parent(path);
    Ok(())
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = stage(path, bytes)?;
    commit(&tmp, path)
}

/// Remove the temp sibling of `path` if present. Returns true when one was found.
pub fn purge_temp(path: &Path) -> io::Result<bool> {
    let tmp = temp_path_for(path);
    match fs::remove_file(&tmp) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    // Makes the rename itself durable; failure leaves an older but complete generation.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}
