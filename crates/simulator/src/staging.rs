//! Copying the user's file into the hand-off directory.
//!
//! The processor reads and writes next to the file it is given, so it gets a
//! private copy under a fresh name and the user's original stays untouched.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const RECEIVED_DIR: &str = "example/received";

/// Pick the hand-off directory.
///
/// An explicit directory is created if needed. Otherwise the first existing
/// `example/received` two or one levels above `exe_dir` is used, falling back
/// to one created inside `exe_dir`.
pub fn handoff_dir(explicit: Option<&Path>, exe_dir: &Path) -> io::Result<PathBuf> {
    if let Some(dir) = explicit {
        fs::create_dir_all(dir)?;
        return Ok(dir.to_path_buf());
    }

    let candidates = [exe_dir.join("../.."), exe_dir.join("..")];
    for base in candidates {
        let dir = base.join(RECEIVED_DIR);
        if dir.is_dir() {
            return Ok(dir);
        }
    }

    let dir = exe_dir.join(RECEIVED_DIR);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Copy `source` into `dir` as `<uuid>.stp` and return the copy's path.
pub fn stage(source: &Path, dir: &Path) -> io::Result<PathBuf> {
    let staged = dir.join(format!("{}.stp", Uuid::new_v4()));
    fs::copy(source, &staged)?;
    Ok(staged)
}

/// Stage `source`, or fall back to sending the original path.
pub fn stage_or_original(source: &Path, explicit: Option<&Path>, exe_dir: &Path) -> PathBuf {
    let staged = handoff_dir(explicit, exe_dir).and_then(|dir| stage(source, &dir));
    match staged {
        Ok(path) => {
            tracing::info!(source = %source.display(), staged = %path.display(), "File staged");
            path
        }
        Err(e) => {
            tracing::warn!(
                source = %source.display(),
                error = %e,
                "Staging failed, sending the original path"
            );
            source.to_path_buf()
        }
    }
}

/// Directory of the running executable.
pub fn exe_dir() -> io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "executable has no parent"))
}
