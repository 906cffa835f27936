//! Checks for running peer processes.
//!
//! [`probe`] looks a peer up by name and only serves to give the user better
//! guidance before a submission. [`pid_status`] tells whether the receiver
//! that claimed a job still exists.

use nix::errno::Errno;
use serde::Serialize;
#[cfg(target_os = "linux")]
use std::path::Path;

/// Kernel limit on `/proc/<pid>/comm` (TASK_COMM_LEN - 1).
const COMM_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Running,
    NotRunning,
    /// The process table could not be inspected on this platform.
    Unknown,
}

/// Look for a process whose command name is `name`.
pub fn probe(name: &str) -> Presence {
    #[cfg(target_os = "linux")]
    {
        probe_proc(Path::new("/proc"), name)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = name;
        Presence::Unknown
    }
}

#[cfg(target_os = "linux")]
fn probe_proc(proc_root: &Path, name: &str) -> Presence {
    let wanted = comm_name(name);

    let entries = match std::fs::read_dir(proc_root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(error = %e, "Process table not readable");
            return Presence::Unknown;
        }
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let is_pid = file_name
            .to_str()
            .is_some_and(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()));
        if !is_pid {
            continue;
        }
        // Processes may exit between listing and reading
        if let Ok(comm) = std::fs::read(entry.path().join("comm"))
            && comm.trim_ascii_end() == wanted
        {
            return Presence::Running;
        }
    }

    Presence::NotRunning
}

/// Whether process `pid` exists, as far as `kill(pid, 0)` can tell.
///
/// Only meaningful inside one pid namespace. Zero and values outside the
/// kernel's pid range never name a single live process.
pub fn pid_status(pid: u32) -> Presence {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return Presence::NotRunning;
    };
    if raw == 0 {
        return Presence::NotRunning;
    }
    if unsafe { libc::kill(raw, 0) } == 0 {
        return Presence::Running;
    }
    match Errno::last() {
        Errno::ESRCH => Presence::NotRunning,
        // Exists, owned by somebody else
        Errno::EPERM => Presence::Running,
        _ => Presence::Unknown,
    }
}

fn comm_name(name: &str) -> &[u8] {
    let bytes = name.as_bytes();
    &bytes[..bytes.len().min(COMM_LEN)]
}
