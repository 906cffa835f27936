//! Centralized channel naming and sizing
//!
//! Both the simulation tool and the geometry processor resolve the shared
//! segment from these values, so the two sides cannot drift apart.

use std::path::{Path, PathBuf};

/// Well-known channel name shared by both processes
pub const CHANNEL_NAME: &str = "GeomIPC_v1";

/// Directory holding POSIX shared-memory segments on Linux
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Segment size in bytes (the command block plus headroom)
pub const CHANNEL_SIZE: usize = 2048;

/// Process name probed before a submission (advisory only)
pub const GEOM_PROCESSOR_PROCESS: &str = "geomprocessor";

/// Default poll period for both halves of the protocol
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Resolve the backing file of channel `name` inside `dir`.
///
/// Returns `None` when `name` is empty or would escape `dir`.
pub fn segment_path(dir: impl AsRef<Path>, name: &str) -> Option<PathBuf> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." || name.contains('\0') {
        return None;
    }
    Some(dir.as_ref().join(name))
}
