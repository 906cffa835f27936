use nix::errno::Errno;
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};

/// Exclusive `flock(2)` on an open file, released on drop.
///
/// The lock belongs to the open file description, so two handles opened
/// separately on the same segment exclude each other even inside a single
/// process, and the kernel drops it if the holder dies.
pub(crate) struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    /// Block until the lock is ours.
    pub fn acquire(file: &'a File) -> Result<Self, Errno> {
        loop {
            match flock(file.as_raw_fd(), libc::LOCK_EX) {
                Ok(()) => return Ok(Self { file }),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno),
            }
        }
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        if let Err(errno) = flock(self.file.as_raw_fd(), libc::LOCK_UN) {
            tracing::warn!(error = %errno, "Failed to release channel lock");
        }
    }
}

fn flock(fd: RawFd, operation: libc::c_int) -> Result<(), Errno> {
    let ret = unsafe { libc::flock(fd, operation) };
    if ret != 0 {
        return Err(Errno::last());
    }
    Ok(())
}
