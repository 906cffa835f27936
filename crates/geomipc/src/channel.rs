use crate::block::{Command, CommandBlock, Identity};
use crate::errors::GeomIpcError;
use crate::lock::FileLock;
use crate::paths;
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Handle on the shared command block.
///
/// The segment is a file in the shared-memory directory mapped read-write.
/// Every access goes through [`Channel::lock`]; the returned guard holds an
/// exclusive `flock` for as long as it lives and the block can only be read
/// or written through it. The lock syscalls order the plain memory accesses
/// made while it is held against those of the peer process.
pub struct Channel {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    seen_valid: bool,
    created: bool,
}

impl Channel {
    /// Attach to channel `name`; create and initialize it if missing.
    pub fn open(name: &str, size: usize) -> Result<Self, GeomIpcError> {
        Self::open_in(paths::DEFAULT_SHM_DIR, name, size)
    }

    /// Like [`Channel::open`], with the segment directory overridden.
    pub fn open_in(dir: impl AsRef<Path>, name: &str, size: usize) -> Result<Self, GeomIpcError> {
        let path = paths::segment_path(&dir, name).ok_or_else(|| {
            GeomIpcError::ChannelUnavailable {
                path: dir.as_ref().join(name),
                source: io::Error::new(io::ErrorKind::InvalidInput, "invalid channel name"),
            }
        })?;
        Self::open_at(path, size)
    }

    /// Attach to the segment backed by `path`, creating it if needed.
    ///
    /// An existing segment smaller than `size` is grown; a larger one is
    /// mapped whole. A block without the magic stamp is initialized to
    /// `IDLE`. A stamped block from another protocol version is left alone.
    pub fn open_at(path: impl Into<PathBuf>, size: usize) -> Result<Self, GeomIpcError> {
        let path = path.into();
        let unavailable = |source: io::Error| GeomIpcError::ChannelUnavailable {
            path: path.clone(),
            source,
        };

        if size < CommandBlock::SIZE {
            return Err(unavailable(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "segment size {size} is smaller than the command block ({} bytes)",
                    CommandBlock::SIZE
                ),
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)
            .map_err(unavailable)?;

        let created = {
            let _lock = FileLock::acquire(&file).map_err(|errno| lock_failed(&path, errno))?;
            let len = file.metadata().map_err(unavailable)?.len();
            if len < size as u64 {
                file.set_len(size as u64).map_err(unavailable)?;
            }
            len == 0
        };

        let mmap = unsafe { MmapOptions::new().map_mut(&file) }.map_err(unavailable)?;

        let mut channel = Self {
            path,
            file,
            mmap,
            seen_valid: false,
            created,
        };

        {
            let _lock =
                FileLock::acquire(&channel.file).map_err(|errno| lock_failed(&channel.path, errno))?;
            let mut guard = ChannelGuard {
                _lock,
                mmap: &mut channel.mmap,
                seen_valid: &mut channel.seen_valid,
            };
            match guard.load() {
                Ok((block, cmd)) => {
                    tracing::debug!(seq = block.seq_no, cmd = ?cmd, "Attached to channel");
                }
                Err(e @ GeomIpcError::ProtocolMismatch { .. }) => {
                    tracing::warn!(error = %e, "Channel occupied by an incompatible peer");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            path = %channel.path.display(),
            created = channel.created,
            "Shared channel open"
        );

        Ok(channel)
    }

    /// Take the channel lock. Released when the guard drops.
    pub fn lock(&mut self) -> Result<ChannelGuard<'_>, GeomIpcError> {
        let lock = FileLock::acquire(&self.file)?;
        Ok(ChannelGuard {
            _lock: lock,
            mmap: &mut self.mmap,
            seen_valid: &mut self.seen_valid,
        })
    }

    /// Copy of the raw block, taken under the lock.
    pub fn snapshot(&mut self) -> Result<CommandBlock, GeomIpcError> {
        Ok(self.lock()?.read())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.mmap.len()
    }

    /// Whether this handle created the backing segment.
    pub fn created(&self) -> bool {
        self.created
    }
}

/// A segment that cannot be locked while attaching is as unusable as one
/// that cannot be opened.
fn lock_failed(path: &Path, errno: Errno) -> GeomIpcError {
    GeomIpcError::ChannelUnavailable {
        path: path.to_path_buf(),
        source: io::Error::from(errno),
    }
}

/// Scoped exclusive access to the block.
pub struct ChannelGuard<'a> {
    _lock: FileLock<'a>,
    mmap: &'a mut MmapMut,
    seen_valid: &'a mut bool,
}

impl ChannelGuard<'_> {
    /// Raw copy of the block, identity not checked.
    pub fn read(&self) -> CommandBlock {
        bytemuck::pod_read_unaligned(&self.mmap[..CommandBlock::SIZE])
    }

    pub fn write(&mut self, block: &CommandBlock) {
        self.mmap[..CommandBlock::SIZE].copy_from_slice(block.as_bytes());
    }

    /// Validated copy of the block.
    ///
    /// A block without the magic stamp is initialized to `IDLE` on first
    /// contact only. Once this handle has seen a valid block, a missing stamp
    /// means somebody else took over the segment and is reported as a
    /// mismatch, like a foreign version or command code.
    pub fn load(&mut self) -> Result<(CommandBlock, Command), GeomIpcError> {
        let block = self.read();
        match block.identify() {
            Identity::Valid(cmd) => {
                *self.seen_valid = true;
                Ok((block, cmd))
            }
            Identity::Uninitialized if !*self.seen_valid => {
                let fresh = CommandBlock::new();
                self.mmap.fill(0);
                self.write(&fresh);
                *self.seen_valid = true;
                tracing::info!("Initialized command block");
                Ok((fresh, Command::Idle))
            }
            Identity::Uninitialized | Identity::Incompatible => Err(block.mismatch()),
        }
    }
}
