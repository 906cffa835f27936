//! Binary layout of the command block exchanged through the channel.
//!
//! LAYOUT:
//!
//! | offset | size | field            |
//! |--------|------|------------------|
//! | 0      | 4    | magic            |
//! | 4      | 4    | version          |
//! | 8      | 4    | cmd              |
//! | 12     | 4    | seq_no           |
//! | 16     | 512  | geom_file_path   |
//! | 528    | 512  | result_file_path |
//! | 1040   | 256  | error_msg        |
//! | 1296   | 4    | claim_pid        |
//! | 1300   | 4    | claim_time       |
//! | 1304   | 248  | reserved         |
//!
//! `claim_pid` and `claim_time` carve the first bytes out of the reserved
//! tail: the receiver stamps its process id and the claim's UNIX time (in
//! seconds) when it moves a job to `PROCESSING`. Zero means unclaimed, which
//! is also what peers that never stamp leave there.
//!
//! Integers use native byte order; both peers run on the same host. String
//! fields are NUL-terminated, so each holds at most `capacity - 1` bytes.
//!
//! The block is a plain `Pod` value: callers copy it out of the mapping under
//! the channel lock, edit the copy, and copy it back before releasing.

use crate::errors::GeomIpcError;
use crate::paths::CHANNEL_SIZE;
use bytemuck::{Pod, Zeroable};
use serde::Serialize;
use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const MAGIC: u32 = 0xCAD0_B000;
pub const VERSION: u32 = 1;

pub const PATH_CAPACITY: usize = 512;
pub const ERROR_CAPACITY: usize = 256;
pub const RESERVED_SIZE: usize = 248;

const _: () = assert!(CommandBlock::SIZE <= CHANNEL_SIZE);

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Idle = 0,
    SendRequested = 1,
    Processing = 2,
    ResultReady = 3,
    Error = 4,
}

impl Command {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Command::Idle),
            1 => Some(Command::SendRequested),
            2 => Some(Command::Processing),
            3 => Some(Command::ResultReady),
            4 => Some(Command::Error),
            _ => None,
        }
    }

    /// States only the sender may leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, Command::ResultReady | Command::Error)
    }
}

/// Who moved a job to `PROCESSING`, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub pid: u32,
    pub at: SystemTime,
}

/// Outcome of checking a block's identity fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Valid(Command),
    /// Magic not stamped. Safe to initialize on first contact only.
    Uninitialized,
    /// Right magic, but version or command code unknown to this build.
    Incompatible,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct CommandBlock {
    pub magic: u32,
    pub version: u32,
    pub cmd: u32,
    pub seq_no: u32,
    pub geom_file_path: [u8; PATH_CAPACITY],
    pub result_file_path: [u8; PATH_CAPACITY],
    pub error_msg: [u8; ERROR_CAPACITY],
    pub claim_pid: u32,
    pub claim_time: u32,
    pub reserved: [u8; RESERVED_SIZE],
}

impl CommandBlock {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// A freshly stamped, idle block.
    pub fn new() -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            cmd: Command::Idle as u32,
            ..Zeroable::zeroed()
        }
    }

    /// Decode a block from the start of `bytes` (unaligned is fine).
    ///
    /// Returns `None` if `bytes` is shorter than [`Self::SIZE`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw = bytes.get(..Self::SIZE)?;
        Some(bytemuck::pod_read_unaligned(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn identify(&self) -> Identity {
        if self.magic != MAGIC {
            return Identity::Uninitialized;
        }
        if self.version != VERSION {
            return Identity::Incompatible;
        }
        match Command::from_u32(self.cmd) {
            Some(cmd) => Identity::Valid(cmd),
            None => Identity::Incompatible,
        }
    }

    pub fn mismatch(&self) -> GeomIpcError {
        GeomIpcError::ProtocolMismatch {
            magic: self.magic,
            version: self.version,
            cmd: self.cmd,
        }
    }

    /// Decoded command, only if the identity fields check out.
    pub fn command(&self) -> Option<Command> {
        match self.identify() {
            Identity::Valid(cmd) => Some(cmd),
            _ => None,
        }
    }

    pub fn set_command(&mut self, cmd: Command) {
        self.cmd = cmd as u32;
    }

    pub fn geom_file_path(&self) -> PathBuf {
        path_from_field(&self.geom_file_path)
    }

    /// Rejects paths that do not fit; the block is left untouched then.
    pub fn set_geom_file_path(&mut self, path: &Path) -> Result<(), GeomIpcError> {
        write_field(
            &mut self.geom_file_path,
            "geomFilePath",
            path.as_os_str().as_bytes(),
        )
    }

    pub fn result_file_path(&self) -> PathBuf {
        path_from_field(&self.result_file_path)
    }

    pub fn set_result_file_path(&mut self, path: &Path) -> Result<(), GeomIpcError> {
        write_field(
            &mut self.result_file_path,
            "resultFilePath",
            path.as_os_str().as_bytes(),
        )
    }

    pub fn error_msg(&self) -> String {
        String::from_utf8_lossy(field_bytes(&self.error_msg)).into_owned()
    }

    /// Store `message`, cut at the last character boundary that fits.
    ///
    /// Returns `true` if the message had to be truncated.
    pub fn set_error_msg(&mut self, message: &str) -> bool {
        let mut end = message.len().min(ERROR_CAPACITY - 1);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        let kept = field_bytes(&message.as_bytes()[..end]);

        self.error_msg.fill(0);
        self.error_msg[..kept.len()].copy_from_slice(kept);
        kept.len() < message.len()
    }

    /// Record that process `pid` took the job at `at`.
    pub fn stamp_claim(&mut self, pid: u32, at: SystemTime) {
        let secs = at.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        self.claim_pid = pid;
        self.claim_time = u32::try_from(secs).unwrap_or(u32::MAX);
    }

    pub fn claim(&self) -> Option<Claim> {
        if self.claim_pid == 0 {
            return None;
        }
        Some(Claim {
            pid: self.claim_pid,
            at: UNIX_EPOCH + Duration::from_secs(u64::from(self.claim_time)),
        })
    }

    pub fn clear_claim(&mut self) {
        self.claim_pid = 0;
        self.claim_time = 0;
    }

    /// Forget the previous job's outcome.
    pub fn clear_outcome(&mut self) {
        self.result_file_path.fill(0);
        self.error_msg.fill(0);
    }
}

impl Default for CommandBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBlock")
            .field("magic", &format_args!("{:#010x}", self.magic))
            .field("version", &self.version)
            .field("cmd", &Command::from_u32(self.cmd).ok_or(self.cmd))
            .field("seq_no", &self.seq_no)
            .field("geom_file_path", &self.geom_file_path())
            .field("result_file_path", &self.result_file_path())
            .field("error_msg", &self.error_msg())
            .field("claim", &self.claim())
            .finish()
    }
}

/// Bytes up to (excluding) the first NUL.
fn field_bytes(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

fn path_from_field(field: &[u8]) -> PathBuf {
    PathBuf::from(OsStr::from_bytes(field_bytes(field)))
}

/// Check that `path` would be accepted by a path field of the block.
pub fn check_path_fits(field: &'static str, path: &Path) -> Result<(), GeomIpcError> {
    check_bounded(field, path.as_os_str().as_bytes(), PATH_CAPACITY)
}

fn check_bounded(name: &'static str, value: &[u8], capacity: usize) -> Result<(), GeomIpcError> {
    let max = capacity - 1;
    if value.len() > max {
        return Err(GeomIpcError::FieldTooLong {
            field: name,
            len: value.len(),
            max,
        });
    }
    if value.contains(&0) {
        return Err(GeomIpcError::InteriorNul { field: name });
    }
    Ok(())
}

fn write_field(field: &mut [u8], name: &'static str, value: &[u8]) -> Result<(), GeomIpcError> {
    check_bounded(name, value, field.len())?;
    field.fill(0);
    field[..value.len()].copy_from_slice(value);
    Ok(())
}
