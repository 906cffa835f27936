use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeomIpcError {
    /// The shared segment could not be created or attached. Disables the
    /// hand-off feature for this process; never fatal on its own.
    #[error("Shared channel unavailable at {path}: {source}")]
    ChannelUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Magic, version or command code not recognized. Treated as
    /// "channel not ready" by the poll loops.
    #[error("Protocol mismatch (magic {magic:#010x}, version {version}, cmd {cmd})")]
    ProtocolMismatch { magic: u32, version: u32, cmd: u32 },

    #[error("Payload missing at {path}: {source}")]
    PayloadMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The peer set `ERROR`. `message` is exactly what the peer wrote.
    #[error("Geometry processor failed job #{seq}: {message}")]
    PeerError { seq: u32, message: String },

    #[error("Job #{seq} got no answer within {elapsed:?}")]
    StaleJob { seq: u32, elapsed: Duration },

    #[error("{field} is {len} bytes, at most {max} fit")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{field} contains a NUL byte")]
    InteriorNul { field: &'static str },

    #[error("Job #{seq} is still in flight")]
    JobInFlight { seq: u32 },

    #[error("Sequence numbers exhausted")]
    SequenceExhausted,

    #[error("Channel lock failed: {0}")]
    Lock(#[from] nix::errno::Errno),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl GeomIpcError {
    /// Conditions a poll loop should simply retry on its next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, GeomIpcError::ProtocolMismatch { .. } | GeomIpcError::Lock(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formatting() {
        let err = GeomIpcError::ProtocolMismatch {
            magic: 0xDEAD_BEEF,
            version: 1,
            cmd: 0,
        };
        assert_eq!(
            err.to_string(),
            "Protocol mismatch (magic 0xdeadbeef, version 1, cmd 0)"
        );

        let err = GeomIpcError::FieldTooLong {
            field: "geomFilePath",
            len: 600,
            max: 511,
        };
        assert_eq!(err.to_string(), "geomFilePath is 600 bytes, at most 511 fit");

        let err = GeomIpcError::JobInFlight { seq: 4 };
        assert_eq!(err.to_string(), "Job #4 is still in flight");
    }

    #[test]
    fn test_peer_error_keeps_message_verbatim() {
        let err = GeomIpcError::PeerError {
            seq: 7,
            message: "file not found: /tmp/x.step".to_string(),
        };
        match &err {
            GeomIpcError::PeerError { message, .. } => {
                assert_eq!(message, "file not found: /tmp/x.step")
            }
            _ => unreachable!(),
        }
        assert!(err.to_string().ends_with("file not found: /tmp/x.step"));
    }

    #[test]
    fn test_error_conversion_from_io_error() {
        fn returns_io_error() -> Result<(), io::Error> {
            Err(io::Error::other("test error"))
        }

        fn uses_question_mark() -> Result<(), GeomIpcError> {
            returns_io_error()?;
            Ok(())
        }

        match uses_question_mark().unwrap_err() {
            GeomIpcError::IoError(e) => assert_eq!(e.to_string(), "test error"),
            other => panic!("Expected IoError variant, got {other:?}"),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(
            GeomIpcError::ProtocolMismatch {
                magic: 0,
                version: 0,
                cmd: 0
            }
            .is_transient()
        );
        assert!(GeomIpcError::Lock(nix::errno::Errno::EINTR).is_transient());
        assert!(!GeomIpcError::SequenceExhausted.is_transient());
    }
}
