//! Checks applied to payload paths read out of the block.
//!
//! Paths coming from the peer are untrusted: the file may already be gone,
//! may be a directory, or may not be readable by this process.

use crate::errors::GeomIpcError;
use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Ensure `path` names a regular file this process can open for reading.
pub fn verify_readable(path: &Path) -> Result<(), GeomIpcError> {
    let missing = |source: io::Error| GeomIpcError::PayloadMissing {
        path: path.to_path_buf(),
        source,
    };

    if path.as_os_str().is_empty() {
        return Err(missing(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty payload path",
        )));
    }

    let metadata = fs::metadata(path).map_err(missing)?;
    if !metadata.is_file() {
        return Err(missing(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }

    File::open(path).map_err(missing)?;
    Ok(())
}

/// Message the receiver reports when an input payload fails
/// [`verify_readable`].
pub fn describe_missing(path: &Path, err: &GeomIpcError) -> String {
    match err {
        GeomIpcError::PayloadMissing { source, .. } if source.kind() == io::ErrorKind::NotFound => {
            format!("file not found: {}", path.display())
        }
        GeomIpcError::PayloadMissing { source, .. } => {
            format!("cannot read {}: {}", path.display(), source)
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, tempdir};

    #[test]
    fn test_existing_file_is_readable() {
        let temp_file = NamedTempFile::new().unwrap();
        verify_readable(temp_file.path()).unwrap();
    }

    #[test]
    fn test_missing_file_is_payload_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.step");

        let err = verify_readable(&path).unwrap_err();
        match &err {
            GeomIpcError::PayloadMissing { path: p, source } => {
                assert_eq!(p, &path);
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("Expected PayloadMissing, got {other:?}"),
        }
        assert_eq!(
            describe_missing(&path, &err),
            format!("file not found: {}", path.display())
        );
    }

    #[test]
    fn test_directory_is_not_a_payload() {
        let dir = tempdir().unwrap();
        let err = verify_readable(dir.path()).unwrap_err();
        assert!(matches!(err, GeomIpcError::PayloadMissing { .. }));
        assert!(describe_missing(dir.path(), &err).starts_with("cannot read"));
    }

    #[test]
    fn test_empty_path_is_payload_missing() {
        assert!(matches!(
            verify_readable(Path::new("")),
            Err(GeomIpcError::PayloadMissing { .. })
        ));
    }
}
