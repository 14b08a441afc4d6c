//! Shared persistence helpers for analysis artifacts.
//!
//! Artifacts are JSON documents consumed/produced by an external storage
//! collaborator; writes go through a tempfile in the target directory and a
//! rename so a crashed write never leaves a truncated artifact behind.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors while persisting or loading calibration/corpus artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Failed to read artifact {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write artifact {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to encode artifact: {0}")]
    Encode(serde_json::Error),
    #[error("Failed to decode artifact {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Artifact {path} is inconsistent: {detail}")]
    Inconsistent { path: PathBuf, detail: String },
}

pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<(), ArtifactError> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let dir = dir.unwrap_or_else(|| Path::new("."));
    let map_io = |source: std::io::Error| ArtifactError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut temp = tempfile::Builder::new()
        .prefix(".artifact")
        .tempfile_in(dir)
        .map_err(map_io)?;
    std::io::Write::write_all(temp.as_file_mut(), data).map_err(map_io)?;
    temp.persist(path).map_err(|err| ArtifactError::Write {
        path: path.to_path_buf(),
        source: err.error,
    })?;
    Ok(())
}

pub(crate) fn read_bytes(path: &Path) -> Result<Vec<u8>, ArtifactError> {
    std::fs::read(path).map_err(|source| ArtifactError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        // no stray tempfiles left behind
        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 1);
    }

    #[test]
    fn read_missing_file_reports_path() {
        let dir = tempdir().unwrap();
        let err = read_bytes(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ArtifactError::Read { .. }));
    }
}
