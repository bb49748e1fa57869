use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// Errors raised while reading or writing state files
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("state directory unusable: {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed state file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Make sure `dir` exists and is a directory.
pub fn ensure_dir(dir: &Path) -> Result<(), PersistError> {
    if dir.exists() {
        if !dir.is_dir() {
            return Err(PersistError::Directory {
                path: dir.to_path_buf(),
                source: io::Error::new(io::ErrorKind::Other, "path is not a directory"),
            });
        }
        return Ok(());
    }

    fs::create_dir_all(dir).map_err(|source| PersistError::Directory {
        path: dir.to_path_buf(),
        source,
    })
}

/// Write `content` to `path` through a temp file in the same directory and an
/// atomic rename. Readers see either the old file or the new one, never a
/// partial write.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), PersistError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    ensure_dir(&dir)?;

    let io_err = |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
    tmp.write_all(content).map_err(io_err)?;
    tmp.flush().map_err(io_err)?;
    tmp.as_file_mut().sync_all().map_err(io_err)?;

    // persist() is a rename, which replaces the target in one step
    tmp.persist(path).map_err(|e| io_err(e.error))?;

    debug!("Wrote {} bytes to {}", content.len(), path.display());
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistError> {
    let content = serde_json::to_vec_pretty(value).map_err(|source| PersistError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &content)
}

/// Read and parse a JSON file. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let content = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|source| PersistError::Json {
            path: path.to_path_buf(),
            source,
        })
}
