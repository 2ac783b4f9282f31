use std::path::{Path, PathBuf};

use hoard_index::IndexError;
use hoard_store::StoreError;
use hoard_types::Oid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("{}: invalid pack magic {found:02x?}", path.display())]
    InvalidMagic { path: PathBuf, found: Vec<u8> },

    #[error("{}: unsupported pack version {version}", path.display())]
    UnsupportedVersion { path: PathBuf, version: u32 },

    #[error("{}: pack checksum mismatch", path.display())]
    ChecksumMismatch { path: PathBuf },

    #[error("corrupt pack entry at offset {offset}: {reason}")]
    CorruptEntry { offset: u64, reason: String },

    #[error("CRC32 mismatch for object {id} at offset {offset}")]
    CrcMismatch { id: Oid, offset: u64 },

    #[error("object {expected} decoded to {computed}")]
    HashMismatch { expected: Oid, computed: Oid },

    #[error("invalid pack configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PackError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptEntry {
            offset,
            reason: reason.into(),
        }
    }
}

impl From<PackError> for StoreError {
    fn from(err: PackError) -> Self {
        match err {
            PackError::HashMismatch { expected, computed } => {
                StoreError::HashMismatch { expected, computed }
            }
            other => StoreError::backend(other),
        }
    }
}

/// Attach a path to an `io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> PackResult<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> PackResult<T> {
        self.map_err(|e| PackError::io(path, e))
    }
}

pub type PackResult<T> = Result<T, PackError>;
