//! Error types for the index crate.

use std::path::{Path, PathBuf};

use hoard_types::Oid;

/// Broad class of an [`IndexError`], deciding how callers react to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad magic, version, or size. The file is rejected outright.
    Format,
    /// Tables or files disagree with each other. Recorded, and work continues
    /// over the remaining inputs.
    Consistency,
    /// The file system refused an operation. Propagated to the caller.
    Resource,
    /// The caller asked for something impossible.
    Usage,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("{}: bad magic: expected {expected:02x?}, found {found:02x?}", path.display())]
    InvalidMagic {
        path: PathBuf,
        expected: Vec<u8>,
        found: Vec<u8>,
    },

    #[error("{}: unsupported version {found} (supported: {supported})", path.display())]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("{}: file is {actual} bytes, expected at least {expected}", path.display())]
    Truncated {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("{}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("{}: index {idx} is missing", midx.display())]
    MissingIdx { midx: PathBuf, idx: String },

    #[error("{}: {reason}", path.display())]
    Inconsistent { path: PathBuf, reason: String },

    #[error("duplicate object {0} in pack index")]
    DuplicateOid(Oid),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    InvalidArgument(String),
}

impl IndexError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidMagic { .. }
            | Self::UnsupportedVersion { .. }
            | Self::Truncated { .. }
            | Self::Corrupt { .. } => ErrorClass::Format,
            Self::MissingIdx { .. } | Self::Inconsistent { .. } | Self::DuplicateOid(_) => {
                ErrorClass::Consistency
            }
            Self::Io { .. } => ErrorClass::Resource,
            Self::InvalidArgument(_) => ErrorClass::Usage,
        }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// `true` for a file written by a newer format revision than this build
    /// understands. Such files are left on disk.
    pub fn is_too_new(&self) -> bool {
        matches!(self, Self::UnsupportedVersion { found, supported, .. } if found > supported)
    }

    /// `true` for a file written by an older format revision.
    pub fn is_too_old(&self) -> bool {
        matches!(self, Self::UnsupportedVersion { found, supported, .. } if found < supported)
    }
}

/// Attach a path to an `io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> IndexResult<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> IndexResult<T> {
        self.map_err(|e| IndexError::io(path, e))
    }
}

/// Convenience alias for index results.
pub type IndexResult<T> = Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        let p = PathBuf::from("x.idx");
        assert_eq!(
            IndexError::Truncated {
                path: p.clone(),
                expected: 10,
                actual: 2
            }
            .class(),
            ErrorClass::Format
        );
        assert_eq!(
            IndexError::MissingIdx {
                midx: p.clone(),
                idx: "a.idx".into()
            }
            .class(),
            ErrorClass::Consistency
        );
        assert_eq!(
            IndexError::io(&p, std::io::Error::from(std::io::ErrorKind::NotFound)).class(),
            ErrorClass::Resource
        );
    }

    #[test]
    fn version_direction() {
        let newer = IndexError::UnsupportedVersion {
            path: "m.midx".into(),
            found: 5,
            supported: 4,
        };
        assert!(newer.is_too_new());
        assert!(!newer.is_too_old());
        let older = IndexError::UnsupportedVersion {
            path: "m.midx".into(),
            found: 2,
            supported: 4,
        };
        assert!(older.is_too_old());
    }
}
