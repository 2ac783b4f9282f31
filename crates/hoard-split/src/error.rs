use hoard_store::StoreError;
use hoard_types::{ObjectKind, Oid};

/// Errors from splitting and joining.
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("split bits must be between {min} and {max}, got {bits}")]
    InvalidBits { bits: u32, min: u32, max: u32 },

    #[error("fanout must be a power of two of at least 2, got {0}")]
    InvalidFanout(u32),

    #[error("max entries per tree must be at least 2, got {0}")]
    InvalidTreeSize(usize),

    #[error("cannot join {id}: unexpected {kind} object")]
    UnexpectedKind { id: Oid, kind: ObjectKind },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result alias for split operations.
pub type SplitResult<T> = Result<T, SplitError>;
