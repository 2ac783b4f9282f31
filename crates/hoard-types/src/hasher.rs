use sha1::{Digest, Sha1};

use crate::kind::ObjectKind;
use crate::object::{Oid, OID_LEN};

/// Object hasher: SHA-1 over `"<kind> <len>\0"` followed by the payload.
///
/// Each hasher is bound to one [`ObjectKind`], so the kind tag is always part
/// of the hashed bytes.
pub struct ContentHasher {
    kind: ObjectKind,
}

impl ContentHasher {
    /// Hasher for blob objects.
    pub const BLOB: Self = Self {
        kind: ObjectKind::Blob,
    };
    /// Hasher for tree objects.
    pub const TREE: Self = Self {
        kind: ObjectKind::Tree,
    };
    /// Hasher for commit objects.
    pub const COMMIT: Self = Self {
        kind: ObjectKind::Commit,
    };

    pub const fn new(kind: ObjectKind) -> Self {
        Self { kind }
    }

    /// Hash a payload with its typed header.
    pub fn hash(&self, data: &[u8]) -> Oid {
        let mut hasher = Sha1::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(b" ");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(data);
        Oid::from_hash(hasher.finalize().into())
    }

    /// Verify that data produces the expected object ID.
    pub fn verify(&self, data: &[u8], expected: &Oid) -> bool {
        self.hash(data) == *expected
    }

    /// Raw SHA-1 without a header (for file checksums and names).
    pub fn raw_hash(data: &[u8]) -> [u8; OID_LEN] {
        Sha1::digest(data).into()
    }

    /// The kind this hasher tags payloads with.
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }
}
