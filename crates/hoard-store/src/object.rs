use hoard_types::{ContentHasher, ObjectKind, Oid, OID_LEN};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// A stored object: kind tag + raw payload.
///
/// `StoredObject` is the unit of storage. The store never interprets the
/// payload of a blob; trees are decoded with [`Tree::decode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    /// The type of this object.
    pub kind: ObjectKind,
    /// The payload bytes.
    pub data: Vec<u8>,
}

impl StoredObject {
    /// Create a new stored object from kind and data.
    pub fn new(kind: ObjectKind, data: Vec<u8>) -> Self {
        Self { kind, data }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Compute the content-addressed ID for this object.
    pub fn compute_id(&self) -> Oid {
        ContentHasher::new(self.kind).hash(&self.data)
    }

    /// Fail with [`StoreError::HashMismatch`] unless the payload hashes to `expected`.
    pub fn verify(&self, expected: &Oid) -> StoreResult<()> {
        let computed = self.compute_id();
        if computed != *expected {
            return Err(StoreError::HashMismatch {
                expected: *expected,
                computed,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// File mode for a tree entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryMode {
    /// Normal file (0o100644).
    Regular,
    /// Executable file (0o100755).
    Executable,
    /// Symbolic link (0o120000).
    Symlink,
    /// Subtree / directory (0o40000).
    Directory,
}

impl EntryMode {
    /// Octal mode value.
    pub fn mode_bits(&self) -> u32 {
        match self {
            Self::Regular => 0o100644,
            Self::Executable => 0o100755,
            Self::Symlink => 0o120000,
            Self::Directory => 0o040000,
        }
    }

    /// Parse from an octal mode value.
    pub fn from_mode_bits(bits: u32) -> Option<Self> {
        match bits {
            0o100644 => Some(Self::Regular),
            0o100755 => Some(Self::Executable),
            0o120000 => Some(Self::Symlink),
            0o040000 => Some(Self::Directory),
            _ => None,
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, Self::Directory)
    }
}

/// Git writes modes without leading zeros (`40000`, `100644`).
impl std::fmt::Display for EntryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:o}", self.mode_bits())
    }
}

/// A single entry in a tree object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub mode: EntryMode,
    pub name: String,
    /// Content-addressed ID of the referenced object.
    pub id: Oid,
}

impl TreeEntry {
    /// Create a new tree entry.
    pub fn new(mode: EntryMode, name: impl Into<String>, id: Oid) -> Self {
        Self {
            mode,
            name: name.into(),
            id,
        }
    }

    /// Git orders directories as if their name ended in `/`.
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.as_bytes().to_vec();
        if self.mode.is_tree() {
            key.push(b'/');
        }
        key
    }
}

/// Listing object in git's binary tree encoding.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    /// Entries in git order.
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    /// Create a new tree with the given entries, sorted in git order.
    pub fn new(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by_cached_key(TreeEntry::sort_key);
        Self { entries }
    }

    /// Create an empty tree.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Encode as `<mode> <name>\0<20-byte id>` records.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * (OID_LEN + 16));
        for entry in &self.entries {
            out.extend_from_slice(entry.mode.to_string().as_bytes());
            out.push(b' ');
            out.extend_from_slice(entry.name.as_bytes());
            out.push(0);
            out.extend_from_slice(entry.id.as_bytes());
        }
        out
    }

    /// Decode a tree payload. `id` is used only for error reporting.
    pub fn decode(id: &Oid, data: &[u8]) -> StoreResult<Self> {
        let corrupt = |reason: String| StoreError::CorruptObject { id: *id, reason };
        let mut entries = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let space = rest
                .iter()
                .position(|&b| b == b' ')
                .ok_or_else(|| corrupt("missing mode separator".into()))?;
            let mode_str = std::str::from_utf8(&rest[..space])
                .map_err(|_| corrupt("mode is not ascii".into()))?;
            let bits = u32::from_str_radix(mode_str, 8)
                .map_err(|_| corrupt(format!("bad mode {mode_str:?}")))?;
            let mode = EntryMode::from_mode_bits(bits)
                .ok_or_else(|| corrupt(format!("unknown mode {mode_str}")))?;
            rest = &rest[space + 1..];

            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| corrupt("missing name terminator".into()))?;
            let name = String::from_utf8(rest[..nul].to_vec())
                .map_err(|_| corrupt("entry name is not utf-8".into()))?;
            rest = &rest[nul + 1..];

            if rest.len() < OID_LEN {
                return Err(corrupt(format!("truncated id for entry {name:?}")));
            }
            let entry_id = Oid::from_slice(&rest[..OID_LEN])
                .map_err(|e| corrupt(e.to_string()))?;
            rest = &rest[OID_LEN..];
            entries.push(TreeEntry::new(mode, name, entry_id));
        }
        Ok(Self { entries })
    }

    /// Convert into a `StoredObject` for storage.
    pub fn to_stored_object(&self) -> StoredObject {
        StoredObject::new(ObjectKind::Tree, self.encode())
    }

    /// Decode from a `StoredObject`.
    pub fn from_stored_object(id: &Oid, obj: &StoredObject) -> StoreResult<Self> {
        if obj.kind != ObjectKind::Tree {
            return Err(StoreError::CorruptObject {
                id: *id,
                reason: format!("expected tree, got {}", obj.kind),
            });
        }
        Self::decode(id, &obj.data)
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the tree has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
