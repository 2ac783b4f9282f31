use std::collections::HashMap;

use hoard_types::{ContentHasher, ObjectKind, Oid};
use tracing::trace;

use crate::error::StoreResult;
use crate::object::StoredObject;
use crate::traits::{ObjectReader, ObjectWriter};

/// In-memory, HashMap-based object store.
///
/// Intended for tests and embedding. Counts how many writes actually stored a
/// new object so callers can observe deduplication.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: HashMap<Oid, StoredObject>,
    stored: usize,
    deduplicated: usize,
}

impl InMemoryObjectStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Total payload bytes across all stored objects.
    pub fn total_bytes(&self) -> u64 {
        self.objects.values().map(StoredObject::size).sum()
    }

    /// Number of writes skipped because the object already existed.
    pub fn deduplicated(&self) -> usize {
        self.deduplicated
    }

    /// Return a sorted list of all object IDs in the store.
    pub fn all_ids(&self) -> Vec<Oid> {
        let mut ids: Vec<Oid> = self.objects.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn get(&self, id: &Oid) -> Option<&StoredObject> {
        self.objects.get(id)
    }
}

impl ObjectWriter for InMemoryObjectStore {
    fn write(&mut self, kind: ObjectKind, data: &[u8]) -> StoreResult<Oid> {
        let id = ContentHasher::new(kind).hash(data);
        if self.objects.contains_key(&id) {
            self.deduplicated += 1;
        } else {
            trace!(%id, kind = %kind, len = data.len(), "store object");
            self.objects
                .insert(id, StoredObject::new(kind, data.to_vec()));
            self.stored += 1;
        }
        Ok(id)
    }

    fn exists(&mut self, id: &Oid) -> StoreResult<bool> {
        Ok(self.objects.contains_key(id))
    }
}

impl ObjectReader for InMemoryObjectStore {
    fn read(&mut self, id: &Oid) -> StoreResult<Option<StoredObject>> {
        Ok(self.objects.get(id).cloned())
    }
}

impl std::fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryObjectStore")
            .field("object_count", &self.objects.len())
            .field("stored", &self.stored)
            .field("deduplicated", &self.deduplicated)
            .finish()
    }
}
