use hoard_types::{ObjectKind, Oid};

use crate::error::StoreResult;
use crate::object::StoredObject;

/// Content-addressed object sink.
///
/// Implementations must be idempotent: writing an object that already exists
/// returns its id without storing a second copy. Methods take `&mut self`
/// because lookups reorder internal caches.
pub trait ObjectWriter {
    /// Store a payload of the given kind and return its id.
    fn write(&mut self, kind: ObjectKind, data: &[u8]) -> StoreResult<Oid>;

    /// Check whether an object with this id is already stored.
    fn exists(&mut self, id: &Oid) -> StoreResult<bool>;
}

/// Content-addressed object source.
pub trait ObjectReader {
    /// Read an object by id.
    ///
    /// Returns `Ok(None)` if the object does not exist.
    /// Returns `Err` on I/O failure or data corruption.
    fn read(&mut self, id: &Oid) -> StoreResult<Option<StoredObject>>;

    /// Read an object that must exist.
    fn read_required(&mut self, id: &Oid) -> StoreResult<StoredObject> {
        self.read(id)?.ok_or(crate::error::StoreError::NotFound(*id))
    }
}
