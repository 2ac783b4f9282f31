//! Object model and storage traits for hoard.
//!
//! Everything hoard persists is an immutable object identified by the SHA-1
//! of its kind and content. This crate defines what an object looks like in
//! memory and the two seams the rest of the system writes and reads through.
//!
//! # Object Types
//!
//! - [`StoredObject`] -- kind tag plus raw payload
//! - [`Tree`] -- git-encoded listing mapping names to object references
//!
//! # Storage Seams
//!
//! - [`ObjectWriter`] -- deduplicating sink (the pack writer implements it)
//! - [`ObjectReader`] -- lookup by id (the pack set implements it)
//! - [`InMemoryObjectStore`] -- `HashMap`-based store for tests and embedding

pub mod error;
pub mod memory;
pub mod object;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryObjectStore;
pub use object::{EntryMode, StoredObject, Tree, TreeEntry};
pub use traits::{ObjectReader, ObjectWriter};
