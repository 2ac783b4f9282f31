//! Foundation types for hoard.
//!
//! Every other hoard crate depends on `hoard-types` for the way objects are
//! named. Objects are addressed by the SHA-1 of a typed header followed by
//! their payload, the same naming git uses, so packs and indexes written by
//! hoard stay readable by git tooling.
//!
//! # Key Types
//!
//! - [`Oid`] -- 160-bit content-addressed object identifier
//! - [`ObjectKind`] -- Blob, tree, or commit payload type
//! - [`ContentHasher`] -- Computes an [`Oid`] from a kind and payload

pub mod error;
pub mod hasher;
pub mod kind;
pub mod object;

pub use error::TypeError;
pub use hasher::ContentHasher;
pub use kind::ObjectKind;
pub use object::{Oid, OID_LEN};
