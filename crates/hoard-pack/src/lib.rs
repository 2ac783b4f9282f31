//! Pack files for hoard.
//!
//! A pack is the git v2 container: `PACK`, version, object count, then each
//! object as a size/type header and a zlib stream, closed by the SHA-1 of
//! everything before it. Every pack has an idx beside it.
//!
//! - [`PackWriter`] -- deduplicating [`ObjectWriter`](hoard_store::ObjectWriter)
//!   that seals packs and keeps the directory's indexes in shape
//! - [`PackReader`] -- one pack, read by object id
//! - [`PackSet`] -- every pack in a directory, behind
//!   [`PackIdxList`](hoard_index::PackIdxList) lookups

pub mod config;
pub mod entry;
pub mod error;
pub mod reader;
pub mod set;
pub mod writer;

pub use config::PackConfig;
pub use entry::{decode_header, encode_header, PACK_MAGIC, PACK_VERSION};
pub use error::{PackError, PackResult};
pub use reader::PackReader;
pub use set::PackSet;
pub use writer::PackWriter;
