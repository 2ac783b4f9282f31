//! Content-defined chunking for hoard.
//!
//! A byte stream is cut wherever a rolling checksum over the trailing 64
//! bytes matches a bit pattern, so an insertion or deletion only moves the
//! boundaries near it. Chunks become blobs; bits matched beyond the
//! threshold give each boundary a level, and levels shape the blobs into a
//! shallow tree so a huge file never becomes one huge listing.
//!
//! # Architecture
//!
//! - [`Rollsum`] -- the rolling checksum and [`find_split`]
//! - [`HashSplitter`] -- lazy iterator of [`Chunk`]s over one or more readers
//! - [`split_to_blobs`], [`split_to_shalist`], [`split_to_blob_or_tree`] --
//!   write chunks through an [`ObjectWriter`](hoard_store::ObjectWriter)
//! - [`join`] -- reassemble a stream from a blob or chunk tree
//!
//! Identical [`SplitConfig`] and identical bytes always produce identical
//! chunks and identical top-level ids.

pub mod config;
pub mod error;
pub mod join;
pub mod rollsum;
pub mod splitter;
pub mod tree;

#[cfg(test)]
mod testutil;

pub use config::SplitConfig;
pub use error::{SplitError, SplitResult};
pub use join::join;
pub use rollsum::{find_split, Rollsum, WINDOW_SIZE};
pub use splitter::{Chunk, HashSplitter, READ_BLOCK_SIZE};
pub use tree::{split_to_blob_or_tree, split_to_blobs, split_to_shalist, SplitBlobs, SplitEntry};
