//! Object existence indexes for hoard.
//!
//! Answers "is this object already stored, and in which pack?" across an
//! unbounded number of packs, touching as few pages as possible.
//!
//! # Architecture
//!
//! - [`PackIdx`] -- per-pack sorted id table with offsets and CRCs
//! - [`ShaBloom`] -- bloom filter over many idx files; a miss is final
//! - [`PackMidx`] -- one merged id table covering many idx files
//! - [`IndexSource`] -- either of the above, opened by magic
//! - [`PackIdxList`] -- the live view of a pack directory plus objects
//!   added this session
//! - [`maintenance`] -- bloom and midx passes, and consistency checks
//!
//! Every file is memory-mapped for reading and written through a temporary
//! file renamed into place, so readers never observe a partial file.

pub mod bloom;
pub mod config;
pub mod error;
pub mod idx;
pub mod io;
pub mod list;
pub mod maintenance;
pub mod merge;
pub mod midx;
pub mod source;

#[cfg(test)]
mod testutil;

pub use bloom::{ShaBloom, BLOOM_FILE_NAME, MAX_PFALSE_POSITIVE};
pub use config::MaintenanceConfig;
pub use error::{ErrorClass, IndexError, IndexResult};
pub use idx::{IdxEntry, IdxWriter, Lookup, PackIdx};
pub use list::{Location, PackIdxList, SearchStats};
pub use maintenance::{
    auto_maintain, check_bloom, check_midx, do_midx, midx_dir, ruin_bloom, run_bloom,
    BloomOutcome, BloomRequest, MidxRequest, Report,
};
pub use merge::{merge_into, midx_file_name, MergeIter, MidxSummary};
pub use midx::PackMidx;
pub use source::{list_index_files, IndexSource};
