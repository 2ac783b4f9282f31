//! Bloom filter over the object ids of a set of pack indexes.
//!
//! ```text
//! BLOM | u32 version=2 | u16 bits | u16 k | u32 entries
//! [u8; 2^bits]   bit table
//! idx names, NUL-joined
//! ```
//!
//! Object ids are already uniformly distributed, so the `k` bit positions
//! are cut straight out of the id: five 4-byte words for `k = 5`, four
//! 5-byte words for `k = 4`. Of each word, the top `bits` bits pick a byte of
//! the table and the next three pick the bit within it.

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use hoard_types::Oid;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{IndexError, IndexResult, IoContext};
use crate::idx::PackIdx;
use crate::io::{
    be_u16, be_u32, persist, require_len, require_magic, split_names, temp_file_beside, MapMode,
    MappedFile,
};

pub const BLOOM_MAGIC: &[u8; 4] = b"BLOM";
pub const BLOOM_VERSION: u32 = 2;
/// Name of the filter inside a pack directory.
pub const BLOOM_FILE_NAME: &str = "hoard.bloom";
/// Default ceiling, in percent, on the estimated false-positive rate.
pub const MAX_PFALSE_POSITIVE: f64 = 1.0;

const HEADER_LEN: usize = 16;
/// Table bits budgeted per expected entry when sizing a new filter.
const MAX_BITS_EACH: u64 = 32;

/// Largest table exponent usable with `k` hash functions.
pub fn max_bloom_bits(k: u32) -> Option<u32> {
    match k {
        4 => Some(37),
        5 => Some(29),
        _ => None,
    }
}

/// Table exponent and hash count for a filter expected to hold `expected` ids.
///
/// Prefers `k = 5` while the table fits its smaller address space; a table
/// that outgrows the budget for its `k` is clamped, at the cost of a higher
/// false-positive rate.
pub fn bloom_geometry(expected: u64, k: Option<u32>) -> IndexResult<(u32, u32)> {
    let bytes = expected.max(1).saturating_mul(MAX_BITS_EACH) / 8;
    let bits = 63 - bytes.leading_zeros();
    let k = match k {
        Some(k) => k,
        None if bits <= 29 => 5,
        None => 4,
    };
    let max = max_bloom_bits(k).ok_or_else(|| {
        IndexError::InvalidArgument(format!("only k values of 4 and 5 are supported, got {k}"))
    })?;
    if bits > max {
        warn!(bits, max, k, "bloom: max bits exceeded, filter will be non-optimal");
        return Ok((max, k));
    }
    Ok((bits, k))
}

/// A bloom filter file, mapped read-only or read-write.
pub struct ShaBloom {
    map: MappedFile,
    dest: PathBuf,
    pending: Option<NamedTempFile>,
    bits: u32,
    k: u32,
    entries: u32,
    idx_names: Vec<String>,
    writable: bool,
    dirty: bool,
}

impl ShaBloom {
    /// Open for lookups.
    pub fn open(path: &Path) -> IndexResult<Self> {
        let map = MappedFile::open(path, MapMode::ReadOnly)?;
        Self::from_map(map, path, None)
    }

    /// Open in place to add about `expected` more entries.
    ///
    /// When that many insertions will probably dirty every page anyway, the
    /// table is mapped privately and written back in one piece by
    /// [`close`](Self::close) instead of trickling out as pages are touched.
    pub fn open_rw(path: &Path, expected: u64) -> IndexResult<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .at(path)?;
        let size = file.metadata().at(path)?.len();
        let map = MappedFile::from_file(file, path, write_mode(size, expected))?;
        Self::from_map(map, path, None)
    }

    /// Create an empty filter sized for `expected` entries. The file is
    /// built under a temporary name and only appears at `path` on
    /// [`close`](Self::close).
    pub fn create(path: &Path, expected: u64, k: Option<u32>) -> IndexResult<Self> {
        let (bits, k) = bloom_geometry(expected, k)?;
        debug!(bits, k, "bloom: using 2^bits bytes and k hash functions");
        let mut tmp = temp_file_beside(path)?;
        let tmp_path = tmp.path().to_path_buf();
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(BLOOM_MAGIC);
        header.extend_from_slice(&BLOOM_VERSION.to_be_bytes());
        header.extend_from_slice(&(bits as u16).to_be_bytes());
        header.extend_from_slice(&(k as u16).to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes());
        tmp.write_all(&header).at(&tmp_path)?;
        let size = (HEADER_LEN as u64) + (1u64 << bits);
        tmp.as_file().set_len(size).at(&tmp_path)?;

        let file = tmp.as_file().try_clone().at(&tmp_path)?;
        let map = MappedFile::from_file(file, &tmp_path, write_mode(size, expected))?;
        let mut bloom = Self::from_map(map, path, Some(tmp))?;
        bloom.dirty = true;
        Ok(bloom)
    }

    fn from_map(map: MappedFile, dest: &Path, pending: Option<NamedTempFile>) -> IndexResult<Self> {
        let path = map.path().to_path_buf();
        let buf = map.as_slice();
        require_magic(&path, buf, BLOOM_MAGIC)?;
        require_len(&path, buf, HEADER_LEN as u64)?;
        let version = be_u32(buf, 4);
        if version != BLOOM_VERSION {
            return Err(IndexError::UnsupportedVersion {
                path,
                found: version,
                supported: BLOOM_VERSION,
            });
        }
        let bits = u32::from(be_u16(buf, 8));
        let k = u32::from(be_u16(buf, 10));
        let entries = be_u32(buf, 12);
        match max_bloom_bits(k) {
            Some(max) if bits <= max => {}
            _ => {
                return Err(IndexError::corrupt(
                    &path,
                    format!("unsupported geometry: 2^{bits} bytes, k={k}"),
                ))
            }
        }
        let table_end = HEADER_LEN as u64 + (1u64 << bits);
        require_len(&path, buf, table_end)?;
        let idx_names = split_names(&buf[table_end as usize..]);
        let writable = map.mode() != MapMode::ReadOnly;
        Ok(Self {
            map,
            dest: dest.to_path_buf(),
            pending,
            bits,
            k,
            entries,
            idx_names,
            writable,
            dirty: false,
        })
    }

    /// Final location of the filter.
    pub fn path(&self) -> &Path {
        &self.dest
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    /// Number of entries added so far.
    pub fn len(&self) -> u64 {
        u64::from(self.entries)
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Basenames of the indexes summarized by this filter.
    pub fn idx_names(&self) -> &[String] {
        &self.idx_names
    }

    pub fn valid(&self) -> bool {
        self.bits != 0 && self.map.len() >= self.table_end()
    }

    fn table_end(&self) -> usize {
        HEADER_LEN + (1usize << self.bits)
    }

    /// `false` means definitely absent; `true` means probably present.
    pub fn exists(&self, oid: &Oid) -> bool {
        let table = &self.map.as_slice()[HEADER_LEN..];
        bit_positions(oid, self.bits, self.k).all(|(byte, mask)| table[byte] & mask != 0)
    }

    fn table_mut(&mut self) -> IndexResult<&mut [u8]> {
        let end = self.table_end();
        let path = self.dest.clone();
        match self.map.as_mut_slice() {
            Some(buf) if self.writable => Ok(&mut buf[HEADER_LEN..end]),
            _ => Err(IndexError::InvalidArgument(format!(
                "{}: bloom filter is open read-only",
                path.display()
            ))),
        }
    }

    pub fn add<'a>(&mut self, oids: impl IntoIterator<Item = &'a Oid>) -> IndexResult<()> {
        self.insert(oids.into_iter().copied())?;
        Ok(())
    }

    /// Add every id of `idx` and record its name.
    pub fn add_idx(&mut self, idx: &PackIdx) -> IndexResult<()> {
        let count = self.insert(idx.iter())?;
        self.idx_names.push(idx.name().to_string());
        debug!(idx = idx.name(), objects = count, "bloom: added index");
        Ok(())
    }

    /// Set the bits of each id as it arrives; returns how many were added.
    fn insert(&mut self, oids: impl Iterator<Item = Oid>) -> IndexResult<u32> {
        let (bits, k) = (self.bits, self.k);
        let table = self.table_mut()?;
        let mut count = 0u32;
        for oid in oids {
            for (byte, mask) in bit_positions(&oid, bits, k) {
                table[byte] |= mask;
            }
            count = count.wrapping_add(1);
        }
        self.entries = self.entries.wrapping_add(count);
        self.dirty = true;
        Ok(count)
    }

    /// Estimated false-positive rate, in percent, after `additional` more
    /// insertions.
    pub fn pfalse_positive(&self, additional: u64) -> f64 {
        let n = (self.len() + additional) as f64;
        let m = 8.0 * (1u64 << self.bits) as f64;
        let k = f64::from(self.k);
        100.0 * (1.0 - (-k * n / m).exp()).powf(k)
    }

    /// Zero the bit table while keeping the header and names: every lookup
    /// then misses, though the filter still claims to be valid.
    pub fn ruin(&mut self) -> IndexResult<()> {
        self.table_mut()?.fill(0);
        self.dirty = true;
        warn!(path = %self.dest.display(), "bloom: table zeroed");
        Ok(())
    }

    /// Write the entry count and names, flush the table, and publish a newly
    /// created filter. A read-only filter closes trivially.
    pub fn close(mut self) -> IndexResult<PathBuf> {
        if self.writable && self.dirty {
            let end = self.table_end() as u64;
            let entries = self.entries.to_be_bytes();
            if let Some(buf) = self.map.as_mut_slice() {
                buf[12..16].copy_from_slice(&entries);
            }
            self.map.flush()?;
            let names = self.idx_names.join("\0");
            let path = self.map.path().to_path_buf();
            let file = self.map.file_mut().ok_or_else(|| {
                IndexError::InvalidArgument(format!("{}: not open for writing", path.display()))
            })?;
            file.seek(SeekFrom::Start(end)).at(&path)?;
            file.write_all(names.as_bytes()).at(&path)?;
            file.sync_all().at(&path)?;
            debug!(path = %self.dest.display(), entries = self.entries, "bloom: closed");
        }
        if let Some(tmp) = self.pending.take() {
            persist(tmp, &self.dest)?;
        }
        self.dirty = false;
        Ok(self.dest.clone())
    }
}

/// `(byte within table, bit mask)` for each of the `k` hash functions.
fn bit_positions(oid: &Oid, bits: u32, k: u32) -> impl Iterator<Item = (usize, u8)> {
    let id = *oid.as_bytes();
    let mask = (1u64 << bits) - 1;
    let k = k as usize;
    (0..k).map(move |i| {
        let (raw, width) = if k == 5 {
            (u64::from(be_u32(&id, i * 4)), 32)
        } else {
            ((u64::from(be_u32(&id, i * 5)) << 8) | u64::from(id[i * 5 + 4]), 40)
        };
        let bit = (raw >> (width - 3 - bits)) & 7;
        let v = (raw >> (width - bits)) & mask;
        (v as usize, 1u8 << bit)
    })
}

fn write_mode(file_len: u64, expected: u64) -> MapMode {
    let pages = file_len / 4096 * 5;
    if expected > pages {
        MapMode::Private
    } else {
        MapMode::Shared
    }
}

impl Drop for ShaBloom {
    fn drop(&mut self) {
        if self.dirty {
            warn!(
                path = %self.dest.display(),
                "bloom filter dropped without close; its entry count is stale"
            );
        }
    }
}

impl std::fmt::Debug for ShaBloom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaBloom")
            .field("path", &self.dest)
            .field("bits", &self.bits)
            .field("k", &self.k)
            .field("entries", &self.entries)
            .field("idx_names", &self.idx_names.len())
            .finish()
    }
}
