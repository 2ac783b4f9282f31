//! Pack index, version 2.
//!
//! ```text
//! \xfftOc | u32 version=2
//! u32[256]     cumulative fan-out by leading byte
//! [u8; 20][n]  object ids, ascending
//! u32[n]       CRC32 of each packed entry
//! u32[n]       pack offsets; MSB set means "index into the 64-bit table"
//! u64[m]       offsets that do not fit in 31 bits
//! [u8; 20]     checksum of the pack
//! [u8; 20]     SHA-1 of everything above
//! ```
//!
//! All integers are big-endian.

use std::io::Write;
use std::path::{Path, PathBuf};

use hoard_types::{Oid, OID_LEN};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::{IndexError, IndexResult, IoContext};
use crate::io::{
    be_u32, be_u64, require_len, require_magic, AtomicFile, HashingWriter, MapMode, MappedFile,
    OidTable,
};

pub const IDX_MAGIC: &[u8; 4] = b"\xfftOc";
pub const IDX_VERSION: u32 = 2;

const FANOUT_OFS: usize = 8;
const SHA_OFS: usize = FANOUT_OFS + 256 * 4;
const WIDE_FLAG: u32 = 0x8000_0000;
const MAX_NARROW: u64 = 0x7fff_ffff;

/// Result of one lookup: the table position if found, and how many steps
/// the search took (the fan-out lookup counts as one).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lookup {
    pub found: Option<usize>,
    pub steps: u32,
}

/// A memory-mapped, read-only pack index.
pub struct PackIdx {
    map: MappedFile,
    name: String,
    nsha: usize,
    crc_ofs: usize,
    ofs_ofs: usize,
    ofs64_ofs: usize,
    ofs64_count: usize,
}

impl PackIdx {
    /// Open and validate an index. Any mismatch of magic, version, fan-out,
    /// size, or row order rejects the whole file.
    pub fn open(path: &Path) -> IndexResult<Self> {
        let map = MappedFile::open(path, MapMode::ReadOnly)?;
        let buf = map.as_slice();
        require_magic(path, buf, IDX_MAGIC)?;
        require_len(path, buf, SHA_OFS as u64)?;
        let version = be_u32(buf, 4);
        if version != IDX_VERSION {
            return Err(IndexError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: version,
                supported: IDX_VERSION,
            });
        }

        let mut prev = 0;
        for bucket in 0..256 {
            let count = be_u32(buf, FANOUT_OFS + bucket * 4);
            if count < prev {
                return Err(IndexError::Inconsistent {
                    path: path.to_path_buf(),
                    reason: format!("fan-out decreases at bucket {bucket}"),
                });
            }
            prev = count;
        }
        let nsha = prev as usize;
        let crc_ofs = SHA_OFS + nsha * OID_LEN;
        let ofs_ofs = crc_ofs + nsha * 4;
        let ofs64_ofs = ofs_ofs + nsha * 4;
        let trailer = 2 * OID_LEN;
        require_len(path, buf, (ofs64_ofs + trailer) as u64)?;
        let wide_bytes = buf.len() - ofs64_ofs - trailer;
        if wide_bytes % 8 != 0 {
            return Err(IndexError::corrupt(
                path,
                format!("64-bit offset table is {wide_bytes} bytes"),
            ));
        }

        let name = basename(path);
        let idx = Self {
            map,
            name,
            nsha,
            crc_ofs,
            ofs_ofs,
            ofs64_ofs,
            ofs64_count: wide_bytes / 8,
        };
        idx.check_rows()?;
        debug!(idx = %idx.name, objects = nsha, "opened pack index");
        Ok(idx)
    }

    /// Rows must be strictly ascending and each must sit inside the fan-out
    /// bucket of its leading byte.
    fn check_rows(&self) -> IndexResult<()> {
        let table = self.table();
        for i in 0..table.len() {
            let row = table.bytes(i);
            if i > 0 && row <= table.bytes(i - 1) {
                return Err(IndexError::Inconsistent {
                    path: self.path().to_path_buf(),
                    reason: format!("oid ordering violated at row {i}"),
                });
            }
            let b = usize::from(row[0]);
            let start = if b == 0 { 0 } else { self.fanout(b - 1) };
            if i < start || i >= self.fanout(b) {
                return Err(IndexError::Inconsistent {
                    path: self.path().to_path_buf(),
                    reason: format!("row {i} lies outside fan-out bucket {b:02x}"),
                });
            }
        }
        Ok(())
    }

    /// File name without directory.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        self.map.path()
    }

    pub fn len(&self) -> usize {
        self.nsha
    }

    pub fn is_empty(&self) -> bool {
        self.nsha == 0
    }

    fn buf(&self) -> &[u8] {
        self.map.as_slice()
    }

    fn fanout(&self, bucket: usize) -> usize {
        be_u32(self.buf(), FANOUT_OFS + bucket * 4) as usize
    }

    pub fn table(&self) -> OidTable<'_> {
        OidTable::new(&self.buf()[SHA_OFS..self.crc_ofs])
    }

    /// Fan-out bucket select, then binary search inside the bucket.
    pub fn lookup(&self, oid: &Oid) -> Lookup {
        let b = usize::from(oid.first_byte());
        let mut start = if b == 0 { 0 } else { self.fanout(b - 1) };
        let mut end = self.fanout(b);
        let want = oid.as_bytes().as_slice();
        let table = self.table();
        let mut steps = 1;
        while start < end {
            steps += 1;
            let mid = start + (end - start) / 2;
            match table.bytes(mid).cmp(want) {
                std::cmp::Ordering::Less => start = mid + 1,
                std::cmp::Ordering::Greater => end = mid,
                std::cmp::Ordering::Equal => {
                    return Lookup {
                        found: Some(mid),
                        steps,
                    }
                }
            }
        }
        Lookup { found: None, steps }
    }

    pub fn exists(&self, oid: &Oid) -> bool {
        self.lookup(oid).found.is_some()
    }

    /// Pack offset of the object at table position `pos`.
    pub fn offset_at(&self, pos: usize) -> IndexResult<u64> {
        let raw = be_u32(self.buf(), self.ofs_ofs + pos * 4);
        if raw & WIDE_FLAG == 0 {
            return Ok(u64::from(raw));
        }
        let wide = (raw & !WIDE_FLAG) as usize;
        if wide >= self.ofs64_count {
            return Err(IndexError::corrupt(
                self.path(),
                format!("64-bit offset index {wide} out of range"),
            ));
        }
        Ok(be_u64(self.buf(), self.ofs64_ofs + wide * 8))
    }

    /// Offset of `oid` inside the pack, or `None` when it is not indexed here.
    pub fn find_offset(&self, oid: &Oid) -> IndexResult<Option<u64>> {
        self.lookup(oid)
            .found
            .map(|pos| self.offset_at(pos))
            .transpose()
    }

    pub fn crc_at(&self, pos: usize) -> u32 {
        be_u32(self.buf(), self.crc_ofs + pos * 4)
    }

    pub fn crc(&self, oid: &Oid) -> Option<u32> {
        self.lookup(oid).found.map(|pos| self.crc_at(pos))
    }

    /// Object ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Oid> + '_ {
        self.table().iter()
    }

    /// Checksum of the pack this index describes.
    pub fn pack_checksum(&self) -> [u8; OID_LEN] {
        let buf = self.buf();
        let start = buf.len() - 2 * OID_LEN;
        let mut sum = [0u8; OID_LEN];
        sum.copy_from_slice(&buf[start..start + OID_LEN]);
        sum
    }

    /// Recompute the trailing checksum over the index itself.
    pub fn verify_checksum(&self) -> IndexResult<()> {
        let buf = self.buf();
        let body = buf.len() - OID_LEN;
        let computed = Sha1::digest(&buf[..body]);
        if computed.as_slice() != &buf[body..] {
            return Err(IndexError::corrupt(self.path(), "index checksum mismatch"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PackIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackIdx")
            .field("name", &self.name)
            .field("objects", &self.nsha)
            .finish()
    }
}

pub(crate) fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ---------------------------------------------------------------------------
// IdxWriter
// ---------------------------------------------------------------------------

/// One object's location in a pack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdxEntry {
    pub oid: Oid,
    pub crc: u32,
    pub offset: u64,
}

/// Accumulates `(oid, crc, offset)` while a pack is written, then serializes
/// the index sorted by oid.
#[derive(Debug, Default)]
pub struct IdxWriter {
    entries: Vec<IdxEntry>,
    sorted: bool,
}

impl IdxWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, oid: Oid, crc: u32, offset: u64) {
        self.entries.push(IdxEntry { oid, crc, offset });
        self.sorted = false;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sort(&mut self) -> IndexResult<()> {
        if !self.sorted {
            self.entries.sort_unstable_by(|a, b| a.oid.cmp(&b.oid));
            if let Some(w) = self.entries.windows(2).find(|w| w[0].oid == w[1].oid) {
                return Err(IndexError::DuplicateOid(w[0].oid));
            }
            self.sorted = true;
        }
        Ok(())
    }

    /// Hex SHA-1 of the sorted id table; packs are named after it.
    pub fn name_base(&mut self) -> IndexResult<String> {
        self.sort()?;
        let mut hasher = Sha1::new();
        for e in &self.entries {
            hasher.update(e.oid.as_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Serialize to `out`, returning the index's own checksum.
    pub fn write_to<W: Write>(
        &mut self,
        out: W,
        pack_checksum: &[u8; OID_LEN],
    ) -> IndexResult<[u8; OID_LEN]> {
        self.sort()?;
        let stream = Path::new("pack index stream");
        let mut w = HashingWriter::new(out);
        write_tables(&mut w, &self.entries, pack_checksum).at(stream)?;
        let (mut out, sum) = w.into_parts();
        out.write_all(&sum).at(stream)?;
        Ok(sum)
    }

    /// Write atomically to `dest`.
    pub fn write(&mut self, dest: &Path, pack_checksum: &[u8; OID_LEN]) -> IndexResult<PathBuf> {
        let mut file = AtomicFile::create(dest)?;
        self.write_to(&mut file, pack_checksum).map_err(|e| match e {
            IndexError::Io { source, .. } => IndexError::io(dest, source),
            other => other,
        })?;
        let path = file.commit()?;
        debug!(path = %path.display(), objects = self.entries.len(), "wrote pack index");
        Ok(path)
    }
}

fn write_tables<W: Write>(
    w: &mut W,
    entries: &[IdxEntry],
    pack_checksum: &[u8; OID_LEN],
) -> std::io::Result<()> {
    w.write_all(IDX_MAGIC)?;
    w.write_all(&IDX_VERSION.to_be_bytes())?;

    let mut counts = [0u32; 256];
    for e in entries {
        counts[usize::from(e.oid.first_byte())] += 1;
    }
    let mut total = 0u32;
    for count in counts {
        total += count;
        w.write_all(&total.to_be_bytes())?;
    }
    for e in entries {
        w.write_all(e.oid.as_bytes())?;
    }
    for e in entries {
        w.write_all(&e.crc.to_be_bytes())?;
    }
    let mut wide = Vec::new();
    for e in entries {
        let raw = if e.offset > MAX_NARROW {
            wide.push(e.offset);
            WIDE_FLAG | (wide.len() as u32 - 1)
        } else {
            e.offset as u32
        };
        w.write_all(&raw.to_be_bytes())?;
    }
    for ofs in wide {
        w.write_all(&ofs.to_be_bytes())?;
    }
    w.write_all(pack_checksum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::testutil::random_oids;

    fn write_idx(dir: &Path, name: &str, entries: &[(Oid, u64)]) -> PathBuf {
        let mut w = IdxWriter::new();
        for (i, (oid, ofs)) in entries.iter().enumerate() {
            w.add(*oid, i as u32, *ofs);
        }
        w.write(&dir.join(name), &[0xaa; OID_LEN]).unwrap()
    }

    #[test]
    fn thousand_oids_exact_membership() {
        let dir = tempfile::tempdir().unwrap();
        let oids = random_oids(1000, 1);
        let entries: Vec<_> = oids.iter().map(|o| (*o, 12)).collect();
        let idx = PackIdx::open(&write_idx(dir.path(), "a.idx", &entries)).unwrap();

        assert_eq!(idx.len(), 1000);
        assert!(oids.iter().all(|o| idx.exists(o)));
        for stranger in random_oids(1000, 2) {
            assert!(!idx.exists(&stranger));
        }
        let listed: Vec<_> = idx.iter().collect();
        let mut sorted = oids.clone();
        sorted.sort();
        assert_eq!(listed, sorted);
        idx.verify_checksum().unwrap();
        assert_eq!(idx.pack_checksum(), [0xaa; OID_LEN]);
    }

    #[test]
    fn wide_offsets_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let oids = random_oids(3, 3);
        let offsets = [0xff, 0xf_ffff_ffff, 0xff_ffff_ffff];
        let entries: Vec<_> = oids.iter().copied().zip(offsets).collect();
        let idx = PackIdx::open(&write_idx(dir.path(), "w.idx", &entries)).unwrap();
        for (oid, ofs) in entries {
            assert_eq!(idx.find_offset(&oid).unwrap(), Some(ofs));
        }
        assert_eq!(idx.find_offset(&Oid::null()).unwrap(), None);
    }

    #[test]
    fn crcs_follow_their_objects() {
        let dir = tempfile::tempdir().unwrap();
        let oids = random_oids(50, 4);
        let mut w = IdxWriter::new();
        for (i, oid) in oids.iter().enumerate() {
            w.add(*oid, 1000 + i as u32, i as u64);
        }
        let path = w.write(&dir.path().join("c.idx"), &[0; OID_LEN]).unwrap();
        let idx = PackIdx::open(&path).unwrap();
        for (i, oid) in oids.iter().enumerate() {
            assert_eq!(idx.crc(oid), Some(1000 + i as u32));
            assert_eq!(idx.find_offset(oid).unwrap(), Some(i as u64));
        }
    }

    #[test]
    fn empty_index_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let idx = PackIdx::open(&write_idx(dir.path(), "e.idx", &[])).unwrap();
        assert!(idx.is_empty());
        assert!(!idx.exists(&Oid::null()));
    }

    #[test]
    fn duplicates_are_rejected() {
        let oid = random_oids(1, 5)[0];
        let mut w = IdxWriter::new();
        w.add(oid, 0, 0);
        w.add(oid, 0, 10);
        assert!(matches!(
            w.write_to(Vec::new(), &[0; OID_LEN]),
            Err(IndexError::DuplicateOid(_))
        ));
    }

    #[test]
    fn name_base_is_sha_of_sorted_table() {
        let oids = random_oids(10, 6);
        let mut w = IdxWriter::new();
        for oid in oids.iter().rev() {
            w.add(*oid, 0, 0);
        }
        let mut sorted = oids.clone();
        sorted.sort();
        let mut hasher = Sha1::new();
        sorted.iter().for_each(|o| hasher.update(o.as_bytes()));
        assert_eq!(w.name_base().unwrap(), hex::encode(hasher.finalize()));
    }

    #[test]
    fn malformed_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_idx(dir.path(), "g.idx", &[(random_oids(1, 7)[0], 1)]);
        let bytes = std::fs::read(&good).unwrap();

        let bad_magic = dir.path().join("m.idx");
        let mut b = bytes.clone();
        b[0] = b'X';
        std::fs::write(&bad_magic, &b).unwrap();
        assert!(matches!(
            PackIdx::open(&bad_magic),
            Err(IndexError::InvalidMagic { .. })
        ));

        let bad_version = dir.path().join("v.idx");
        let mut b = bytes.clone();
        b[7] = 3;
        std::fs::write(&bad_version, &b).unwrap();
        assert!(matches!(
            PackIdx::open(&bad_version),
            Err(IndexError::UnsupportedVersion { found: 3, .. })
        ));

        let short = dir.path().join("s.idx");
        std::fs::write(&short, &bytes[..bytes.len() - 30]).unwrap();
        let err = PackIdx::open(&short).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Format);
    }

    fn rows_with_prefix(lead: u8) -> Vec<(Oid, u64)> {
        (1..=3u8)
            .map(|n| {
                let mut b = [0u8; OID_LEN];
                b[0] = lead;
                b[1] = n;
                (Oid::from_hash(b), u64::from(n) * 100)
            })
            .collect()
    }

    fn rewrite_row(path: &Path, row: usize, bytes: &[u8]) {
        let mut raw = std::fs::read(path).unwrap();
        let at = SHA_OFS + row * OID_LEN;
        raw[at..at + bytes.len()].copy_from_slice(bytes);
        std::fs::write(path, raw).unwrap();
    }

    #[test]
    fn rows_out_of_order_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rows = rows_with_prefix(0x10);
        let path = write_idx(dir.path(), "o.idx", &rows);
        rewrite_row(&path, 0, rows[2].0.as_bytes());
        rewrite_row(&path, 2, rows[0].0.as_bytes());

        let err = PackIdx::open(&path).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Consistency);
        assert!(matches!(
            &err,
            IndexError::Inconsistent { reason, .. } if reason.contains("ordering violated")
        ));
    }

    #[test]
    fn rows_outside_their_bucket_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rows = rows_with_prefix(0x10);
        let path = write_idx(dir.path(), "b.idx", &rows);
        // Still ascending, but bucket 0x10 claims all three rows.
        rewrite_row(&path, 2, &[0x11]);

        assert!(matches!(
            PackIdx::open(&path),
            Err(IndexError::Inconsistent { reason, .. }) if reason.contains("bucket 11")
        ));
    }
}
