//! Multi-pack index: one sorted id table spanning many pack indexes.
//!
//! ```text
//! MIDX | u32 version=4 | u32 bits
//! u32[2^bits]   cumulative fan-out keyed by the top `bits` bits of each id
//! [u8; 20][n]   object ids, ascending
//! u32[n]        which: position in the name list of the contributing idx
//! idx names, NUL-joined
//! ```

use std::path::Path;

use hoard_types::{Oid, OID_LEN};
use tracing::debug;

use crate::error::{IndexError, IndexResult};
use crate::idx::{basename, Lookup};
use crate::io::{be_u32, require_len, require_magic, split_names, MapMode, MappedFile, OidTable};

pub const MIDX_MAGIC: &[u8; 4] = b"MIDX";
pub const MIDX_VERSION: u32 = 4;

const HEADER_LEN: usize = 12;
/// Widest fan-out the reader accepts.
const MAX_FANOUT_BITS: u32 = 28;

pub struct PackMidx {
    map: MappedFile,
    name: String,
    bits: u32,
    nsha: usize,
    sha_ofs: usize,
    which_ofs: usize,
    idx_names: Vec<String>,
}

impl PackMidx {
    pub fn open(path: &Path) -> IndexResult<Self> {
        let map = MappedFile::open(path, MapMode::ReadOnly)?;
        let buf = map.as_slice();
        require_magic(path, buf, MIDX_MAGIC)?;
        require_len(path, buf, HEADER_LEN as u64)?;
        let version = be_u32(buf, 4);
        if version != MIDX_VERSION {
            return Err(IndexError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: version,
                supported: MIDX_VERSION,
            });
        }
        let bits = be_u32(buf, 8);
        if bits > MAX_FANOUT_BITS {
            return Err(IndexError::corrupt(path, format!("fan-out of 2^{bits} entries")));
        }
        let buckets = 1usize << bits;
        let sha_ofs = HEADER_LEN + buckets * 4;
        require_len(path, buf, sha_ofs as u64)?;

        let mut prev = 0;
        for bucket in 0..buckets {
            let count = be_u32(buf, HEADER_LEN + bucket * 4);
            if count < prev {
                return Err(IndexError::Inconsistent {
                    path: path.to_path_buf(),
                    reason: format!("fan-out decreases at bucket {bucket}"),
                });
            }
            prev = count;
        }
        let nsha = prev as usize;
        let which_ofs = sha_ofs + nsha * OID_LEN;
        let names_ofs = which_ofs + nsha * 4;
        require_len(path, buf, names_ofs as u64)?;
        let idx_names = split_names(&buf[names_ofs..]);
        if nsha > 0 && idx_names.is_empty() {
            return Err(IndexError::corrupt(path, "objects listed but no index names"));
        }

        let name = basename(path);
        debug!(midx = %name, objects = nsha, idxs = idx_names.len(), "opened midx");
        Ok(Self {
            map,
            name,
            bits,
            nsha,
            sha_ofs,
            which_ofs,
            idx_names,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        self.map.path()
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn len(&self) -> usize {
        self.nsha
    }

    pub fn is_empty(&self) -> bool {
        self.nsha == 0
    }

    /// Basenames of the covered indexes, in `which` order.
    pub fn idx_names(&self) -> &[String] {
        &self.idx_names
    }

    /// Covered indexes that are no longer present beside this file.
    pub fn missing_idxs(&self) -> Vec<&str> {
        let dir = self.path().parent().unwrap_or_else(|| Path::new("."));
        self.idx_names
            .iter()
            .filter(|n| !dir.join(n).exists())
            .map(String::as_str)
            .collect()
    }

    fn buf(&self) -> &[u8] {
        self.map.as_slice()
    }

    fn fanout(&self, bucket: u32) -> usize {
        be_u32(self.buf(), HEADER_LEN + bucket as usize * 4) as usize
    }

    pub fn table(&self) -> OidTable<'_> {
        OidTable::new(&self.buf()[self.sha_ofs..self.which_ofs])
    }

    /// Raw `which` value at table position `pos`.
    pub fn which_at(&self, pos: usize) -> u32 {
        be_u32(self.buf(), self.which_ofs + pos * 4)
    }

    /// Name of the index that contributed the entry at `pos`, or `None` if
    /// its `which` points past the name list.
    pub fn idx_name_at(&self, pos: usize) -> Option<&str> {
        self.idx_names
            .get(self.which_at(pos) as usize)
            .map(String::as_str)
    }

    /// Interpolation search within the fan-out bucket.
    ///
    /// Ids are uniformly distributed, so the position of the leading 32 bits
    /// between the bucket's bounds predicts the position in the table; each
    /// miss tightens both the index range and the value range.
    pub fn lookup(&self, oid: &Oid) -> Lookup {
        let el = oid.prefix(self.bits);
        let shift = 32 - self.bits;
        let (mut start, mut startv) = if el == 0 {
            (0, 0u64)
        } else {
            (self.fanout(el - 1), u64::from(el) << shift)
        };
        let mut end = self.fanout(el);
        let mut endv = (u64::from(el) + 1) << shift;
        let hashv = u64::from(oid.first_word());
        let want = oid.as_bytes().as_slice();
        let table = self.table();
        let mut steps = 1;
        while start < end {
            steps += 1;
            let span = (end - start - 1) as u64;
            let mid = if endv > startv {
                start + (hashv.saturating_sub(startv) * span / (endv - startv)) as usize
            } else {
                start + (end - start) / 2
            };
            let mid = mid.min(end - 1);
            let v = table.bytes(mid);
            match v.cmp(want) {
                std::cmp::Ordering::Less => {
                    start = mid + 1;
                    startv = u64::from(be_u32(v, 0));
                }
                std::cmp::Ordering::Greater => {
                    end = mid;
                    endv = u64::from(be_u32(v, 0));
                }
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

    /// Name of the index that holds `oid`, if any does.
    pub fn exists_with_source(&self, oid: &Oid) -> Option<&str> {
        self.lookup(oid).found.and_then(|pos| self.idx_name_at(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = Oid> + '_ {
        self.table().iter()
    }

    /// `(oid, which)` pairs in table order.
    pub fn entries(&self) -> impl Iterator<Item = (Oid, u32)> + '_ {
        self.iter()
            .enumerate()
            .map(move |(pos, oid)| (oid, self.which_at(pos)))
    }
}

impl std::fmt::Debug for PackMidx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackMidx")
            .field("name", &self.name)
            .field("bits", &self.bits)
            .field("objects", &self.nsha)
            .field("idx_names", &self.idx_names)
            .finish()
    }
}
