//! K-way merge of sorted index sources into a multi-pack index.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use hoard_types::Oid;
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::error::{IndexError, IndexResult, IoContext};
use crate::idx::basename;
use crate::io::AtomicFile;
use crate::midx::{MIDX_MAGIC, MIDX_VERSION};
use crate::source::IndexSource;

/// Object ids stored per 4 KiB page of id table.
const SHA_PER_PAGE_NUM: u64 = 5;
const SHA_PER_PAGE_DEN: u64 = 1024;

/// Fan-out width for a midx holding `total` ids: about one bucket per page
/// of id table.
pub fn midx_bits(total: u64) -> u32 {
    let pages = (total * SHA_PER_PAGE_NUM / SHA_PER_PAGE_DEN).max(1);
    64 - (pages - 1).leading_zeros()
}

/// `midx-<hex sha1 of the sorted input basenames, NUL-joined>.midx`.
pub fn midx_file_name<P: AsRef<Path>>(inputs: &[P]) -> String {
    let mut names: Vec<String> = inputs.iter().map(|p| basename(p.as_ref())).collect();
    names.sort();
    let sum = Sha1::digest(names.join("\0").as_bytes());
    format!("midx-{}.midx", hex::encode(sum))
}

/// Ascending `(oid, which)` over several sorted sources.
///
/// Holds one pending entry per source in a min-heap. An id present in more
/// than one source is yielded once, attributed to the earliest source.
pub struct MergeIter<'a> {
    heap: BinaryHeap<Reverse<(Oid, u32, usize)>>,
    inputs: Vec<Box<dyn Iterator<Item = (Oid, u32)> + 'a>>,
    last: Option<Oid>,
    duplicates: u64,
}

impl<'a> MergeIter<'a> {
    /// `which` values are positions in the concatenation of every source's
    /// [`IndexSource::idx_names`], in the order given.
    pub fn new(sources: &[&'a IndexSource]) -> Self {
        let mut inputs = Vec::with_capacity(sources.len());
        let mut name_base = 0u32;
        for src in sources {
            inputs.push(src.entries(name_base));
            name_base += src.idx_names().len() as u32;
        }
        let mut heap = BinaryHeap::with_capacity(inputs.len());
        for (i, input) in inputs.iter_mut().enumerate() {
            if let Some((oid, which)) = input.next() {
                heap.push(Reverse((oid, which, i)));
            }
        }
        Self {
            heap,
            inputs,
            last: None,
            duplicates: 0,
        }
    }

    /// Ids skipped so far because an earlier source already yielded them.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}

impl Iterator for MergeIter<'_> {
    type Item = (Oid, u32);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Reverse((oid, which, i)) = self.heap.pop()?;
            if let Some((next, w)) = self.inputs[i].next() {
                self.heap.push(Reverse((next, w, i)));
            }
            if self.last == Some(oid) {
                self.duplicates += 1;
                continue;
            }
            self.last = Some(oid);
            return Some((oid, which));
        }
    }
}

/// Outcome of [`merge_into`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MidxSummary {
    pub path: PathBuf,
    pub objects: u64,
    pub duplicates: u64,
    pub idx_count: usize,
}

/// Merge `sources` into a new midx at `dest`, replacing any file there.
pub fn merge_into(dest: &Path, sources: &[&IndexSource]) -> IndexResult<MidxSummary> {
    let total: u64 = sources.iter().map(|s| s.len() as u64).sum();
    let bits = midx_bits(total);
    let buckets = 1usize << bits;
    let names: Vec<&str> = sources.iter().flat_map(|s| s.idx_names()).collect();
    if u32::try_from(names.len()).is_err() {
        return Err(IndexError::InvalidArgument(format!(
            "too many indexes to merge: {}",
            names.len()
        )));
    }
    debug!(
        inputs = sources.len(),
        objects = total,
        table_bytes = buckets * 4,
        bits,
        "midx: merging"
    );

    let mut out = AtomicFile::create(dest)?;
    out.write_all(MIDX_MAGIC).at(dest)?;
    out.write_all(&MIDX_VERSION.to_be_bytes()).at(dest)?;
    out.write_all(&bits.to_be_bytes()).at(dest)?;
    let fanout_ofs = out.stream_position().at(dest)?;
    out.write_all(&vec![0u8; buckets * 4]).at(dest)?;

    let mut counts = vec![0u32; buckets];
    let mut which = Vec::with_capacity(total as usize);
    let mut merge = MergeIter::new(sources);
    for (oid, w) in merge.by_ref() {
        out.write_all(oid.as_bytes()).at(dest)?;
        counts[oid.prefix(bits) as usize] += 1;
        which.push(w);
    }
    let duplicates = merge.duplicates();
    for w in &which {
        out.write_all(&w.to_be_bytes()).at(dest)?;
    }
    out.write_all(names.join("\0").as_bytes()).at(dest)?;

    let mut fanout = Vec::with_capacity(buckets * 4);
    let mut cumulative = 0u32;
    for c in counts {
        cumulative += c;
        fanout.extend_from_slice(&cumulative.to_be_bytes());
    }
    out.seek(SeekFrom::Start(fanout_ofs)).at(dest)?;
    out.write_all(&fanout).at(dest)?;
    let path = out.commit()?;

    info!(
        midx = %basename(&path),
        objects = which.len(),
        duplicates,
        "midx: wrote"
    );
    Ok(MidxSummary {
        path,
        objects: which.len() as u64,
        duplicates,
        idx_count: names.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midx::PackMidx;
    use crate::testutil::random_oids;

    fn write_idx(path: &Path, oids: &[Oid]) -> IndexSource {
        IndexSource::open(&crate::testutil::write_idx(path, oids)).unwrap()
    }

    #[test]
    fn bits_follow_page_count() {
        assert_eq!(midx_bits(0), 0);
        assert_eq!(midx_bits(204), 0);
        assert_eq!(midx_bits(410), 1);
        assert_eq!(midx_bits(1024), 3);
        assert_eq!(midx_bits(1_000_000), 13);
    }

    #[test]
    fn name_ignores_input_order_and_dirs() {
        let a = midx_file_name(&["/x/pack-1.idx", "/x/pack-2.idx"]);
        let b = midx_file_name(&["pack-2.idx", "pack-1.idx"]);
        assert_eq!(a, b);
        assert!(a.starts_with("midx-") && a.ends_with(".midx"));
        assert_eq!(a.len(), "midx-.midx".len() + 40);
    }

    #[test]
    fn two_disjoint_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let first = random_oids(1500, 1);
        let second = random_oids(700, 2);
        let a = write_idx(&dir.path().join("pack-a.idx"), &first);
        let b = write_idx(&dir.path().join("pack-b.idx"), &second);

        let summary = merge_into(&dir.path().join("m.midx"), &[&a, &b]).unwrap();
        assert_eq!(summary.objects, 2200);
        assert_eq!(summary.duplicates, 0);

        let m = PackMidx::open(&summary.path).unwrap();
        assert_eq!(m.len(), a.len() + b.len());
        assert_eq!(m.bits(), midx_bits(2200));
        assert_eq!(m.idx_names(), ["pack-a.idx", "pack-b.idx"]);
        for o in &first {
            assert_eq!(m.exists_with_source(o), Some("pack-a.idx"));
        }
        for o in &second {
            assert_eq!(m.exists_with_source(o), Some("pack-b.idx"));
        }
        for o in random_oids(200, 3) {
            assert!(!m.exists(&o));
        }
        let all: Vec<Oid> = m.iter().collect();
        assert!(all.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn overlapping_ids_are_kept_once() {
        let dir = tempfile::tempdir().unwrap();
        let shared = random_oids(50, 4);
        let mut more = random_oids(20, 5);
        more.extend_from_slice(&shared[..10]);
        let a = write_idx(&dir.path().join("a.idx"), &shared);
        let b = write_idx(&dir.path().join("b.idx"), &more);

        let summary = merge_into(&dir.path().join("m.midx"), &[&a, &b]).unwrap();
        assert_eq!(summary.objects, 70);
        assert_eq!(summary.duplicates, 10);
        let m = PackMidx::open(&summary.path).unwrap();
        assert_eq!(m.exists_with_source(&shared[0]), Some("a.idx"));
    }

    #[test]
    fn nested_midx_keeps_contributors() {
        let dir = tempfile::tempdir().unwrap();
        let ids: Vec<Vec<Oid>> = (0..3).map(|s| random_oids(30, 10 + s)).collect();
        let a = write_idx(&dir.path().join("a.idx"), &ids[0]);
        let b = write_idx(&dir.path().join("b.idx"), &ids[1]);
        let c = write_idx(&dir.path().join("c.idx"), &ids[2]);
        let inner = merge_into(&dir.path().join("inner.midx"), &[&a, &b]).unwrap();
        let inner = IndexSource::open(&inner.path).unwrap();

        let outer = merge_into(&dir.path().join("outer.midx"), &[&c, &inner]).unwrap();
        let m = PackMidx::open(&outer.path).unwrap();
        assert_eq!(m.idx_names(), ["c.idx", "a.idx", "b.idx"]);
        assert_eq!(m.exists_with_source(&ids[0][0]), Some("a.idx"));
        assert_eq!(m.exists_with_source(&ids[1][0]), Some("b.idx"));
        assert_eq!(m.exists_with_source(&ids[2][0]), Some("c.idx"));
    }

    #[test]
    fn empty_inputs_give_empty_midx() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_idx(&dir.path().join("a.idx"), &[]);
        let summary = merge_into(&dir.path().join("m.midx"), &[&a]).unwrap();
        let m = PackMidx::open(&summary.path).unwrap();
        assert!(m.is_empty());
        assert!(!m.exists(&random_oids(1, 6)[0]));
    }

    #[test]
    fn merge_iter_is_sorted_across_sources() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_idx(&dir.path().join("a.idx"), &random_oids(100, 7));
        let b = write_idx(&dir.path().join("b.idx"), &random_oids(100, 8));
        let c = write_idx(&dir.path().join("c.idx"), &random_oids(100, 9));
        let merged: Vec<(Oid, u32)> = MergeIter::new(&[&a, &b, &c]).collect();
        assert_eq!(merged.len(), 300);
        assert!(merged.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(merged.iter().all(|(_, w)| *w < 3));
    }
}
