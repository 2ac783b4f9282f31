//! The live set of indexes for one pack directory.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use hoard_types::Oid;
use tracing::{debug, warn};

use crate::bloom::{ShaBloom, BLOOM_FILE_NAME};
use crate::error::{IndexError, IndexResult};
use crate::idx::PackIdx;
use crate::merge::MergeIter;
use crate::midx::PackMidx;
use crate::source::{list_index_files, IndexSource};

/// Where [`PackIdxList::exists_with_source`] found an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    /// Added during this session with [`PackIdxList::add`] and not yet indexed.
    Session,
    /// Found in an index file.
    Indexed {
        /// The idx or midx that answered.
        source: String,
        /// The pack index holding the object; equal to `source` for an idx.
        idx: String,
    },
}

impl Location {
    /// Name of the pack index holding the object, if it is on disk.
    pub fn idx_name(&self) -> Option<&str> {
        match self {
            Self::Session => None,
            Self::Indexed { idx, .. } => Some(idx),
        }
    }
}

/// Lookup counters for one [`PackIdxList`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub searches: u64,
    /// Table lookups across all sources, counting each fan-out lookup as one.
    pub steps: u64,
    pub session_hits: u64,
    /// Lookups answered "absent" by the bloom filter alone.
    pub bloom_rejects: u64,
    /// Index files skipped during refresh because they could not be opened.
    pub skipped_files: u64,
}

/// Answers "is this object already stored?" across every idx and midx in a
/// pack directory, plus objects added during the current session.
///
/// Sources are kept ordered so that the one that answered last is tried
/// first. The bloom filter is consulted only after a lookup that found
/// nothing, and skipped again after a lookup it let through.
pub struct PackIdxList {
    dir: PathBuf,
    packs: Vec<Arc<IndexSource>>,
    also: HashSet<Oid>,
    bloom: Option<ShaBloom>,
    do_bloom: bool,
    ignore_midx: bool,
    stats: SearchStats,
}

impl PackIdxList {
    pub fn open(dir: &Path) -> IndexResult<Self> {
        Self::open_with(dir, false)
    }

    /// With `ignore_midx`, every refresh behaves as `refresh(true)`.
    pub fn open_with(dir: &Path, ignore_midx: bool) -> IndexResult<Self> {
        let mut list = Self {
            dir: dir.to_path_buf(),
            packs: Vec::new(),
            also: HashSet::new(),
            bloom: None,
            do_bloom: false,
            ignore_midx,
            stats: SearchStats::default(),
        };
        list.refresh(false)?;
        Ok(list)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Open sources, largest first until lookups reorder them.
    pub fn sources(&self) -> &[Arc<IndexSource>] {
        &self.packs
    }

    /// The bloom filter in use, if any.
    pub fn bloom(&self) -> Option<&ShaBloom> {
        self.bloom.as_ref()
    }

    pub fn stats(&self) -> SearchStats {
        self.stats
    }

    /// Total entries across sources. Objects in more than one source are
    /// counted once per source.
    pub fn len(&self) -> usize {
        self.packs.iter().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.iter().all(|p| p.is_empty())
    }

    /// Record an object written during this session.
    pub fn add(&mut self, oid: Oid) {
        self.also.insert(oid);
    }

    pub fn exists(&mut self, oid: &Oid) -> bool {
        self.exists_with_source(oid).is_some()
    }

    pub fn exists_with_source(&mut self, oid: &Oid) -> Option<Location> {
        self.stats.searches += 1;
        if self.also.contains(oid) {
            self.stats.session_hits += 1;
            return Some(Location::Session);
        }
        if self.do_bloom {
            if let Some(bloom) = &self.bloom {
                if !bloom.exists(oid) {
                    self.stats.bloom_rejects += 1;
                    return None;
                }
                self.do_bloom = false;
            }
        }
        for i in 0..self.packs.len() {
            let src = &self.packs[i];
            let hit = src.lookup(oid);
            self.stats.steps += u64::from(hit.steps);
            let Some(pos) = hit.found else {
                continue;
            };
            let Some(idx) = src.idx_name_at(pos) else {
                warn!(source = src.name(), %oid, "entry names no known index; ignoring it");
                continue;
            };
            let location = Location::Indexed {
                source: src.name().to_string(),
                idx: idx.to_string(),
            };
            self.packs[..=i].rotate_right(1);
            return Some(location);
        }
        self.do_bloom = true;
        None
    }

    /// Every indexed id, ascending, each once.
    pub fn iter(&self) -> impl Iterator<Item = Oid> + '_ {
        let sources: Vec<&IndexSource> = self.packs.iter().map(|p| p.as_ref()).collect();
        MergeIter::new(&sources).map(|(oid, _)| oid)
    }

    /// Re-scan the directory.
    ///
    /// Open sources are reused. New midx files are opened unless `skip_midx`;
    /// one that lists a missing idx is deleted, and one that adds no coverage
    /// over larger or newer midx files is deleted as redundant. Idx files
    /// covered by a kept midx are not opened. The bloom filter is reopened
    /// and used only when it covers at least as many entries as the sources.
    pub fn refresh(&mut self, skip_midx: bool) -> IndexResult<()> {
        self.bloom = None;
        self.do_bloom = false;
        let skip_midx = skip_midx || self.ignore_midx;
        if !self.dir.is_dir() {
            return Err(IndexError::io(
                &self.dir,
                std::io::Error::new(std::io::ErrorKind::NotFound, "pack directory not found"),
            ));
        }
        let (idx_paths, midx_paths) = list_index_files(&self.dir)?;

        let mut covered: HashMap<PathBuf, Arc<IndexSource>> = HashMap::new();
        for p in &self.packs {
            if (skip_midx && p.is_midx()) || !p.path().exists() {
                continue;
            }
            covered.insert(p.path().to_path_buf(), Arc::clone(p));
            if p.is_midx() {
                for name in p.idx_names() {
                    covered.insert(self.dir.join(name), Arc::clone(p));
                }
            }
        }

        if !skip_midx {
            let mut fresh = Vec::new();
            for path in midx_paths {
                if covered.contains_key(&path) {
                    continue;
                }
                if let Some(m) = self.open_new_midx(&path) {
                    fresh.push(m);
                }
            }
            fresh.sort_by_cached_key(|m| (Reverse(m.len()), Reverse(mtime(m.path()))));
            for m in fresh {
                let needed = m.idx_names().iter().any(|n| {
                    covered
                        .get(&self.dir.join(n))
                        .map_or(true, |s| !s.is_midx())
                });
                if needed {
                    let src = Arc::new(IndexSource::Midx(m));
                    covered.insert(src.path().to_path_buf(), Arc::clone(&src));
                    for name in src.idx_names() {
                        covered.insert(self.dir.join(name), Arc::clone(&src));
                    }
                } else {
                    let path = m.path().to_path_buf();
                    drop(m);
                    debug!(midx = %path.display(), "midx: removing redundant");
                    remove_index_file(&path);
                }
            }
        }

        for path in idx_paths {
            if covered.contains_key(&path) {
                continue;
            }
            match PackIdx::open(&path) {
                Ok(idx) => {
                    covered.insert(path, Arc::new(IndexSource::Idx(idx)));
                }
                Err(e) => {
                    warn!(error = %e, "skipping unreadable index");
                    self.stats.skipped_files += 1;
                }
            }
        }

        let mut seen = HashSet::new();
        let mut packs: Vec<Arc<IndexSource>> = covered
            .into_values()
            .filter(|s| seen.insert(Arc::as_ptr(s)))
            .collect();
        packs.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.name().cmp(b.name())));
        self.packs = packs;

        let bloom_path = self.dir.join(BLOOM_FILE_NAME);
        if bloom_path.exists() {
            match ShaBloom::open(&bloom_path) {
                Ok(b) if b.valid() && b.len() >= self.len() as u64 => {
                    self.bloom = Some(b);
                    self.do_bloom = true;
                }
                Ok(b) => debug!(
                    entries = b.len(),
                    indexed = self.len(),
                    "bloom filter is behind the indexes; not using it"
                ),
                Err(e) => warn!(error = %e, "ignoring unreadable bloom filter"),
            }
        }
        debug!(
            dir = %self.dir.display(),
            indexes = self.packs.len(),
            bloom = self.bloom.is_some(),
            "PackIdxList: refreshed"
        );
        Ok(())
    }

    fn open_new_midx(&mut self, path: &Path) -> Option<PackMidx> {
        match PackMidx::open(path) {
            Ok(m) => {
                let missing = m.missing_idxs();
                if missing.is_empty() {
                    return Some(m);
                }
                for idx in &missing {
                    warn!(midx = m.name(), idx, "index missing; midx is incomplete");
                }
                drop(m);
                remove_index_file(path);
                None
            }
            Err(e) if e.is_too_old() => {
                warn!(error = %e, "removing old-style midx");
                remove_index_file(path);
                None
            }
            Err(e) => {
                warn!(error = %e, "skipping midx");
                self.stats.skipped_files += 1;
                None
            }
        }
    }
}

impl std::fmt::Debug for PackIdxList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackIdxList")
            .field("dir", &self.dir)
            .field("sources", &self.packs.len())
            .field("session", &self.also.len())
            .field("bloom", &self.bloom.is_some())
            .finish()
    }
}

pub(crate) fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

pub(crate) fn remove_index_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove index file");
        }
    }
}
