//! A single opened index file of either kind.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use hoard_types::Oid;

use crate::error::{IndexError, IndexResult, IoContext};
use crate::idx::{Lookup, PackIdx};
use crate::midx::{PackMidx, MIDX_MAGIC};

/// A pack index or a multi-pack index.
#[derive(Debug)]
pub enum IndexSource {
    Idx(PackIdx),
    Midx(PackMidx),
}

impl IndexSource {
    /// Open `path`, choosing the format from its leading magic bytes.
    pub fn open(path: &Path) -> IndexResult<Self> {
        let mut magic = [0u8; 4];
        let mut file = File::open(path).at(path)?;
        let mut read = 0;
        while read < magic.len() {
            match file.read(&mut magic[read..]).at(path)? {
                0 => break,
                n => read += n,
            }
        }
        if read < magic.len() {
            return Err(IndexError::Truncated {
                path: path.to_path_buf(),
                expected: magic.len() as u64,
                actual: read as u64,
            });
        }
        drop(file);
        if &magic == MIDX_MAGIC {
            PackMidx::open(path).map(Self::Midx)
        } else {
            PackIdx::open(path).map(Self::Idx)
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Idx(i) => i.name(),
            Self::Midx(m) => m.name(),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Idx(i) => i.path(),
            Self::Midx(m) => m.path(),
        }
    }

    pub fn is_midx(&self) -> bool {
        matches!(self, Self::Midx(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Idx(i) => i.len(),
            Self::Midx(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the pack indexes this source answers for: itself for an
    /// idx, the covered set for a midx.
    pub fn idx_names(&self) -> Vec<&str> {
        match self {
            Self::Idx(i) => vec![i.name()],
            Self::Midx(m) => m.idx_names().iter().map(String::as_str).collect(),
        }
    }

    pub fn lookup(&self, oid: &Oid) -> Lookup {
        match self {
            Self::Idx(i) => i.lookup(oid),
            Self::Midx(m) => m.lookup(oid),
        }
    }

    pub fn exists(&self, oid: &Oid) -> bool {
        self.lookup(oid).found.is_some()
    }

    /// Contributing idx name for the table entry at `pos`.
    pub fn idx_name_at(&self, pos: usize) -> Option<&str> {
        match self {
            Self::Idx(i) => Some(i.name()),
            Self::Midx(m) => m.idx_name_at(pos),
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = Oid> + '_> {
        match self {
            Self::Idx(i) => Box::new(i.iter()),
            Self::Midx(m) => Box::new(m.iter()),
        }
    }

    /// `(oid, which)` pairs, with `which` offset by `name_base` so that the
    /// names of several sources can be concatenated.
    pub fn entries(&self, name_base: u32) -> Box<dyn Iterator<Item = (Oid, u32)> + '_> {
        match self {
            Self::Idx(i) => Box::new(i.iter().map(move |oid| (oid, name_base))),
            Self::Midx(m) => Box::new(m.entries().map(move |(oid, w)| (oid, name_base + w))),
        }
    }
}

/// `*.idx` and `*.midx` files in `dir`, each list sorted by name.
pub fn list_index_files(dir: &Path) -> IndexResult<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut idxs = Vec::new();
    let mut midxs = Vec::new();
    for entry in std::fs::read_dir(dir).at(dir)? {
        let path = entry.at(dir)?.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("idx") => idxs.push(path),
            Some("midx") => midxs.push(path),
            _ => {}
        }
    }
    idxs.sort();
    midxs.sort();
    Ok((idxs, midxs))
}
