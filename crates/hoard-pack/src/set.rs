use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use hoard_index::{Location, PackIdxList};
use hoard_store::{ObjectReader, StoreResult, StoredObject};
use hoard_types::Oid;

use crate::error::PackResult;
use crate::reader::PackReader;

/// Reads objects from every pack in a directory.
///
/// Lookups go through a [`PackIdxList`], so midx and bloom files are used
/// when present; the answering idx name picks the pack to open. Readers are
/// opened on first use and cached.
pub struct PackSet {
    dir: PathBuf,
    list: PackIdxList,
    readers: HashMap<String, PackReader>,
}

impl PackSet {
    pub fn open(dir: &Path) -> PackResult<Self> {
        Ok(Self {
            dir: dir.to_path_buf(),
            list: PackIdxList::open(dir)?,
            readers: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn list(&self) -> &PackIdxList {
        &self.list
    }

    /// Pick up packs written since opening.
    pub fn refresh(&mut self) -> PackResult<()> {
        self.list.refresh(false)?;
        Ok(())
    }

    pub fn contains(&mut self, oid: &Oid) -> bool {
        self.list.exists(oid)
    }

    /// Pack holding `oid`, if it is indexed.
    pub fn locate(&mut self, oid: &Oid) -> Option<PathBuf> {
        match self.list.exists_with_source(oid)? {
            Location::Session => None,
            Location::Indexed { idx, .. } => Some(self.dir.join(idx).with_extension("pack")),
        }
    }

    pub fn read_object(&mut self, oid: &Oid) -> PackResult<Option<StoredObject>> {
        let Some(Location::Indexed { idx, .. }) = self.list.exists_with_source(oid) else {
            return Ok(None);
        };
        let reader = match self.readers.entry(idx) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let pack = self.dir.join(e.key()).with_extension("pack");
                e.insert(PackReader::open(&pack)?)
            }
        };
        reader.read_object(oid)
    }
}

impl ObjectReader for PackSet {
    fn read(&mut self, id: &Oid) -> StoreResult<Option<StoredObject>> {
        Ok(self.read_object(id)?)
    }
}

impl std::fmt::Debug for PackSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackSet")
            .field("dir", &self.dir)
            .field("open_packs", &self.readers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackConfig;
    use crate::writer::PackWriter;
    use hoard_index::{list_index_files, MaintenanceConfig};
    use hoard_split::{join, split_to_blob_or_tree, HashSplitter, SplitConfig};
    use hoard_types::ObjectKind;
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    fn random_bytes(n: usize, seed: u64) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        StdRng::seed_from_u64(seed).fill_bytes(&mut buf);
        buf
    }

    #[test]
    fn split_then_join_through_packs() {
        let dir = tempfile::tempdir().unwrap();
        let data = random_bytes(600_000, 1);
        let config = SplitConfig::default();
        let mut w = PackWriter::new(dir.path(), PackConfig::default(), MaintenanceConfig::default())
            .unwrap();
        let splitter = HashSplitter::new([data.as_slice()], &config).unwrap();
        let top = split_to_blob_or_tree(&mut w, splitter, config.max_per_tree).unwrap();
        w.close().unwrap();

        let mut set = PackSet::open(dir.path()).unwrap();
        let mut out = Vec::new();
        let n = join(&mut set, &top.id, &mut out).unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn many_packs_resolve_through_midx() {
        let dir = tempfile::tempdir().unwrap();
        let mut firsts = Vec::new();
        for p in 0..14u64 {
            let mut w =
                PackWriter::new(dir.path(), PackConfig::default(), MaintenanceConfig::default())
                    .unwrap();
            let mut first = None;
            for i in 0..100u64 {
                let id = w
                    .write_object(ObjectKind::Blob, &random_bytes(64, p * 1000 + i))
                    .unwrap();
                first.get_or_insert(id);
            }
            let idx = w.close().unwrap().remove(0);
            firsts.push((first.unwrap(), idx));
        }
        let (idxs, midxs) = list_index_files(dir.path()).unwrap();
        assert_eq!(idxs.len(), 14);
        assert!(!midxs.is_empty());

        let mut set = PackSet::open(dir.path()).unwrap();
        assert!(set.list().sources().iter().any(|s| s.is_midx()));
        for (id, idx) in &firsts {
            assert_eq!(set.locate(id), Some(idx.with_extension("pack")));
            let obj = set.read_object(id).unwrap().unwrap();
            assert_eq!(obj.compute_id(), *id);
        }
        assert!(set.read_object(&Oid::null()).unwrap().is_none());
    }

    #[test]
    fn refresh_sees_new_packs() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = PackSet::open(dir.path()).unwrap();
        let mut w = PackWriter::new(dir.path(), PackConfig::default(), MaintenanceConfig::default())
            .unwrap();
        let id = w.write_object(ObjectKind::Commit, b"tree 0\n").unwrap();
        w.close().unwrap();
        assert!(!set.contains(&id));
        set.refresh().unwrap();
        assert_eq!(set.read_required(&id).unwrap().kind, ObjectKind::Commit);
    }
}
