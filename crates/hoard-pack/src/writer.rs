use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use hoard_index::io::{persist, temp_file_beside, AtomicFile};
use hoard_index::{auto_maintain, IdxWriter, MaintenanceConfig, PackIdxList, Report};
use hoard_store::{ObjectWriter, StoreResult};
use hoard_types::{ContentHasher, ObjectKind, Oid, OID_LEN};
use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::PackConfig;
use crate::entry::{encode_header, PACK_HEADER_LEN, PACK_MAGIC, PACK_VERSION};
use crate::error::{IoContext, PackError, PackResult};

/// A pack being filled, under a temporary name.
struct OpenPack {
    out: BufWriter<NamedTempFile>,
    path: PathBuf,
    size: u64,
    idx: IdxWriter,
}

impl OpenPack {
    fn create(dir: &Path) -> PackResult<Self> {
        let tmp = temp_file_beside(&dir.join("pack"))?;
        let path = tmp.path().to_path_buf();
        let mut out = BufWriter::new(tmp);
        out.write_all(PACK_MAGIC).at(&path)?;
        out.write_all(&PACK_VERSION.to_be_bytes()).at(&path)?;
        out.write_all(&0u32.to_be_bytes()).at(&path)?;
        debug!(tmp = %path.display(), "pack: started");
        Ok(Self {
            out,
            path,
            size: PACK_HEADER_LEN as u64,
            idx: IdxWriter::new(),
        })
    }
}

/// Writes objects into packs in one directory, skipping objects already
/// stored there.
///
/// Objects go to a temporary file; [`breakpoint`](Self::breakpoint) (or
/// reaching a configured limit) seals it as `pack-<sha>.pack` with its idx.
/// Dropping the writer without [`close`](Self::close) discards the open
/// pack.
pub struct PackWriter {
    dir: PathBuf,
    config: PackConfig,
    maintenance: MaintenanceConfig,
    objcache: Option<PackIdxList>,
    current: Option<OpenPack>,
    finished: Vec<PathBuf>,
    closed: bool,
}

impl PackWriter {
    pub fn new(dir: &Path, config: PackConfig, maintenance: MaintenanceConfig) -> PackResult<Self> {
        config.validate()?;
        maintenance.validate()?;
        std::fs::create_dir_all(dir).at(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            maintenance,
            objcache: None,
            current: None,
            finished: Vec::new(),
            closed: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Objects written to the open pack.
    pub fn pending(&self) -> usize {
        self.current.as_ref().map_or(0, |p| p.idx.len())
    }

    /// Idx files of the packs sealed so far.
    pub fn finished(&self) -> &[PathBuf] {
        &self.finished
    }

    fn objcache(&mut self) -> PackResult<&mut PackIdxList> {
        let cache = match self.objcache.take() {
            Some(c) => c,
            None => PackIdxList::open(&self.dir)?,
        };
        Ok(self.objcache.insert(cache))
    }

    pub fn contains(&mut self, oid: &Oid) -> PackResult<bool> {
        Ok(self.objcache()?.exists(oid))
    }

    /// Store an object unless it is already present, returning its id.
    pub fn write_object(&mut self, kind: ObjectKind, data: &[u8]) -> PackResult<Oid> {
        let oid = ContentHasher::new(kind).hash(data);
        if self.contains(&oid)? {
            return Ok(oid);
        }
        self.write_raw(oid, kind, data)?;
        Ok(oid)
    }

    fn write_raw(&mut self, oid: Oid, kind: ObjectKind, data: &[u8]) -> PackResult<()> {
        let header = encode_header(kind, data.len() as u64);
        let compressed = deflate(data, self.config.compression_level)
            .map_err(|e| PackError::corrupt(0, format!("compression failed: {e}")))?;
        let mut crc = crc32fast::Hasher::new();
        crc.update(&header);
        crc.update(&compressed);
        let crc = crc.finalize();

        let pack = match self.current.take() {
            Some(p) => p,
            None => OpenPack::create(&self.dir)?,
        };
        let pack = self.current.insert(pack);
        let offset = pack.size;
        pack.out.write_all(&header).at(&pack.path)?;
        pack.out.write_all(&compressed).at(&pack.path)?;
        pack.size += (header.len() + compressed.len()) as u64;
        pack.idx.add(oid, crc, offset);
        let (size, count) = (pack.size, pack.idx.len());

        self.objcache()?.add(oid);
        if size >= self.config.max_pack_size || count >= self.config.max_pack_objects {
            debug!(size, count, "pack: limit reached");
            self.breakpoint()?;
        }
        Ok(())
    }

    /// Seal the open pack, if it holds anything, and return its idx path.
    pub fn breakpoint(&mut self) -> PackResult<Option<PathBuf>> {
        let Some(pack) = self.current.take() else {
            return Ok(None);
        };
        if pack.idx.is_empty() {
            return Ok(None);
        }
        let OpenPack {
            out, path, mut idx, ..
        } = pack;
        let mut tmp = out
            .into_inner()
            .map_err(|e| PackError::io(&path, e.into_error()))?;
        let count = idx.len() as u32;
        let file = tmp.as_file_mut();
        file.seek(SeekFrom::Start(8)).at(&path)?;
        file.write_all(&count.to_be_bytes()).at(&path)?;
        file.seek(SeekFrom::Start(0)).at(&path)?;
        let mut hasher = Sha1::new();
        std::io::copy(file, &mut hasher).at(&path)?;
        let mut sum = [0u8; OID_LEN];
        sum.copy_from_slice(&hasher.finalize());
        file.seek(SeekFrom::End(0)).at(&path)?;
        file.write_all(&sum).at(&path)?;

        let name = format!("pack-{}", idx.name_base()?);
        let pack_path = self.dir.join(format!("{name}.pack"));
        let idx_path = self.dir.join(format!("{name}.idx"));
        // The idx is what makes a pack visible, so it is renamed last.
        let mut idx_file = AtomicFile::create(&idx_path)?;
        idx.write_to(&mut idx_file, &sum)?;
        persist(tmp, &pack_path)?;
        if let Err(e) = idx_file.commit() {
            if let Err(rm) = std::fs::remove_file(&pack_path) {
                warn!(
                    pack = %pack_path.display(),
                    error = %rm,
                    "pack: could not remove unindexed pack"
                );
            }
            return Err(e.into());
        }
        info!(pack = %name, objects = count, "pack: sealed");

        if let Some(cache) = self.objcache.as_mut() {
            cache.refresh(false)?;
        }
        self.finished.push(idx_path.clone());
        Ok(Some(idx_path))
    }

    /// Seal the open pack and, if configured, run index maintenance.
    /// Returns the idx paths of every pack this writer sealed.
    pub fn close(mut self) -> PackResult<Vec<PathBuf>> {
        self.breakpoint()?;
        self.closed = true;
        if self.maintenance.auto_after_write && !self.finished.is_empty() {
            let mut report = Report::new();
            auto_maintain(&self.dir, &self.maintenance, &mut report)?;
            if !report.is_clean() {
                warn!(problems = report.problems.len(), "pack: maintenance reported problems");
            }
        }
        Ok(std::mem::take(&mut self.finished))
    }

    /// Discard the open pack. Sealed packs stay.
    pub fn abort(mut self) {
        if let Some(pack) = self.current.take() {
            info!(objects = pack.idx.len(), "pack: aborted");
        }
        self.closed = true;
    }
}

fn deflate(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    enc.write_all(data)?;
    enc.finish()
}

impl ObjectWriter for PackWriter {
    fn write(&mut self, kind: ObjectKind, data: &[u8]) -> StoreResult<Oid> {
        Ok(self.write_object(kind, data)?)
    }

    fn exists(&mut self, id: &Oid) -> StoreResult<bool> {
        Ok(self.contains(id)?)
    }
}

impl Drop for PackWriter {
    fn drop(&mut self) {
        if !self.closed && self.pending() > 0 {
            warn!(
                objects = self.pending(),
                "pack writer dropped without close; discarding open pack"
            );
        }
    }
}

impl std::fmt::Debug for PackWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackWriter")
            .field("dir", &self.dir)
            .field("pending", &self.pending())
            .field("finished", &self.finished.len())
            .finish()
    }
}
