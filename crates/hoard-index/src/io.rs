//! Binary I/O helpers shared by every index format.
//!
//! - big-endian field access on mapped bytes
//! - [`MappedFile`]: a memory map owned together with its file, unmapped on
//!   drop, in one of three [`MapMode`]s
//! - [`AtomicFile`]: write to a temporary file beside the destination, fsync,
//!   and rename into place; dropped before [`AtomicFile::commit`] it deletes
//!   the temporary
//! - [`HashingWriter`]: a writer that SHA-1s everything passing through it
//! - [`OidTable`]: a contiguous table of 20-byte object ids

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use hoard_types::{Oid, OID_LEN};
use memmap2::{Mmap, MmapMut, MmapOptions};
use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{IndexError, IndexResult, IoContext};

// ---------------------------------------------------------------------------
// Field access
// ---------------------------------------------------------------------------

#[inline]
pub fn be_u16(buf: &[u8], ofs: usize) -> u16 {
    u16::from_be_bytes([buf[ofs], buf[ofs + 1]])
}

#[inline]
pub fn be_u32(buf: &[u8], ofs: usize) -> u32 {
    u32::from_be_bytes([buf[ofs], buf[ofs + 1], buf[ofs + 2], buf[ofs + 3]])
}

#[inline]
pub fn be_u64(buf: &[u8], ofs: usize) -> u64 {
    (u64::from(be_u32(buf, ofs)) << 32) | u64::from(be_u32(buf, ofs + 4))
}

/// Split a NUL-joined name list. An empty region is an empty list.
pub fn split_names(region: &[u8]) -> Vec<String> {
    if region.is_empty() {
        return Vec::new();
    }
    region
        .split(|&b| b == 0)
        .filter(|n| !n.is_empty())
        .map(|n| String::from_utf8_lossy(n).into_owned())
        .collect()
}

/// Fail with [`IndexError::Truncated`] when `buf` is shorter than `needed`.
pub fn require_len(path: &Path, buf: &[u8], needed: u64) -> IndexResult<()> {
    if (buf.len() as u64) < needed {
        return Err(IndexError::Truncated {
            path: path.to_path_buf(),
            expected: needed,
            actual: buf.len() as u64,
        });
    }
    Ok(())
}

/// Fail with [`IndexError::InvalidMagic`] unless `buf` starts with `magic`.
pub fn require_magic(path: &Path, buf: &[u8], magic: &[u8]) -> IndexResult<()> {
    require_len(path, buf, magic.len() as u64)?;
    if &buf[..magic.len()] != magic {
        return Err(IndexError::InvalidMagic {
            path: path.to_path_buf(),
            expected: magic.to_vec(),
            found: buf[..magic.len()].to_vec(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// OidTable
// ---------------------------------------------------------------------------

/// A sorted run of 20-byte object ids inside a mapped file.
#[derive(Clone, Copy, Debug)]
pub struct OidTable<'a> {
    raw: &'a [u8],
}

impl<'a> OidTable<'a> {
    /// `raw` must be a whole number of ids long; any trailing partial id is ignored.
    pub fn new(raw: &'a [u8]) -> Self {
        let whole = raw.len() - raw.len() % OID_LEN;
        Self { raw: &raw[..whole] }
    }

    pub fn len(&self) -> usize {
        self.raw.len() / OID_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    #[inline]
    pub fn bytes(&self, i: usize) -> &'a [u8] {
        &self.raw[i * OID_LEN..(i + 1) * OID_LEN]
    }

    pub fn get(&self, i: usize) -> Oid {
        let mut id = [0u8; OID_LEN];
        id.copy_from_slice(self.bytes(i));
        Oid::from_hash(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = Oid> + 'a {
        let table = *self;
        (0..table.len()).map(move |i| table.get(i))
    }
}

// ---------------------------------------------------------------------------
// MappedFile
// ---------------------------------------------------------------------------

/// How a [`MappedFile`] maps its file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapMode {
    ReadOnly,
    /// Writes go to the file's pages directly; [`MappedFile::flush`] syncs them.
    Shared,
    /// Copy-on-write. Writes stay in memory until [`MappedFile::flush`]
    /// writes the whole image back to the file.
    Private,
}

enum Mapping {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

/// A memory map, plus the file behind it for the writable modes.
///
/// A read-only map closes its file as soon as the mapping exists, so holding
/// many maps does not hold as many descriptors.
pub struct MappedFile {
    path: PathBuf,
    file: Option<File>,
    map: Mapping,
    mode: MapMode,
}

impl MappedFile {
    pub fn open(path: &Path, mode: MapMode) -> IndexResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(mode != MapMode::ReadOnly)
            .open(path)
            .at(path)?;
        Self::from_file(file, path, mode)
    }

    /// Map an already open file; writable modes need it opened read-write.
    pub fn from_file(file: File, path: &Path, mode: MapMode) -> IndexResult<Self> {
        // SAFETY: index files are published by rename and never rewritten in
        // place, except a bloom filter by its single owning writer, so the
        // mapped bytes do not change underneath us.
        let map = unsafe {
            match mode {
                MapMode::ReadOnly => Mmap::map(&file).map(Mapping::ReadOnly),
                MapMode::Shared => MmapMut::map_mut(&file).map(Mapping::Writable),
                MapMode::Private => MmapOptions::new().map_copy(&file).map(Mapping::Writable),
            }
        }
        .at(path)?;
        debug!(path = %path.display(), ?mode, "mapped file");
        let file = (mode != MapMode::ReadOnly).then_some(file);
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            mode,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> MapMode {
        self.mode
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            Mapping::ReadOnly(m) => m,
            Mapping::Writable(m) => m,
        }
    }

    /// Mutable view of the mapping, or `None` for a read-only map.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match &mut self.map {
            Mapping::ReadOnly(_) => None,
            Mapping::Writable(m) => Some(m),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the mapped contents durable in the file.
    pub fn flush(&mut self) -> IndexResult<()> {
        match (&self.map, self.mode) {
            (Mapping::Writable(m), MapMode::Shared) => m.flush().at(&self.path),
            (Mapping::Writable(m), MapMode::Private) => {
                let file = self.file.as_mut().ok_or_else(|| {
                    IndexError::InvalidArgument(format!("{}: no file behind map", self.path.display()))
                })?;
                file.seek(SeekFrom::Start(0)).at(&self.path)?;
                file.write_all(m).at(&self.path)?;
                file.flush().at(&self.path)
            }
            _ => Ok(()),
        }
    }

    /// The underlying file, for writes past the end of the mapping. `None`
    /// for a read-only map, whose file is closed once mapped.
    pub fn file_mut(&mut self) -> Option<&mut File> {
        self.file.as_mut()
    }
}

// ---------------------------------------------------------------------------
// Atomic replacement
// ---------------------------------------------------------------------------

/// Create a temporary file in the directory that will hold `dest`.
pub fn temp_file_beside(dest: &Path) -> IndexResult<NamedTempFile> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    tempfile::Builder::new()
        .prefix(".hoard-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .at(dir)
}

/// fsync `tmp` and rename it to `dest`.
pub fn persist(tmp: NamedTempFile, dest: &Path) -> IndexResult<()> {
    tmp.as_file().sync_all().at(tmp.path())?;
    tmp.persist(dest).map_err(|e| IndexError::io(dest, e.error))?;
    debug!(path = %dest.display(), "published");
    Ok(())
}

/// A buffered writer whose output only appears at `dest` once committed.
pub struct AtomicFile {
    dest: PathBuf,
    inner: BufWriter<NamedTempFile>,
}

impl AtomicFile {
    pub fn create(dest: &Path) -> IndexResult<Self> {
        let tmp = temp_file_beside(dest)?;
        Ok(Self {
            dest: dest.to_path_buf(),
            inner: BufWriter::new(tmp),
        })
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Flush, fsync, and rename into place.
    pub fn commit(self) -> IndexResult<PathBuf> {
        let Self { dest, inner } = self;
        let tmp = inner
            .into_inner()
            .map_err(|e| IndexError::io(&dest, e.into_error()))?;
        persist(tmp, &dest)?;
        Ok(dest)
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for AtomicFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

// ---------------------------------------------------------------------------
// HashingWriter
// ---------------------------------------------------------------------------

/// Passes writes through to `inner` while hashing them.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha1,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
            written: 0,
        }
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.written
    }

    /// The digest of everything written so far, without consuming the writer.
    pub fn digest(&self) -> [u8; OID_LEN] {
        self.hasher.clone().finalize().into()
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_parts(self) -> (W, [u8; OID_LEN]) {
        (self.inner, self.hasher.finalize().into())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
