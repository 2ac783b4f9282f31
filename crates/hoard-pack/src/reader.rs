use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::bufread::ZlibDecoder;
use hoard_index::PackIdx;
use hoard_store::{ObjectReader, StoreResult, StoredObject};
use hoard_types::{Oid, OID_LEN};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::entry::{decode_header, MAX_ENTRY_HEADER_LEN, PACK_HEADER_LEN, PACK_MAGIC, PACK_VERSION};
use crate::error::{IoContext, PackError, PackResult};

/// Random access to the objects of one pack through its idx.
#[derive(Debug)]
pub struct PackReader {
    path: PathBuf,
    file: File,
    idx: PackIdx,
}

impl PackReader {
    /// Open `pack-<sha>.pack` and the `.idx` beside it.
    pub fn open(pack_path: &Path) -> PackResult<Self> {
        let mut file = File::open(pack_path).at(pack_path)?;
        let mut header = [0u8; PACK_HEADER_LEN];
        file.read_exact(&mut header).at(pack_path)?;
        if &header[..4] != PACK_MAGIC {
            return Err(PackError::InvalidMagic {
                path: pack_path.to_path_buf(),
                found: header[..4].to_vec(),
            });
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != PACK_VERSION {
            return Err(PackError::UnsupportedVersion {
                path: pack_path.to_path_buf(),
                version,
            });
        }
        let count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        let idx = PackIdx::open(&pack_path.with_extension("idx"))?;
        if count as usize != idx.len() {
            return Err(PackError::corrupt(
                8,
                format!("pack holds {count} objects, idx lists {}", idx.len()),
            ));
        }
        debug!(pack = %pack_path.display(), objects = count, "opened pack");
        Ok(Self {
            path: pack_path.to_path_buf(),
            file,
            idx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn idx(&self) -> &PackIdx {
        &self.idx
    }

    pub fn len(&self) -> usize {
        self.idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx.is_empty()
    }

    pub fn contains(&self, oid: &Oid) -> bool {
        self.idx.exists(oid)
    }

    pub fn read_object(&mut self, oid: &Oid) -> PackResult<Option<StoredObject>> {
        let Some(pos) = self.idx.lookup(oid).found else {
            return Ok(None);
        };
        let offset = self.idx.offset_at(pos)?;
        let crc = self.idx.crc_at(pos);
        self.read_at(oid, offset, crc).map(Some)
    }

    /// Inflate the entry at `offset`, then check its CRC and its id.
    fn read_at(&mut self, oid: &Oid, offset: u64, crc: u32) -> PackResult<StoredObject> {
        let path = self.path.clone();
        self.file.seek(SeekFrom::Start(offset)).at(&path)?;
        let mut reader = BufReader::new(&mut self.file);
        let mut header = Vec::with_capacity(MAX_ENTRY_HEADER_LEN);
        loop {
            let mut byte = [0u8; 1];
            reader.read_exact(&mut byte).at(&path)?;
            header.push(byte[0]);
            if byte[0] & 0x80 == 0 || header.len() >= MAX_ENTRY_HEADER_LEN {
                break;
            }
        }
        let (kind, size, _) = decode_header(&header, offset)?;

        let mut decoder = ZlibDecoder::new(reader);
        let mut data = Vec::with_capacity(size.min(1 << 24) as usize);
        decoder
            .read_to_end(&mut data)
            .map_err(|e| PackError::corrupt(offset, format!("inflate failed: {e}")))?;
        if data.len() as u64 != size {
            return Err(PackError::corrupt(
                offset,
                format!("inflated to {} bytes, header says {size}", data.len()),
            ));
        }
        let entry_len = header.len() as u64 + decoder.total_in();
        drop(decoder);

        let mut raw = vec![0u8; entry_len as usize];
        self.file.seek(SeekFrom::Start(offset)).at(&path)?;
        self.file.read_exact(&mut raw).at(&path)?;
        if crc32fast::hash(&raw) != crc {
            return Err(PackError::CrcMismatch { id: *oid, offset });
        }

        let obj = StoredObject::new(kind, data);
        let computed = obj.compute_id();
        if computed != *oid {
            return Err(PackError::HashMismatch {
                expected: *oid,
                computed,
            });
        }
        Ok(obj)
    }

    /// Recompute the trailing SHA-1 and compare it with the trailer and
    /// with the checksum recorded in the idx.
    pub fn verify_checksum(&mut self) -> PackResult<()> {
        let path = self.path.clone();
        let len = self.file.metadata().at(&path)?.len();
        if len < (PACK_HEADER_LEN + OID_LEN) as u64 {
            return Err(PackError::ChecksumMismatch { path });
        }
        self.file.seek(SeekFrom::Start(0)).at(&path)?;
        let mut hasher = Sha1::new();
        std::io::copy(&mut (&mut self.file).take(len - OID_LEN as u64), &mut hasher).at(&path)?;
        let mut trailer = [0u8; OID_LEN];
        self.file.read_exact(&mut trailer).at(&path)?;
        if hasher.finalize().as_slice() != trailer || trailer != self.idx.pack_checksum() {
            return Err(PackError::ChecksumMismatch { path });
        }
        Ok(())
    }
}

impl ObjectReader for PackReader {
    fn read(&mut self, id: &Oid) -> StoreResult<Option<StoredObject>> {
        Ok(self.read_object(id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackConfig;
    use crate::writer::PackWriter;
    use hoard_index::MaintenanceConfig;
    use hoard_types::ObjectKind;

    fn one_pack(dir: &Path, payloads: &[&[u8]]) -> (PathBuf, Vec<Oid>) {
        let maintenance = MaintenanceConfig {
            auto_after_write: false,
            ..Default::default()
        };
        let mut w = PackWriter::new(dir, PackConfig::default(), maintenance).unwrap();
        let ids = payloads
            .iter()
            .map(|p| w.write_object(ObjectKind::Blob, p).unwrap())
            .collect();
        let idx = w.close().unwrap().remove(0);
        (idx.with_extension("pack"), ids)
    }

    #[test]
    fn absent_object_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let (pack, _) = one_pack(dir.path(), &[b"a"]);
        let mut r = PackReader::open(&pack).unwrap();
        assert!(r.read_object(&Oid::null()).unwrap().is_none());
        assert!(!r.contains(&Oid::null()));
    }

    #[test]
    fn flipped_payload_byte_is_caught() {
        let dir = tempfile::tempdir().unwrap();
        let (pack, ids) = one_pack(dir.path(), &[&[1u8; 4096]]);
        let mut bytes = std::fs::read(&pack).unwrap();
        let mid = 12 + (bytes.len() - 32) / 2;
        bytes[mid] ^= 0x40;
        std::fs::write(&pack, &bytes).unwrap();

        let mut r = PackReader::open(&pack).unwrap();
        assert!(r.read_object(&ids[0]).is_err());
        assert!(matches!(
            r.verify_checksum(),
            Err(PackError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn bad_magic_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let (pack, _) = one_pack(dir.path(), &[b"a", b"b"]);
        let good = std::fs::read(&pack).unwrap();

        let mut bad = good.clone();
        bad[0] = b'K';
        std::fs::write(&pack, &bad).unwrap();
        assert!(matches!(
            PackReader::open(&pack),
            Err(PackError::InvalidMagic { .. })
        ));

        let mut bad = good.clone();
        bad[11] = 9;
        std::fs::write(&pack, &bad).unwrap();
        assert!(matches!(
            PackReader::open(&pack),
            Err(PackError::CorruptEntry { offset: 8, .. })
        ));
    }

    #[test]
    fn serves_as_object_reader() {
        let dir = tempfile::tempdir().unwrap();
        let (pack, ids) = one_pack(dir.path(), &[b"one", b"two"]);
        let mut r = PackReader::open(&pack).unwrap();
        let obj = r.read_required(&ids[1]).unwrap();
        assert_eq!(obj.data, b"two");
        obj.verify(&ids[1]).unwrap();
    }
}
