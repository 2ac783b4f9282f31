//! Fixtures shared by the unit tests.

use std::path::{Path, PathBuf};

use hoard_types::{Oid, OID_LEN};
use rand::{rngs::StdRng, RngCore, SeedableRng};

use crate::idx::IdxWriter;

pub fn random_oids(n: usize, seed: u64) -> Vec<Oid> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let mut b = [0u8; OID_LEN];
            rng.fill_bytes(&mut b);
            Oid::from_hash(b)
        })
        .collect()
}

/// Write an idx listing `oids` at made-up offsets.
pub fn write_idx(path: &Path, oids: &[Oid]) -> PathBuf {
    let mut w = IdxWriter::new();
    for (i, oid) in oids.iter().enumerate() {
        w.add(*oid, i as u32, i as u64 * 100);
    }
    w.write(path, &[0; OID_LEN]).unwrap()
}

/// `pack-<n>.idx` in `dir` holding `count` random ids.
pub fn random_idx(dir: &Path, n: u64, count: usize) -> (PathBuf, Vec<Oid>) {
    let oids = random_oids(count, n);
    let path = write_idx(&dir.join(format!("pack-{n:04}.idx")), &oids);
    (path, oids)
}
