use std::io::{self, Read};

use tracing::trace;

use crate::config::SplitConfig;
use crate::error::SplitResult;
use crate::rollsum::find_split;

/// Bytes requested from the underlying reader per read call.
pub const READ_BLOCK_SIZE: usize = 1 << 20;

/// One chunk of input and the tree level of the boundary that ended it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub level: u32,
}

/// Lazy, finite, non-restartable splitter over a sequence of readers.
///
/// The readers are treated as one concatenated stream unless
/// [`SplitConfig::keep_boundaries`] is set, in which case the next reader is
/// not opened until everything read from the current one has been emitted.
/// The checksum restarts at the beginning of every chunk.
pub struct HashSplitter<I, R> {
    files: I,
    current: Option<R>,
    buf: Vec<u8>,
    start: usize,
    bits: u32,
    fanbits: u32,
    blob_max: usize,
    keep_boundaries: bool,
    failed: bool,
}

impl<I, R> HashSplitter<I, R>
where
    I: Iterator<Item = R>,
    R: Read,
{
    pub fn new<F>(files: F, config: &SplitConfig) -> SplitResult<Self>
    where
        F: IntoIterator<IntoIter = I, Item = R>,
    {
        config.validate()?;
        Ok(Self {
            files: files.into_iter(),
            current: None,
            buf: Vec::new(),
            start: 0,
            bits: config.bits,
            fanbits: config.fanbits(),
            blob_max: config.blob_max(),
            keep_boundaries: config.keep_boundaries,
            failed: false,
        })
    }

    fn pending(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Read until at least `blob_max` bytes are pending or the input (or, with
    /// boundaries kept, the current file) is exhausted.
    fn fill(&mut self) -> io::Result<()> {
        while self.pending() < self.blob_max {
            if self.current.is_none() {
                if self.keep_boundaries && self.pending() > 0 {
                    return Ok(());
                }
                match self.files.next() {
                    Some(reader) => self.current = Some(reader),
                    None => return Ok(()),
                }
            }

            if self.start > 0 && self.start >= self.buf.len() / 2 {
                self.buf.drain(..self.start);
                self.start = 0;
            }
            let Some(reader) = self.current.as_mut() else {
                continue;
            };
            let old_len = self.buf.len();
            self.buf.resize(old_len + READ_BLOCK_SIZE, 0);
            let n = match reader.read(&mut self.buf[old_len..]) {
                Ok(0) => {
                    trace!("input exhausted");
                    self.buf.truncate(old_len);
                    self.current = None;
                    continue;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(e) => {
                    self.buf.truncate(old_len);
                    return Err(e);
                }
            };
            self.buf.truncate(old_len + n);
        }
        Ok(())
    }

    fn take(&mut self, len: usize, level: u32) -> Chunk {
        let data = self.buf[self.start..self.start + len].to_vec();
        self.start += len;
        Chunk { data, level }
    }
}

impl<I, R> Iterator for HashSplitter<I, R>
where
    I: Iterator<Item = R>,
    R: Read,
{
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Err(e) = self.fill() {
            self.failed = true;
            return Some(Err(e));
        }
        let available = self.pending();
        if available == 0 {
            return None;
        }

        let window_len = available.min(self.blob_max);
        let window = &self.buf[self.start..self.start + window_len];
        let chunk = match find_split(window, self.bits) {
            Some((ofs, extra)) => self.take(ofs, extra / self.fanbits),
            // Either a forced split at the ceiling, or the tail of the
            // input (or of the current file when boundaries are kept).
            None => self.take(window_len, 0),
        };
        Some(Ok(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use crate::testutil::random_bytes;
    use std::io::Cursor;

    fn split_test_obj(ones: u32) -> Vec<u8> {
        let hex = match ones {
            13 => "ded8f1fcf2f45dfadf3458",
            14 => "f287ffeeffe1f0e1fa77b1de1837",
            15 => "878eb7a2e5baf7fcc8fcc58060ccdad5849b6e89",
            16 => "e0e7fdb3e7a579",
            17 => "e2ecf2fdb49f01",
            18 => "caeadffeb1e68b",
            19 => "f1fca9d9bfc9c0",
            20 => "d6e8dbb8d9fec7",
            21 => "7987fcbda4f27759",
            22 => "f4dc926c62617af4",
            23 => "edaef4e7f49fb6",
            24 => "f1f6fef642ae74",
            _ => panic!("no test object for {ones} bits"),
        };
        hex::decode(hex).unwrap()
    }

    fn config(bits: u32, fanout: u32, keep_boundaries: bool) -> SplitConfig {
        SplitConfig {
            bits,
            fanout,
            keep_boundaries,
            ..Default::default()
        }
    }

    fn split_all(inputs: Vec<Vec<u8>>, config: &SplitConfig) -> Vec<Chunk> {
        HashSplitter::new(inputs.into_iter().map(Cursor::new), config)
            .unwrap()
            .collect::<io::Result<Vec<_>>>()
            .unwrap()
    }

    fn shape(chunks: &[Chunk]) -> Vec<(usize, u32)> {
        chunks.iter().map(|c| (c.data.len(), c.level)).collect()
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(split_all(vec![], &SplitConfig::default()).is_empty());
        assert!(split_all(vec![vec![], vec![]], &config(13, 16, true)).is_empty());
    }

    #[test]
    fn fanout_behaviour() {
        for bits in [13, 14, 15] {
            let blob_max = 1usize << (bits + 2);
            let max_blob = || (vec![0u8; blob_max], 0);
            for fanout in [2u32, 4, 16] {
                let fanbits = fanout.trailing_zeros();
                // One bit above the split bits is ignored when counting levels.
                let sb = |pfx: usize, level: u32| {
                    let mut needed = bits + fanbits * level;
                    if level > 0 {
                        needed += 1;
                    }
                    let mut data = vec![0u8; pfx];
                    data.extend(split_test_obj(needed));
                    (data, level)
                };
                let end = |n: usize| (vec![0u8; n], 0);
                let check = |expected: Vec<(Vec<u8>, u32)>| {
                    let data: Vec<u8> = expected.iter().flat_map(|(d, _)| d.clone()).collect();
                    let got = split_all(vec![data], &config(bits, fanout, false));
                    let want: Vec<(usize, u32)> =
                        expected.iter().map(|(d, l)| (d.len(), *l)).collect();
                    assert_eq!(shape(&got), want, "bits {bits} fanout {fanout}");
                };

                check(vec![max_blob(), max_blob(), max_blob(), max_blob()]);
                check(vec![sb(0, 0)]);
                check(vec![sb(13, 1)]);
                check(vec![sb(13, 1), end(200)]);
                if fanout == 2 {
                    check(vec![max_blob(), sb(1, 3), max_blob()]);
                    check(vec![sb(0, 1), sb(30, 2), sb(20, 0), sb(10, 5)]);
                    check(vec![sb(0, 1), sb(30, 2), sb(20, 0), sb(10, 5), end(10)]);
                }
            }
        }
    }

    #[test]
    fn zero_files_split_at_blob_max() {
        let cfg = SplitConfig::default();
        let blob_max = cfg.blob_max();
        let nulls = vec![0u8; blob_max * 10];
        let chunks = split_all(vec![nulls.clone(), nulls.clone(), nulls], &cfg);
        assert_eq!(shape(&chunks), vec![(blob_max, 0); 30]);
    }

    #[test]
    fn split_object_between_zero_files() {
        let cfg = SplitConfig::default();
        let blob_max = cfg.blob_max();
        let nulls = vec![0u8; blob_max * 10];
        let obj = split_test_obj(14);
        let chunks = split_all(vec![nulls.clone(), obj.clone(), nulls], &cfg);
        let mut want = vec![(blob_max, 0); 10];
        want.push((obj.len(), 0));
        want.extend(vec![(blob_max, 0); 10]);
        assert_eq!(shape(&chunks), want);
    }

    #[test]
    fn keep_boundaries_splits_at_each_file() {
        let files = vec![vec![0u8; 8192]; 4];
        let kept = split_all(files.clone(), &config(13, 16, true));
        assert_eq!(shape(&kept), vec![(8192, 0); 4]);

        let joined = split_all(files, &config(13, 16, false));
        assert_eq!(shape(&joined), vec![(32768, 0)]);
    }

    #[test]
    fn read_errors_are_reported_once() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "boom"))
            }
        }
        let mut splitter = HashSplitter::new([Failing], &SplitConfig::default()).unwrap();
        assert!(matches!(splitter.next(), Some(Err(_))));
        assert!(splitter.next().is_none());
    }

    #[test]
    fn insertion_only_disturbs_nearby_boundaries() {
        let cfg = SplitConfig::default();
        let original = random_bytes(1 << 20, 7);
        let mut edited = original.clone();
        edited.splice(500_000..500_000, b"inserted bytes".iter().copied());

        let a = split_all(vec![original], &cfg);
        let b = split_all(vec![edited], &cfg);
        let shared = a.iter().filter(|c| b.contains(c)).count();
        assert!(a.len() > 50);
        assert!(shared >= a.len() - 3, "only {shared} of {} chunks shared", a.len());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn split_is_lossless_bounded_and_deterministic(
            seed in any::<u64>(),
            len in 0usize..300_000,
            keep in any::<bool>(),
            cut in 0usize..300_000,
        ) {
            let cfg = config(13, 16, keep);
            let data = random_bytes(len, seed);
            let cut = cut.min(len);
            let inputs = vec![data[..cut].to_vec(), data[cut..].to_vec()];

            let first = split_all(inputs.clone(), &cfg);
            let second = split_all(inputs, &cfg);
            prop_assert_eq!(&first, &second);

            let rejoined: Vec<u8> = first.iter().flat_map(|c| c.data.iter().copied()).collect();
            prop_assert_eq!(rejoined, data);
            prop_assert!(first.iter().all(|c| c.data.len() <= cfg.blob_max()));
            prop_assert!(first.iter().all(|c| !c.data.is_empty()));
        }
    }
}
