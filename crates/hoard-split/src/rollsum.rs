//! Rolling checksum over a 64-byte window.
//!
//! Two running sums in the style of rsync's weak checksum, with every byte
//! offset by a constant so runs of zeros still perturb `s2`. The state after
//! any input depends only on the last [`WINDOW_SIZE`] bytes, and a window of
//! zeros is the initial state, so a zero prefix never moves a boundary.

/// Bytes in the trailing window.
pub const WINDOW_SIZE: usize = 64;

const CHAR_OFFSET: u32 = 31;

/// Rolling checksum state.
#[derive(Clone, Debug)]
pub struct Rollsum {
    s1: u32,
    s2: u32,
    window: [u8; WINDOW_SIZE],
    wofs: usize,
}

impl Default for Rollsum {
    fn default() -> Self {
        Self::new()
    }
}

impl Rollsum {
    pub fn new() -> Self {
        let n = WINDOW_SIZE as u32;
        Self {
            s1: n * CHAR_OFFSET,
            s2: n * (n - 1) * CHAR_OFFSET,
            window: [0; WINDOW_SIZE],
            wofs: 0,
        }
    }

    #[inline]
    fn add(&mut self, drop: u8, add: u8) {
        self.s1 = self.s1.wrapping_add(u32::from(add)).wrapping_sub(u32::from(drop));
        self.s2 = self
            .s2
            .wrapping_add(self.s1)
            .wrapping_sub(WINDOW_SIZE as u32 * (u32::from(drop) + CHAR_OFFSET));
    }

    /// Push one byte into the window, dropping the oldest.
    #[inline]
    pub fn roll(&mut self, ch: u8) {
        let drop = self.window[self.wofs];
        self.add(drop, ch);
        self.window[self.wofs] = ch;
        self.wofs = (self.wofs + 1) % WINDOW_SIZE;
    }

    #[inline]
    pub fn digest(&self) -> u32 {
        (self.s1 << 16) | (self.s2 & 0xffff)
    }

    /// Checksum of `data` from a fresh state.
    pub fn sum(data: &[u8]) -> u32 {
        let mut r = Self::new();
        data.iter().for_each(|&b| r.roll(b));
        r.digest()
    }
}

/// Find the first chunk boundary in `buf`.
///
/// Returns the length of the chunk (boundary offset, exclusive) and the
/// number of extra matching bits beyond `bits`. Those are counted from the
/// digest shifted right by `bits`, skipping its lowest bit, as consecutive
/// trailing ones.
pub fn find_split(buf: &[u8], bits: u32) -> Option<(usize, u32)> {
    let mask = (1u32 << bits) - 1;
    let mut r = Rollsum::new();
    for (i, &b) in buf.iter().enumerate() {
        r.roll(b);
        let digest = r.digest();
        if digest & mask == mask {
            let extra = ((digest >> bits) >> 1).trailing_ones();
            return Some((i + 1, extra));
        }
    }
    None
}
