use serde::{Deserialize, Serialize};

use crate::error::{SplitError, SplitResult};

/// Smallest accepted split threshold.
pub const MIN_BITS: u32 = 13;
/// Largest accepted split threshold.
pub const MAX_BITS: u32 = 21;
/// Average chunk of 8 KiB.
pub const DEFAULT_BITS: u32 = 13;
pub const DEFAULT_FANOUT: u32 = 16;
/// Entries per tree before a grouping is closed regardless of level.
pub const MAX_PER_TREE: usize = 256;

/// Chunking parameters.
///
/// **Changing any of these changes every chunk boundary**, so a repository
/// should keep the values it was first written with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Checksum bits that must match to end a chunk.
    pub bits: u32,
    /// Tree fanout; each `log2(fanout)` extra matching bits raise a boundary one level.
    pub fanout: u32,
    /// Never let a chunk span two inputs.
    pub keep_boundaries: bool,
    pub max_per_tree: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            bits: DEFAULT_BITS,
            fanout: DEFAULT_FANOUT,
            keep_boundaries: false,
            max_per_tree: MAX_PER_TREE,
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> SplitResult<()> {
        if !(MIN_BITS..=MAX_BITS).contains(&self.bits) {
            return Err(SplitError::InvalidBits {
                bits: self.bits,
                min: MIN_BITS,
                max: MAX_BITS,
            });
        }
        if self.fanout < 2 || !self.fanout.is_power_of_two() {
            return Err(SplitError::InvalidFanout(self.fanout));
        }
        if self.max_per_tree < 2 {
            return Err(SplitError::InvalidTreeSize(self.max_per_tree));
        }
        Ok(())
    }

    /// `log2(fanout)`.
    pub fn fanbits(&self) -> u32 {
        self.fanout.trailing_zeros()
    }

    /// Hard ceiling on a chunk's size: four times the average.
    pub fn blob_max(&self) -> usize {
        1 << (self.bits + 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SplitConfig::default();
        config.validate().unwrap();
        assert_eq!(config.fanbits(), 4);
        assert_eq!(config.blob_max(), 32768);
    }

    #[test]
    fn rejects_out_of_range_bits() {
        for bits in [0, 12, 22] {
            let config = SplitConfig {
                bits,
                ..Default::default()
            };
            assert!(matches!(
                config.validate(),
                Err(SplitError::InvalidBits { .. })
            ));
        }
    }

    #[test]
    fn rejects_bad_fanout() {
        for fanout in [0, 1, 3, 12] {
            let config = SplitConfig {
                fanout,
                ..Default::default()
            };
            assert!(matches!(
                config.validate(),
                Err(SplitError::InvalidFanout(_))
            ));
        }
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: SplitConfig = toml::from_str("bits = 16").unwrap();
        assert_eq!(config.bits, 16);
        assert_eq!(config.fanout, DEFAULT_FANOUT);
        assert_eq!(config.blob_max(), 1 << 18);
    }
}
