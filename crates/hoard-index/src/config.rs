use serde::{Deserialize, Serialize};

use crate::bloom::{max_bloom_bits, MAX_PFALSE_POSITIVE};
use crate::error::{IndexError, IndexResult};

/// Fewest inputs a midx merge may be split into.
pub const MIN_MAX_FILES: usize = 5;

/// Thresholds for the bloom and midx maintenance passes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Rebuild the bloom filter rather than let its estimated false-positive
    /// rate (percent) climb past this.
    pub max_pfalse_positive: f64,
    /// Hash count for new bloom filters; `None` picks by table size.
    pub bloom_k: Option<u32>,
    /// Merge once a pack directory holds more idx/midx files than this.
    pub high_water_mark: usize,
    /// Merge down to this many files.
    pub low_water_mark: usize,
    /// Largest number of inputs to a single midx.
    pub max_files: usize,
    /// Run midx and bloom maintenance whenever a pack is finished.
    pub auto_after_write: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            max_pfalse_positive: MAX_PFALSE_POSITIVE,
            bloom_k: None,
            high_water_mark: 5,
            low_water_mark: 2,
            max_files: 500,
            auto_after_write: true,
        }
    }
}

impl MaintenanceConfig {
    pub fn validate(&self) -> IndexResult<()> {
        if let Some(k) = self.bloom_k {
            if max_bloom_bits(k).is_none() {
                return Err(IndexError::InvalidArgument(format!(
                    "bloom_k must be 4 or 5, got {k}"
                )));
            }
        }
        if self.max_files < MIN_MAX_FILES {
            return Err(IndexError::InvalidArgument(format!(
                "max_files must be at least {MIN_MAX_FILES}, got {}",
                self.max_files
            )));
        }
        if self.low_water_mark == 0 || self.low_water_mark > self.high_water_mark {
            return Err(IndexError::InvalidArgument(format!(
                "need 0 < low_water_mark <= high_water_mark, got {} and {}",
                self.low_water_mark, self.high_water_mark
            )));
        }
        if self.max_pfalse_positive.is_nan() || self.max_pfalse_positive <= 0.0 {
            return Err(IndexError::InvalidArgument(
                "max_pfalse_positive must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Water marks for a merge; forcing merges everything into one file.
    pub fn water_marks(&self, force: bool) -> (usize, usize) {
        if force {
            (1, 1)
        } else {
            (self.high_water_mark, self.low_water_mark)
        }
    }
}
