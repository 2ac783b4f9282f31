use serde::{Deserialize, Serialize};

use crate::error::{PackError, PackResult};

/// Limits for packs produced by [`PackWriter`](crate::PackWriter).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// zlib level, 0 to 9.
    pub compression_level: u32,
    /// Start a new pack once the current one reaches this many bytes.
    pub max_pack_size: u64,
    /// Start a new pack once the current one holds this many objects.
    pub max_pack_objects: usize,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            compression_level: 1,
            max_pack_size: 1000 * 1000 * 1000,
            max_pack_objects: 200 * 1000,
        }
    }
}

impl PackConfig {
    pub fn validate(&self) -> PackResult<()> {
        if self.compression_level > 9 {
            return Err(PackError::InvalidConfig(format!(
                "compression_level must be 0..=9, got {}",
                self.compression_level
            )));
        }
        if self.max_pack_objects == 0 || u32::try_from(self.max_pack_objects).is_err() {
            return Err(PackError::InvalidConfig(format!(
                "max_pack_objects out of range: {}",
                self.max_pack_objects
            )));
        }
        if self.max_pack_size == 0 {
            return Err(PackError::InvalidConfig("max_pack_size must be positive".into()));
        }
        Ok(())
    }
}
