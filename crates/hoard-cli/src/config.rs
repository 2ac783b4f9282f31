use std::path::{Path, PathBuf};

use anyhow::Context;
use hoard_index::MaintenanceConfig;
use hoard_pack::PackConfig;
use hoard_split::SplitConfig;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "hoard.toml";

/// Per-repository settings, read from `<repo>/hoard.toml`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub split: SplitConfig,
    pub pack: PackConfig,
    pub maintenance: MaintenanceConfig,
}

impl RepoConfig {
    /// Load the repository's config, falling back to defaults when the file
    /// does not exist.
    pub fn load(repo: &Path) -> anyhow::Result<Self> {
        let path = repo.join(CONFIG_FILE_NAME);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.validate().with_context(|| format!("in {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.split.validate()?;
        self.pack.validate()?;
        self.maintenance.validate()?;
        Ok(())
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Directory holding packs and their indexes.
pub fn pack_dir(repo: &Path) -> PathBuf {
    repo.join("objects").join("pack")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(RepoConfig::load(dir.path()).unwrap(), RepoConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[split]\nbits = 15\n\n[maintenance]\nmax_files = 50\n",
        )
        .unwrap();
        let c = RepoConfig::load(dir.path()).unwrap();
        assert_eq!(c.split.bits, 15);
        assert_eq!(c.split.fanout, SplitConfig::default().fanout);
        assert_eq!(c.maintenance.max_files, 50);
        assert_eq!(c.pack, PackConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[split]\nbits = 40\n").unwrap();
        assert!(RepoConfig::load(dir.path()).is_err());
    }

    #[test]
    fn written_defaults_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let text = RepoConfig::default().to_toml().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), text).unwrap();
        assert_eq!(RepoConfig::load(dir.path()).unwrap(), RepoConfig::default());
    }
}
