use std::path::PathBuf;

use anyhow::{Context, Result};
use ofs_loader::LoaderConfig;

/// Where to find the loader configuration.
#[derive(Debug, Clone, clap::Parser)]
pub struct ConfigOpts {
    /// Path to the loader's TOML configuration file
    #[clap(long, short = 'c', env = "OFS_LOADER_CONFIG")]
    config: PathBuf,

    /// Use this cache directory instead of the configured one
    #[clap(long, env = "OFS_LOADER_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
}

impl ConfigOpts {
    pub fn load(&self) -> Result<LoaderConfig> {
        let mut config = LoaderConfig::from_file(&self.config)
            .with_context(|| format!("Unable to load \"{}\"", self.config.display()))?;

        if let Some(cache_dir) = &self.cache_dir {
            config.cache_dir = cache_dir.clone();
            config = config.validate()?;
        }

        Ok(config)
    }
}
