use anyhow::Result;
use clap::Parser;

use crate::opts::ConfigOpts;

#[derive(Debug, Parser)]
/// The options for the `ofs-loader cache` subcommand
pub struct Cache {
    #[clap(flatten)]
    config: ConfigOpts,

    /// The operation to perform.
    #[clap(subcommand)]
    cmd: Cmd,
}

impl Cache {
    /// Execute the cache command
    pub fn execute(&self) -> Result<()> {
        let config = self.config.load()?;

        match self.cmd {
            Cmd::Clean => {
                let removed = ofs_loader::cache::clean(&config.cache_dir, &config.artifact_prefix)?;
                eprintln!("Removed {removed} cached file(s).");
            }
            Cmd::Dir => {
                println!("{}", config.cache_dir.display());
            }
        }

        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Parser)]
enum Cmd {
    /// Remove every cached artifact, keeping the lock files
    Clean,
    /// Display the location of the cache
    Dir,
}
