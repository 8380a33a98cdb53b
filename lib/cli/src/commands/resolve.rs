use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ofs_loader::{DylibLoader, InstanceLoader, Orchestrator, http::ReqwestHttpClient};

use crate::opts::ConfigOpts;

/// Resolve a mount point to its plugin, downloading and loading it.
#[derive(Debug, Parser)]
pub struct Resolve {
    #[clap(flatten)]
    config: ConfigOpts,

    /// The mount point's host name (e.g. `examplebucket-1250000000`)
    mount_point: String,

    /// Also initialize the loaded plugin against `ofs://<mount point>/`
    #[clap(long)]
    initialize: bool,
}

impl Resolve {
    pub fn execute(&self) -> Result<()> {
        let config = self.config.load()?;
        let client = ReqwestHttpClient::new(config.connect_timeout)?;
        let instances = Arc::new(InstanceLoader::new(DylibLoader));
        let orchestrator = Orchestrator::new(config, Arc::new(client), instances);

        let mut handle = orchestrator.resolve(&self.mount_point)?;

        if self.initialize {
            let uri = format!("ofs://{}/", self.mount_point);
            handle
                .initialize(&uri)
                .map_err(|e| anyhow::anyhow!(e))
                .with_context(|| format!("Unable to initialize the plugin for \"{uri}\""))?;
        }

        let descriptor = handle.descriptor();
        println!("version: {}", descriptor.version_id);
        println!(
            "path: {}",
            orchestrator
                .cache()
                .artifact_path(&descriptor.version_id)
                .display()
        );
        println!("entry: {}", handle.entry_name());

        Ok(())
    }
}
