use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use ofs_loader::{InstanceLoader, Orchestrator, StaticRegistry, http::ReqwestHttpClient};

use crate::opts::ConfigOpts;

/// Show which plugin version the metadata service currently hands out for a
/// mount point, without downloading it.
#[derive(Debug, Parser)]
pub struct Describe {
    #[clap(flatten)]
    config: ConfigOpts,

    /// The mount point's host name (e.g. `examplebucket-1250000000`)
    mount_point: String,
}

impl Describe {
    pub fn execute(&self) -> Result<()> {
        let config = self.config.load()?;
        let client = ReqwestHttpClient::new(config.connect_timeout)?;
        // Nothing gets loaded, so an empty registry will do
        let instances = Arc::new(InstanceLoader::new(StaticRegistry::new()));
        let orchestrator = Orchestrator::new(config, Arc::new(client), instances);

        let descriptor = orchestrator.describe(&self.mount_point)?;
        let local_path = orchestrator.cache().artifact_path(&descriptor.version_id);

        let summary = serde_json::json!({
            "version_id": descriptor.version_id,
            "download_url": descriptor.download_url,
            "checksum": descriptor.expected_checksum.to_string(),
            "local_path": local_path.display().to_string(),
            "cached": local_path.exists(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);

        Ok(())
    }
}
