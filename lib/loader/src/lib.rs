//! Resolve a mount point to the plugin version that serves it, fetch and
//! verify that plugin through a cache shared by every process on the host,
//! and load it into the current process.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ofs_loader::{
//!     DylibLoader, InstanceLoader, LoaderConfig, Orchestrator, http::ReqwestHttpClient,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let config = LoaderConfig::from_file("/etc/ofs/loader.toml")?;
//! let client = ReqwestHttpClient::new(config.connect_timeout)?;
//! let instances = Arc::new(InstanceLoader::new(DylibLoader));
//!
//! let orchestrator = Orchestrator::new(config, Arc::new(client), instances);
//! let mut fs = orchestrator.resolve("examplebucket-1250000000")?;
//! fs.initialize("ofs://examplebucket-1250000000/")?;
//! # Ok(())
//! # }
//! ```

#![warn(unused_import_braces)]

pub mod cache;
pub mod checksum;
pub mod config;
pub mod endpoint;
mod error;
pub mod http;
pub mod loader;
pub mod metadata;
pub mod mount;
mod orchestrator;
pub mod retry;

pub use crate::{
    cache::{ArtifactCache, CachedArtifact, DownloadTarget},
    checksum::Checksum,
    config::{LoaderConfig, RetryConfig},
    endpoint::{AddressLookup, DnsLookup, EndpointResolver, IndirectEndpoint, LiteralEndpoint},
    error::{BoxError, ConfigError, InitError, ResolveError},
    loader::{
        Constructor, DylibLoader, FileSystemImpl, ImplementationHandle, InstanceLoader,
        ModuleLoader, ModuleScope, StaticRegistry, entry_name, into_exported,
    },
    metadata::{ArtifactDescriptor, ClientContext, MetadataFetcher},
    orchestrator::{Orchestrator, Stage},
    retry::RetryPolicy,
};
