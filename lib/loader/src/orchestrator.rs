use std::{
    fmt::{self, Display},
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

use crate::{
    cache::{ArtifactCache, DownloadTarget},
    config::LoaderConfig,
    endpoint::{AddressLookup, DnsLookup, EndpointResolver, IndirectEndpoint, LiteralEndpoint},
    error::{InitError, ResolveError},
    http::DynHttpClient,
    loader::{ImplementationHandle, InstanceLoader},
    metadata::{ArtifactDescriptor, ClientContext, MetadataFetcher, substitute_authority},
    mount,
};

/// Where a resolution attempt currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ResolvingEndpoint,
    FetchingMetadata,
    CachingArtifact,
    LoadingInstance,
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ResolvingEndpoint => "resolving-endpoint",
            Stage::FetchingMetadata => "fetching-metadata",
            Stage::CachingArtifact => "caching-artifact",
            Stage::LoadingInstance => "loading-instance",
        };
        f.write_str(name)
    }
}

/// Drives a mount point through endpoint resolution, the metadata query, the
/// artifact cache and the instance loader, retrying the whole sequence when
/// something transient goes wrong.
#[derive(Debug)]
pub struct Orchestrator {
    config: LoaderConfig,
    ctx: ClientContext,
    fetcher: MetadataFetcher,
    cache: ArtifactCache,
    instances: Arc<InstanceLoader>,
    lookup: Arc<dyn AddressLookup>,
    in_flight: Mutex<()>,
}

impl Orchestrator {
    pub fn new(config: LoaderConfig, client: DynHttpClient, instances: Arc<InstanceLoader>) -> Self {
        Orchestrator {
            ctx: ClientContext::from_config(&config),
            fetcher: MetadataFetcher::new(Arc::clone(&client), &config),
            cache: ArtifactCache::new(&config, client),
            instances,
            lookup: Arc::new(DnsLookup),
            in_flight: Mutex::new(()),
            config,
        }
    }

    /// Use a different mechanism for resolving symbolic endpoints.
    pub fn with_lookup(mut self, lookup: Arc<dyn AddressLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Find, download, verify and load the plugin serving `mount_point`.
    ///
    /// Only one resolution runs at a time per orchestrator. Callers are
    /// expected to keep the returned handle rather than resolving again.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn resolve(&self, mount_point: &str) -> Result<ImplementationHandle, InitError> {
        let _in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        self.with_retries(|stage| {
            let descriptor = self.current_descriptor(mount_point, stage)?;

            *stage = Stage::CachingArtifact;
            tracing::debug!(%stage, artifact.version = %descriptor.version_id);
            let target = self.download_target(&descriptor)?;
            let cached = self.cache.ensure_cached(&descriptor, &target)?;

            *stage = Stage::LoadingInstance;
            tracing::debug!(%stage, cache.path = %cached.local_path.display());
            self.instances.load(&cached, &descriptor)
        })
    }

    /// Ask the metadata service which artifact `mount_point` would use,
    /// without downloading or loading anything.
    pub fn describe(&self, mount_point: &str) -> Result<ArtifactDescriptor, InitError> {
        self.with_retries(|stage| self.current_descriptor(mount_point, stage))
    }

    fn with_retries<T>(
        &self,
        mut attempt_once: impl FnMut(&mut Stage) -> Result<T, ResolveError>,
    ) -> Result<T, InitError> {
        let policy = self.config.retry.orchestrate;
        let max_attempts = policy.max_attempts();
        let start = Instant::now();

        let mut attempt = 1;
        loop {
            let mut stage = Stage::ResolvingEndpoint;

            match attempt_once(&mut stage) {
                Ok(value) => {
                    tracing::debug!(
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Resolution complete",
                    );
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let progress = format!("{attempt}/{max_attempts}");
                    tracing::warn!(
                        %stage,
                        attempt = %progress,
                        error = &e as &dyn std::error::Error,
                        "Resolution failed, retrying",
                    );
                    policy.pause();
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        %stage,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        error = &e as &dyn std::error::Error,
                        "Resolution failed",
                    );
                    return Err(InitError {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    fn current_descriptor(
        &self,
        mount_point: &str,
        stage: &mut Stage,
    ) -> Result<ArtifactDescriptor, ResolveError> {
        *stage = Stage::ResolvingEndpoint;
        tracing::debug!(%stage, mount_point);
        let endpoint = mount::metadata_endpoint(mount_point, &self.config)?;
        let resolver: Box<dyn EndpointResolver> = match &self.config.meta_indirection {
            Some(name) => Box::new(IndirectEndpoint::new(
                name.as_str(),
                Arc::clone(&self.lookup),
                self.config.retry.resolve,
            )),
            None => Box::new(LiteralEndpoint::from_address(endpoint.address())),
        };
        let address = resolver.resolve()?;

        *stage = Stage::FetchingMetadata;
        tracing::debug!(%stage, %address);
        let descriptor = self
            .fetcher
            .fetch_descriptor(endpoint.scheme(), &address, &self.ctx)?;

        Ok(match &self.config.transfer_endpoint_suffix {
            Some(suffix) => descriptor.with_endpoint_suffix(suffix),
            None => descriptor,
        })
    }

    /// Work out where the download request actually goes. The suffix rewrite
    /// has already happened, so the indirection replaces the rewritten host.
    fn download_target(&self, descriptor: &ArtifactDescriptor) -> Result<DownloadTarget, ResolveError> {
        let Some(name) = &self.config.transfer_indirection else {
            return Ok(DownloadTarget::direct(&descriptor.download_url));
        };

        let address = IndirectEndpoint::new(
            name.as_str(),
            Arc::clone(&self.lookup),
            self.config.retry.resolve,
        )
        .resolve()?;

        Ok(DownloadTarget {
            url: substitute_authority(&descriptor.download_url, &address),
            host_header: self
                .config
                .distinguish_host
                .then(|| descriptor.host_for_routing.clone()),
        })
    }
}
