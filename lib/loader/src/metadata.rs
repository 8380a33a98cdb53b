//! Asking the metadata service which plugin version is current.

use std::time::Duration;

use serde_json::Value;
use url::Url;

use crate::{
    checksum::Checksum,
    config::LoaderConfig,
    error::ResolveError,
    http::{DynHttpClient, HttpRequest},
    retry::RetryPolicy,
};

/// Everything needed to fetch and verify one version of the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub version_id: String,
    pub download_url: String,
    /// The `host[:port]` part of `download_url`.
    pub host_for_routing: String,
    pub expected_checksum: Checksum,
}

impl ArtifactDescriptor {
    pub fn new(
        version_id: impl Into<String>,
        download_url: impl Into<String>,
        expected_checksum: Checksum,
    ) -> Self {
        let download_url = download_url.into();
        ArtifactDescriptor {
            version_id: version_id.into(),
            host_for_routing: authority(&download_url).to_string(),
            download_url,
            expected_checksum,
        }
    }

    /// Point the download at `<first label of the host>.<suffix>` over plain
    /// http. See [`rewrite_endpoint_suffix()`].
    pub fn with_endpoint_suffix(self, suffix: &str) -> Self {
        let download_url = rewrite_endpoint_suffix(&self.download_url, suffix);
        ArtifactDescriptor::new(self.version_id, download_url, self.expected_checksum)
    }

    /// Do both descriptors name exactly the same artifact?
    pub fn same_artifact(&self, other: &ArtifactDescriptor) -> bool {
        self.version_id == other.version_id
            && self.download_url == other.download_url
            && self.expected_checksum == other.expected_checksum
    }
}

/// Who is asking. Only used by the server for routing and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    pub appid: u64,
    pub client_version: String,
}

impl ClientContext {
    pub fn from_config(config: &LoaderConfig) -> Self {
        ClientContext {
            appid: config.appid,
            client_version: config.client_version.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetadataFetcher {
    client: DynHttpClient,
    metadata_path: String,
    artifact_kind: String,
    read_timeout: Duration,
    policy: RetryPolicy,
}

impl MetadataFetcher {
    pub fn new(client: DynHttpClient, config: &LoaderConfig) -> Self {
        MetadataFetcher {
            client,
            metadata_path: config.metadata_path.trim_matches('/').to_string(),
            artifact_kind: config.artifact_kind.clone(),
            read_timeout: config.read_timeout,
            policy: config.retry.fetch,
        }
    }

    /// The URL used to ask `address` about the current plugin.
    pub fn query_url(
        &self,
        scheme: &str,
        address: &str,
        ctx: &ClientContext,
    ) -> Result<Url, ResolveError> {
        let raw = format!("{scheme}://{address}/{}", self.metadata_path);
        let mut url = Url::parse(&raw).map_err(|e| ResolveError::MetadataTransport {
            url: raw.clone(),
            source: anyhow::Error::new(e).context("invalid url"),
        })?;

        url.query_pairs_mut()
            .append_pair("appid", &ctx.appid.to_string())
            .append_pair("client_version", &ctx.client_version);

        Ok(url)
    }

    /// Query the metadata endpoint, retrying transport failures a couple of
    /// times before giving up.
    #[tracing::instrument(level = "debug", skip(self, ctx))]
    pub fn fetch_descriptor(
        &self,
        scheme: &str,
        address: &str,
        ctx: &ClientContext,
    ) -> Result<ArtifactDescriptor, ResolveError> {
        let url = self.query_url(scheme, address, ctx)?;
        let attempts = self.policy.max_attempts();

        let mut attempt = 1;
        loop {
            match self.fetch_once(&url) {
                Ok(descriptor) => return Ok(descriptor),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::debug!(
                        %url,
                        attempt,
                        error = &e as &dyn std::error::Error,
                        "Metadata query failed, retrying",
                    );
                    self.policy.pause();
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(%url, error = &e as &dyn std::error::Error, "Metadata query failed");
                    return Err(e);
                }
            }
        }
    }

    fn fetch_once(&self, url: &Url) -> Result<ArtifactDescriptor, ResolveError> {
        let transport = |source: anyhow::Error| ResolveError::MetadataTransport {
            url: url.to_string(),
            source,
        };

        let request = HttpRequest::get(url.as_str())
            .with_header("Connection", "keep-alive")
            .with_read_timeout(self.read_timeout);

        let response = self.client.request(request).map_err(transport)?;

        if !response.is_success() {
            return Err(transport(anyhow::anyhow!(
                "{} {}",
                response.status,
                response.status_text
            )));
        }

        let body = response
            .text()
            .map_err(|e| transport(anyhow::Error::new(e).context("Unable to read the body")))?;

        parse_descriptor(&body, &self.artifact_kind)
    }
}

/// Parse a `{"Response": {"<kind>": {"VersionId", "JarPath", "JarMd5"}}}`
/// body.
pub fn parse_descriptor(body: &str, kind: &str) -> Result<ArtifactDescriptor, ResolveError> {
    let missing = |field: String| ResolveError::MetadataFormat {
        field,
        response: body.to_string(),
    };

    let json: Value = serde_json::from_str(body).map_err(|_| missing("Response".to_string()))?;

    let response = json
        .get("Response")
        .filter(|v| v.is_object())
        .ok_or_else(|| missing("Response".to_string()))?;

    let info = response
        .get(kind)
        .filter(|v| v.is_object())
        .ok_or_else(|| missing(format!("Response.{kind}")))?;

    let field = |name: &str| {
        info.get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| missing(format!("Response.{kind}.{name}")))
    };

    let version_id = field("VersionId")?;
    if !is_valid_version_id(version_id) {
        return Err(missing(format!("Response.{kind}.VersionId")));
    }

    let download_url = field("JarPath")?;
    if Url::parse(download_url).is_err() {
        return Err(missing(format!("Response.{kind}.JarPath")));
    }

    let expected_checksum: Checksum = field("JarMd5")?
        .parse()
        .map_err(|_| missing(format!("Response.{kind}.JarMd5")))?;

    Ok(ArtifactDescriptor::new(
        version_id,
        download_url,
        expected_checksum,
    ))
}

/// Version ids end up in file names and symbol names, so only allow a
/// conservative alphabet.
pub fn is_valid_version_id(version_id: &str) -> bool {
    !version_id.is_empty()
        && version_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        && version_id != "."
        && version_id != ".."
}

/// Replace everything but the first label of a URL's host with `suffix`.
///
/// The endpoints reached this way don't terminate TLS, so the result always
/// uses `http`. An explicit port and everything after the authority are kept
/// as-is.
///
/// ```rust
/// # use ofs_loader::metadata::rewrite_endpoint_suffix;
/// assert_eq!(
///     rewrite_endpoint_suffix("https://a-123.cos.x.myqcloud.com/p", "test.com"),
///     "http://a-123.test.com/p",
/// );
/// ```
pub fn rewrite_endpoint_suffix(url: &str, suffix: &str) -> String {
    let (_, authority, rest) = split_url(url);
    let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let (host, port) = match host.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            (host, format!(":{port}"))
        }
        _ => (host, String::new()),
    };
    let label = host.split('.').next().unwrap_or(host);

    format!("http://{label}.{suffix}{port}{rest}")
}

/// Swap the authority of `url` for `address`, keeping the scheme and
/// everything after the authority.
pub fn substitute_authority(url: &str, address: &str) -> String {
    let (scheme, _, rest) = split_url(url);
    let scheme = scheme.unwrap_or("http");

    format!("{scheme}://{address}{rest}")
}

/// The `host[:port]` portion of a URL.
pub fn authority(url: &str) -> &str {
    let (_, authority, _) = split_url(url);
    authority.rsplit_once('@').map_or(authority, |(_, host)| host)
}

fn split_url(url: &str) -> (Option<&str>, &str, &str) {
    let (scheme, remainder) = match url.find("://") {
        Some(index) => (Some(&url[..index]), &url[index + 3..]),
        None => (None, url),
    };

    let end = remainder.find(['/', '?', '#']).unwrap_or(remainder.len());
    let (authority, rest) = remainder.split_at(end);

    (scheme, authority, rest)
}
