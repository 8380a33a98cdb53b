//! The options recognised by the loader, usually read from a TOML file.
//!
//! ```toml
//! appid = 1250000000
//! cache_dir = "/tmp/ofs-cache"
//! meta_server_port = 443
//! transfer_endpoint_suffix = "cos-internal.example.com"
//!
//! [retry.orchestrate]
//! attempts = 5
//! min_delay = "500ms"
//! max_delay = "2s"
//! ```

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, retry::RetryPolicy};

pub const DEFAULT_META_SERVER_PORT: u16 = 443;
pub const DEFAULT_METADATA_PATH: &str = "chdfs-hadoop-plugin";
pub const DEFAULT_ARTIFACT_KIND: &str = "HadoopPluginJar";
pub const DEFAULT_ARTIFACT_PREFIX: &str = "ofs_plugin";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// The account the mount point belongs to. Sent along with every
    /// metadata query.
    pub appid: u64,
    /// Where downloaded artifacts are kept. Shared by every process on the
    /// host, so it must be an absolute path.
    pub cache_dir: PathBuf,
    #[serde(default = "default_meta_server_port")]
    pub meta_server_port: u16,
    #[serde(default = "default_true")]
    pub meta_use_tls: bool,
    /// Metadata hosts for bucket-style mount points become
    /// `<bucket>.<suffix>`. Setting this turns TLS off for metadata calls.
    #[serde(default)]
    pub meta_endpoint_suffix: Option<String>,
    #[serde(default)]
    pub bucket_region: Option<String>,
    /// Append `-<appid>` to the mount point before interpreting it.
    #[serde(default)]
    pub use_short_bucket_name: bool,
    /// Symbolic name of the metadata service. Takes precedence over the
    /// host derived from the mount point.
    #[serde(default)]
    pub meta_indirection: Option<String>,
    /// Replace everything after the first label of the download host.
    #[serde(default)]
    pub transfer_endpoint_suffix: Option<String>,
    /// Symbolic name of the storage endpoint artifacts are downloaded from.
    #[serde(default)]
    pub transfer_indirection: Option<String>,
    /// Send the original download host in a `Host` header when talking to
    /// a substituted address.
    #[serde(default)]
    pub distinguish_host: bool,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    #[serde(default = "default_metadata_path")]
    pub metadata_path: String,
    #[serde(default = "default_artifact_kind")]
    pub artifact_kind: String,
    #[serde(default = "default_artifact_prefix")]
    pub artifact_prefix: String,
    #[serde(default = "default_artifact_suffix")]
    pub artifact_suffix: String,
    #[serde(default = "default_connect_timeout", with = "duration")]
    pub connect_timeout: Duration,
    #[serde(default = "default_read_timeout", with = "duration")]
    pub read_timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Retry behaviour of the three layers that talk to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Looking up a symbolic endpoint.
    #[serde(default = "default_resolve_policy")]
    pub resolve: RetryPolicy,
    /// A single metadata query.
    #[serde(default = "default_fetch_policy")]
    pub fetch: RetryPolicy,
    /// The whole resolve → fetch → cache → load sequence.
    #[serde(default = "default_orchestrate_policy")]
    pub orchestrate: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            resolve: default_resolve_policy(),
            fetch: default_fetch_policy(),
            orchestrate: default_orchestrate_policy(),
        }
    }
}

impl RetryConfig {
    /// Same attempt counts as the defaults, but never sleeps.
    pub fn without_delays() -> Self {
        let defaults = RetryConfig::default();
        RetryConfig {
            resolve: RetryPolicy::immediate(defaults.resolve.attempts),
            fetch: RetryPolicy::immediate(defaults.fetch.attempts),
            orchestrate: RetryPolicy::immediate(defaults.orchestrate.attempts),
        }
    }
}

impl LoaderConfig {
    /// A config with every optional field at its default.
    pub fn new(appid: u64, cache_dir: impl Into<PathBuf>) -> Self {
        LoaderConfig {
            appid,
            cache_dir: cache_dir.into(),
            meta_server_port: DEFAULT_META_SERVER_PORT,
            meta_use_tls: true,
            meta_endpoint_suffix: None,
            bucket_region: None,
            use_short_bucket_name: false,
            meta_indirection: None,
            transfer_endpoint_suffix: None,
            transfer_indirection: None,
            distinguish_host: false,
            client_version: default_client_version(),
            metadata_path: default_metadata_path(),
            artifact_kind: default_artifact_kind(),
            artifact_prefix: default_artifact_prefix(),
            artifact_suffix: default_artifact_suffix(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        raw.parse()
    }

    /// Check the values serde can't, and normalise the ones that are
    /// compared case-insensitively.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.appid == 0 {
            return Err(ConfigError::Invalid {
                key: "appid",
                value: self.appid.to_string(),
                reason: "appid should be a positive number",
            });
        }

        if !self.cache_dir.is_absolute() {
            return Err(ConfigError::Invalid {
                key: "cache_dir",
                value: self.cache_dir.display().to_string(),
                reason: "must be absolute path",
            });
        }

        self.meta_endpoint_suffix =
            non_empty("meta_endpoint_suffix", self.meta_endpoint_suffix)?
                .map(|s| s.to_lowercase());
        self.bucket_region = non_empty("bucket_region", self.bucket_region)?;
        self.meta_indirection = non_empty("meta_indirection", self.meta_indirection)?;
        self.transfer_endpoint_suffix =
            non_empty("transfer_endpoint_suffix", self.transfer_endpoint_suffix)?;
        self.transfer_indirection = non_empty("transfer_indirection", self.transfer_indirection)?;

        for (key, value) in [
            ("metadata_path", &self.metadata_path),
            ("artifact_kind", &self.artifact_kind),
            ("artifact_prefix", &self.artifact_prefix),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    key,
                    value: value.clone(),
                    reason: "value should not be empty string",
                });
            }
        }

        Ok(self)
    }

    /// The scheme used for metadata queries.
    pub fn meta_scheme(&self) -> &'static str {
        if self.meta_use_tls { "https" } else { "http" }
    }
}

impl FromStr for LoaderConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: LoaderConfig = toml::from_str(s)?;
        config.validate()
    }
}

fn non_empty(key: &'static str, value: Option<String>) -> Result<Option<String>, ConfigError> {
    match value {
        Some(v) if v.trim().is_empty() => Err(ConfigError::Invalid {
            key,
            value: v,
            reason: "value should not be empty string",
        }),
        Some(v) => Ok(Some(v.trim().to_string())),
        None => Ok(None),
    }
}

fn default_true() -> bool {
    true
}

fn default_meta_server_port() -> u16 {
    DEFAULT_META_SERVER_PORT
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_metadata_path() -> String {
    DEFAULT_METADATA_PATH.to_string()
}

fn default_artifact_kind() -> String {
    DEFAULT_ARTIFACT_KIND.to_string()
}

fn default_artifact_prefix() -> String {
    DEFAULT_ARTIFACT_PREFIX.to_string()
}

fn default_artifact_suffix() -> String {
    std::env::consts::DLL_SUFFIX.to_string()
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_read_timeout() -> Duration {
    DEFAULT_READ_TIMEOUT
}

fn default_resolve_policy() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(3))
}

fn default_fetch_policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(600), Duration::from_millis(2000))
}

fn default_orchestrate_policy() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(500), Duration::from_millis(2000))
}

/// (De)serialize a [`Duration`] as a human-readable string like `"1m 30s"`.
pub(crate) mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }
}
