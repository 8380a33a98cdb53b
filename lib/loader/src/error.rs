use std::path::PathBuf;

use crate::checksum::Checksum;

/// Boxed error returned by plugin constructors and other opaque collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Everything that can go wrong while turning a mount point into a loaded
/// [`FileSystemImpl`][crate::FileSystemImpl].
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No concrete address could be obtained for a symbolic endpoint.
    #[error("Unable to resolve \"{name}\" after {attempts} attempts")]
    Resolution {
        name: String,
        attempts: usize,
        #[source]
        last: Option<anyhow::Error>,
    },
    /// The metadata endpoint could not be reached or answered with an error.
    #[error("Unable to query \"{url}\"")]
    MetadataTransport {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    /// The metadata endpoint answered, but the body is unusable.
    #[error("Metadata response is missing or has an invalid \"{field}\", resp: {response}")]
    MetadataFormat { field: String, response: String },
    /// Downloading the artifact itself failed.
    #[error("Unable to download \"{url}\" into \"{}\"", path.display())]
    ArtifactTransport {
        url: String,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    /// The downloaded artifact does not hash to what the metadata promised.
    #[error(
        "Checksum mismatch for \"{}\": expected {expected}, found {actual}",
        path.display()
    )]
    Integrity {
        path: PathBuf,
        expected: Checksum,
        actual: Checksum,
    },
    /// The advisory lock beside a cache entry could not be taken or released.
    #[error("Unable to lock \"{}\"", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The artifact was opened but does not export the expected entry.
    #[error("Entry \"{entry}\" not found in \"{}\"", path.display())]
    EntryNotFound { entry: String, path: PathBuf },
    /// The entry exists but constructing an instance from it failed.
    #[error("Unable to instantiate \"{entry}\"")]
    Instantiation {
        entry: String,
        #[source]
        source: BoxError,
    },
    /// The artifact could not be opened as a loadable module.
    #[error("Unable to open \"{}\" as a module", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
    #[error("Filesystem operation on \"{}\" failed", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "mountPointAddr {addr} is invalid, exp. f4mabcdefgh-xyzw.chdfs.ap-guangzhou.myqcloud.com or examplebucket-1250000000 or f4mabcdefgh-xyzw"
    )]
    InvalidMountPoint { addr: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ResolveError {
    /// Whether retrying the whole resolution (re-resolving the endpoint and
    /// re-fetching metadata) has a chance of succeeding.
    ///
    /// A bad checksum, a missing entry or a broken config will fail the same
    /// way on every attempt, so only network-ish failures and lock contention
    /// qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            ResolveError::Resolution { .. }
            | ResolveError::MetadataTransport { .. }
            | ResolveError::ArtifactTransport { .. } => true,
            ResolveError::Lock { source, .. } => {
                source.kind() == std::io::ErrorKind::WouldBlock
                    || source.kind() == std::io::ErrorKind::Interrupted
            }
            _ => false,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ResolveError::Io {
            path: path.into(),
            source,
        }
    }
}

/// A problem with the user-supplied configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("ofs config {key} is missing")]
    Missing { key: &'static str },
    #[error("ofs config {key} value \"{value}\" is invalid, {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("Unable to read \"{}\"", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unable to parse the config")]
    Parse(#[from] toml::de::Error),
}

/// The single failure surfaced to whoever owns the resolution.
#[derive(Debug, thiserror::Error)]
#[error("init ofs impl failed after {attempts} attempt(s)")]
pub struct InitError {
    pub attempts: usize,
    #[source]
    pub source: ResolveError,
}
