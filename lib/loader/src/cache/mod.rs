//! The on-disk artifact cache shared by every process on the host.
//!
//! Entries live directly in the cache directory as
//! `{prefix}-{version}{suffix}`, each with a `.LOCK` sidecar that writers
//! hold while downloading. A cache hit is decided purely by re-hashing the
//! file, so a corrupt or half-replaced entry is never handed out.

mod lock;

pub use self::lock::{FlockGuard, LOCK_POLL_INTERVAL};

use std::{
    fs,
    io::{BufWriter, ErrorKind, Write as _},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use crate::{
    checksum::Checksum,
    config::LoaderConfig,
    error::{ConfigError, ResolveError},
    http::{DynHttpClient, HttpRequest},
    metadata::ArtifactDescriptor,
};

/// The permissions given to the cache directory and everything in it, so
/// workers running as different users can share one copy.
#[cfg(unix)]
const SHARED_MODE: u32 = 0o777;

const LOCK_SUFFIX: &str = ".LOCK";

/// A verified artifact sitting in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub local_path: PathBuf,
    pub version_id: String,
    pub checksum: Checksum,
}

impl CachedArtifact {
    /// `{local_path}.{checksum}`, the name this exact content is mapped
    /// from.
    pub fn pinned_path(&self) -> PathBuf {
        let mut path = self.local_path.clone().into_os_string();
        path.push(format!(".{}", self.checksum));
        PathBuf::from(path)
    }

    /// Make sure a private copy of the artifact exists under
    /// [`CachedArtifact::pinned_path()`] and return that path.
    ///
    /// A republished version replaces `local_path` in place. The dynamic
    /// loader recognises libraries by path and inode, so opening
    /// `local_path` again would hand back whatever was mapped from it
    /// before. Each copy has its own inode and a name tied to its content.
    pub fn pin(&self) -> Result<PathBuf, ResolveError> {
        let pinned = self.pinned_path();

        match Checksum::of_file(&pinned) {
            Ok(actual) if actual == self.checksum => return Ok(pinned),
            // A torn copy left behind by a crash gets replaced
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(ResolveError::io(&pinned, e)),
        }

        let dir = self.local_path.parent().unwrap_or(Path::new("."));
        let file_name = pinned
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("artifact");
        let mut temp = tempfile::Builder::new()
            .prefix(&format!("{file_name}."))
            .suffix(".part")
            .tempfile_in(dir)
            .map_err(|e| ResolveError::io(dir, e))?;

        let mut source =
            fs::File::open(&self.local_path).map_err(|e| ResolveError::io(&self.local_path, e))?;
        std::io::copy(&mut source, temp.as_file_mut())
            .map_err(|e| ResolveError::io(temp.path(), e))?;

        // The entry may have been replaced since it was verified
        let actual = Checksum::of_file(temp.path()).map_err(|e| ResolveError::io(temp.path(), e))?;
        if actual != self.checksum {
            return Err(ResolveError::Integrity {
                path: self.local_path.clone(),
                expected: self.checksum,
                actual,
            });
        }

        let file = temp
            .persist(&pinned)
            .map_err(|e| ResolveError::io(&pinned, e.error))?;
        make_shared_file(&file, &pinned);
        tracing::debug!(cache.path = %pinned.display(), "Pinned artifact");

        Ok(pinned)
    }
}

/// Where to actually send the download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    pub url: String,
    /// Sent as the `Host` header when `url` points at a substituted address.
    pub host_header: Option<String>,
}

impl DownloadTarget {
    pub fn direct(url: impl Into<String>) -> Self {
        DownloadTarget {
            url: url.into(),
            host_header: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactCache {
    cache_dir: PathBuf,
    prefix: String,
    suffix: String,
    client: DynHttpClient,
    read_timeout: Duration,
}

impl ArtifactCache {
    pub fn new(config: &LoaderConfig, client: DynHttpClient) -> Self {
        ArtifactCache {
            cache_dir: config.cache_dir.clone(),
            prefix: config.artifact_prefix.clone(),
            suffix: config.artifact_suffix.clone(),
            client,
            read_timeout: config.read_timeout,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn artifact_path(&self, version_id: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}-{version_id}{}", self.prefix, self.suffix))
    }

    pub fn lock_path(&self, version_id: &str) -> PathBuf {
        let mut path = self.artifact_path(version_id).into_os_string();
        path.push(LOCK_SUFFIX);
        PathBuf::from(path)
    }

    /// Make sure a copy of `descriptor`'s artifact with the right checksum is
    /// on disk, downloading it from `target` if necessary.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(artifact.version = %descriptor.version_id),
    )]
    pub fn ensure_cached(
        &self,
        descriptor: &ArtifactDescriptor,
        target: &DownloadTarget,
    ) -> Result<CachedArtifact, ResolveError> {
        let path = self.artifact_path(&descriptor.version_id);
        let cached = CachedArtifact {
            local_path: path.clone(),
            version_id: descriptor.version_id.clone(),
            checksum: descriptor.expected_checksum,
        };

        if self.is_valid(&path, &descriptor.expected_checksum)? {
            tracing::debug!(cache.path = %path.display(), "Cache hit");
            return Ok(cached);
        }

        prepare_cache_dir(&self.cache_dir)?;

        let lock_path = self.lock_path(&descriptor.version_id);
        let guard = FlockGuard::lock_exclusive(&lock_path).map_err(|source| ResolveError::Lock {
            path: lock_path.clone(),
            source,
        })?;
        make_shared_file(guard.file(), &lock_path);

        // Somebody else may have finished the download while we were waiting
        if self.is_valid(&path, &descriptor.expected_checksum)? {
            tracing::debug!(cache.path = %path.display(), "Downloaded by another writer");
            return Ok(cached);
        }

        self.download(target, &path)?;

        let actual = Checksum::of_file(&path).map_err(|e| ResolveError::io(&path, e))?;
        if actual != descriptor.expected_checksum {
            tracing::warn!(
                cache.path = %path.display(),
                expected = %descriptor.expected_checksum,
                %actual,
                "Downloaded artifact is corrupt",
            );
            return Err(ResolveError::Integrity {
                path,
                expected: descriptor.expected_checksum,
                actual,
            });
        }

        drop(guard);

        Ok(cached)
    }

    fn is_valid(&self, path: &Path, expected: &Checksum) -> Result<bool, ResolveError> {
        match Checksum::of_file(path) {
            Ok(actual) => {
                if actual != *expected {
                    tracing::debug!(
                        cache.path = %path.display(),
                        %expected,
                        %actual,
                        "Cached artifact is stale",
                    );
                }
                Ok(actual == *expected)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ResolveError::io(path, e)),
        }
    }

    /// Stream the artifact into a temporary file beside `path`, then move it
    /// into place.
    fn download(&self, target: &DownloadTarget, path: &Path) -> Result<(), ResolveError> {
        let start = Instant::now();
        let transport = |source: anyhow::Error| ResolveError::ArtifactTransport {
            url: target.url.clone(),
            path: path.to_path_buf(),
            source,
        };

        let mut request = HttpRequest::get(&target.url).with_read_timeout(self.read_timeout);
        if let Some(host) = &target.host_header {
            request = request.with_header("Host", host.as_str());
        }

        tracing::info!(url = %target.url, cache.path = %path.display(), "Downloading artifact");

        let mut response = self.client.request(request).map_err(transport)?;
        if !response.is_success() {
            return Err(transport(anyhow::anyhow!(
                "{} {}",
                response.status,
                response.status_text
            )));
        }

        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("artifact");
        let mut temp = tempfile::Builder::new()
            .prefix(&format!("{file_name}."))
            .suffix(".part")
            .tempfile_in(&self.cache_dir)
            .map_err(|e| ResolveError::io(&self.cache_dir, e))?;

        let bytes = {
            let mut writer = BufWriter::new(temp.as_file_mut());
            let bytes = std::io::copy(&mut response.body, &mut writer).map_err(|e| {
                transport(anyhow::Error::new(e).context("Unable to read the response body"))
            })?;
            writer.flush().map_err(|e| ResolveError::io(path, e))?;
            bytes
        };
        temp.as_file()
            .sync_all()
            .map_err(|e| ResolveError::io(temp.path(), e))?;

        let file = temp
            .persist(path)
            .map_err(|e| ResolveError::io(path, e.error))?;
        make_shared_file(&file, path);

        tracing::info!(
            cache.path = %path.display(),
            bytes,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Download complete",
        );

        Ok(())
    }
}

/// Create the cache directory if it doesn't exist yet and make sure we can
/// both read and write it.
pub fn prepare_cache_dir(dir: &Path) -> Result<(), ResolveError> {
    if !dir.is_absolute() {
        return Err(ConfigError::Invalid {
            key: "cache_dir",
            value: dir.display().to_string(),
            reason: "must be absolute path",
        }
        .into());
    }

    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(ResolveError::io(
                dir,
                std::io::Error::other("exists but is not a directory"),
            ));
        }
        Err(e) if e.kind() == ErrorKind::NotFound => match fs::create_dir_all(dir) {
            Ok(()) => {
                tracing::debug!(cache.dir = %dir.display(), "Created the cache directory");
                make_shared_path(dir);
            }
            // Another process may have won the race
            Err(_) if dir.is_dir() => {}
            Err(e) => return Err(ResolveError::io(dir, e)),
        },
        Err(e) => return Err(ResolveError::io(dir, e)),
    }

    fs::read_dir(dir).map_err(|e| ResolveError::io(dir, e))?;
    tempfile::tempfile_in(dir).map_err(|e| ResolveError::io(dir, e))?;

    Ok(())
}

/// Remove every cache entry, pinned copy and leftover partial download with
/// the given prefix. Returns how many files were deleted.
///
/// Lock files are left alone. A writer may be holding one, and replacing it
/// would let the next writer lock a different inode at the same time. Files
/// belonging to an entry with a lock file are only removed while holding
/// that lock.
pub fn clean(dir: &Path, prefix: &str) -> Result<usize, ResolveError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(ResolveError::io(dir, e)),
    };

    let prefix = format!("{prefix}-");
    let mut locked_entries = Vec::new();
    let mut files = Vec::new();

    for entry in entries {
        let entry = entry.map_err(|e| ResolveError::io(dir, e))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !name.starts_with(&prefix) {
            continue;
        }

        match name.strip_suffix(LOCK_SUFFIX) {
            Some(artifact) => locked_entries.push(artifact.to_string()),
            None => files.push(name),
        }
    }

    // Longest first, so "v1.so.2" claims its own files before "v1.so" does
    locked_entries.sort_by_key(|name| std::cmp::Reverse(name.len()));

    let mut removed = 0;

    for artifact in &locked_entries {
        let (owned, rest): (Vec<_>, Vec<_>) = files
            .into_iter()
            .partition(|name| belongs_to(name, artifact));
        files = rest;
        if owned.is_empty() {
            continue;
        }

        let lock_path = dir.join(format!("{artifact}{LOCK_SUFFIX}"));
        let _guard = FlockGuard::lock_exclusive(&lock_path).map_err(|source| {
            ResolveError::Lock {
                path: lock_path.clone(),
                source,
            }
        })?;

        for name in owned {
            if remove_cached_file(&dir.join(name))? {
                removed += 1;
            }
        }
    }

    for name in files {
        if remove_cached_file(&dir.join(name))? {
            removed += 1;
        }
    }

    Ok(removed)
}

fn belongs_to(name: &str, artifact: &str) -> bool {
    name.strip_prefix(artifact)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

fn remove_cached_file(path: &Path) -> Result<bool, ResolveError> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Removed");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ResolveError::io(path, e)),
    }
}

#[cfg(unix)]
fn make_shared_file(file: &fs::File, path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    // Fails when the file belongs to another user, who has already done it.
    if let Err(e) = file.set_permissions(fs::Permissions::from_mode(SHARED_MODE)) {
        tracing::debug!(
            path = %path.display(),
            error = &e as &dyn std::error::Error,
            "Unable to update the permissions",
        );
    }
}

#[cfg(unix)]
fn make_shared_path(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(SHARED_MODE)) {
        tracing::warn!(
            path = %path.display(),
            error = &e as &dyn std::error::Error,
            "Unable to update the permissions",
        );
    }
}

#[cfg(not(unix))]
fn make_shared_file(_file: &fs::File, _path: &Path) {}

#[cfg(not(unix))]
fn make_shared_path(_path: &Path) {}
