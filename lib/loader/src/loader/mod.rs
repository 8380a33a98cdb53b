//! Turning a cached artifact into a live [`FileSystemImpl`].
//!
//! Code is loaded through a [`ModuleLoader`], which hands back a
//! [`ModuleScope`] that keeps the code mapped for as long as anything refers
//! to it. The [`InstanceLoader`] remembers the most recently opened scope so
//! that resolving the same artifact again only costs a constructor call.

mod dylib;
mod registry;

pub use self::{dylib::DylibLoader, registry::StaticRegistry};

use std::{
    ffi::c_void,
    fmt::{self, Debug},
    ops::{Deref, DerefMut},
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{
    cache::CachedArtifact,
    error::{BoxError, ResolveError},
    metadata::ArtifactDescriptor,
};

/// The capability every plugin version provides.
///
/// What the filesystem actually does is up to the plugin. The loader only
/// needs to know which version it got and how to point it at a mount.
pub trait FileSystemImpl: Send + Sync {
    fn version_id(&self) -> &str;

    fn initialize(&mut self, mount_point: &str) -> Result<(), BoxError>;
}

/// A constructor linked into the current binary.
pub type NativeConstructor = fn() -> Result<Box<dyn FileSystemImpl>, BoxError>;

/// A constructor exported from a dynamic library.
///
/// It must return a pointer obtained from [`into_exported()`], or null when
/// construction failed.
pub type ExportedConstructor = unsafe extern "C" fn() -> *mut c_void;

#[derive(Clone, Copy)]
pub enum Constructor {
    Native(NativeConstructor),
    Exported(ExportedConstructor),
}

impl Constructor {
    fn instantiate(&self, entry: &str) -> Result<Box<dyn FileSystemImpl>, ResolveError> {
        let failed = |source: BoxError| ResolveError::Instantiation {
            entry: entry.to_string(),
            source,
        };

        match *self {
            Constructor::Native(f) => match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(result) => result.map_err(failed),
                Err(payload) => Err(failed(panic_message(payload).into())),
            },
            Constructor::Exported(f) => {
                let raw = unsafe { f() };
                if raw.is_null() {
                    return Err(failed("the constructor returned null".into()));
                }
                // Safety: the exported constructor contract says non-null
                // pointers come from into_exported().
                let instance = unsafe { Box::from_raw(raw.cast::<Box<dyn FileSystemImpl>>()) };
                Ok(*instance)
            }
        }
    }
}

impl Debug for Constructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constructor::Native(_) => f.write_str("Constructor::Native"),
            Constructor::Exported(_) => f.write_str("Constructor::Exported"),
        }
    }
}

/// Convert an instance into the pointer an [`ExportedConstructor`] returns.
///
/// Plugins built as dynamic libraries export something like
///
/// ```rust,ignore
/// #[unsafe(no_mangle)]
/// pub extern "C" fn ofs_plugin_v3_create() -> *mut std::ffi::c_void {
///     ofs_loader::into_exported(Box::new(MyFileSystem::default()))
/// }
/// ```
pub fn into_exported(instance: Box<dyn FileSystemImpl>) -> *mut c_void {
    Box::into_raw(Box::new(instance)).cast()
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("the constructor panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("the constructor panicked: {msg}")
    } else {
        "the constructor panicked".to_string()
    }
}

/// A loaded unit of code that constructors can be looked up in.
pub trait ModuleScope: Debug + Send + Sync {
    fn entry(&self, name: &str) -> Option<Constructor>;
}

/// Something that knows how to open a cached artifact as a [`ModuleScope`].
pub trait ModuleLoader: Debug + Send + Sync {
    fn open(&self, artifact: &CachedArtifact) -> Result<Arc<dyn ModuleScope>, ResolveError>;
}

/// The symbol a given plugin version exposes its constructor under.
///
/// Versions are mapped onto a C identifier so that several versions can be
/// linked into the same binary without clashing.
pub fn entry_name(version_id: &str) -> String {
    let sanitized: String = version_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    format!("ofs_plugin_{sanitized}_create")
}

#[derive(Debug)]
struct LoadedEntry {
    descriptor: ArtifactDescriptor,
    path: PathBuf,
    scope: Arc<dyn ModuleScope>,
    constructor: Constructor,
    entry: String,
}

/// The process-wide record of the most recently loaded plugin.
///
/// Create one when the process starts and share it with every
/// [`Orchestrator`][crate::Orchestrator].
#[derive(Debug)]
pub struct InstanceLoader {
    modules: Arc<dyn ModuleLoader>,
    last: Mutex<Option<LoadedEntry>>,
}

impl InstanceLoader {
    pub fn new(modules: impl ModuleLoader + 'static) -> Self {
        InstanceLoader::with_shared(Arc::new(modules))
    }

    pub fn with_shared(modules: Arc<dyn ModuleLoader>) -> Self {
        InstanceLoader {
            modules,
            last: Mutex::new(None),
        }
    }

    /// The version of the last successfully loaded plugin, if any.
    pub fn loaded_version(&self) -> Option<String> {
        self.lock()
            .as_ref()
            .map(|entry| entry.descriptor.version_id.clone())
    }

    /// Create a fresh instance of the plugin in `artifact`.
    ///
    /// When `descriptor` names the same artifact as the previous call the
    /// already-open scope is reused. Otherwise the artifact is opened and
    /// replaces the remembered scope. Instances created from an older scope
    /// keep it alive.
    #[tracing::instrument(level = "debug", skip_all, fields(artifact.version = %descriptor.version_id))]
    pub fn load(
        &self,
        artifact: &CachedArtifact,
        descriptor: &ArtifactDescriptor,
    ) -> Result<ImplementationHandle, ResolveError> {
        let mut last = self.lock();

        if let Some(entry) = last.as_ref() {
            if entry.descriptor.same_artifact(descriptor) {
                tracing::debug!(entry = %entry.entry, "Reusing the loaded plugin");
                let instance = entry.constructor.instantiate(&entry.entry)?;
                return Ok(ImplementationHandle {
                    instance,
                    descriptor: entry.descriptor.clone(),
                    entry: entry.entry.clone(),
                    scope: Arc::clone(&entry.scope),
                });
            }
        }

        let entry = entry_name(&descriptor.version_id);
        let scope = self.modules.open(artifact)?;
        let constructor = scope
            .entry(&entry)
            .ok_or_else(|| ResolveError::EntryNotFound {
                entry: entry.clone(),
                path: artifact.local_path.clone(),
            })?;
        let instance = constructor.instantiate(&entry)?;

        match last.as_ref() {
            Some(previous) => tracing::info!(
                previous.version = %previous.descriptor.version_id,
                previous.path = %previous.path.display(),
                path = %artifact.local_path.display(),
                %entry,
                "Loaded a new plugin version",
            ),
            None => tracing::info!(path = %artifact.local_path.display(), %entry, "Loaded plugin"),
        }

        let handle = ImplementationHandle {
            instance,
            descriptor: descriptor.clone(),
            entry: entry.clone(),
            scope: Arc::clone(&scope),
        };

        *last = Some(LoadedEntry {
            descriptor: descriptor.clone(),
            path: artifact.local_path.clone(),
            scope,
            constructor,
            entry,
        });

        Ok(handle)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<LoadedEntry>> {
        // The state is replaced wholesale, so a panic elsewhere can't leave
        // it half-updated.
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A ready-to-use plugin instance.
pub struct ImplementationHandle {
    // Fields drop in declaration order. The instance's code lives in the
    // scope, so the instance has to go first.
    instance: Box<dyn FileSystemImpl>,
    descriptor: ArtifactDescriptor,
    entry: String,
    scope: Arc<dyn ModuleScope>,
}

impl ImplementationHandle {
    pub fn descriptor(&self) -> &ArtifactDescriptor {
        &self.descriptor
    }

    pub fn entry_name(&self) -> &str {
        &self.entry
    }

    /// Were both instances constructed from the same loaded code?
    pub fn shares_code_with(&self, other: &ImplementationHandle) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.scope), Arc::as_ptr(&other.scope))
    }
}

impl Deref for ImplementationHandle {
    type Target = dyn FileSystemImpl;

    fn deref(&self) -> &Self::Target {
        &*self.instance
    }
}

impl DerefMut for ImplementationHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.instance
    }
}

impl Debug for ImplementationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplementationHandle")
            .field("version_id", &self.instance.version_id())
            .field("entry", &self.entry)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::{testing::*, *};
    use crate::checksum::Checksum;

    fn artifact(temp: &TempDir, version: &str, content: &[u8]) -> (CachedArtifact, ArtifactDescriptor) {
        let path = temp.path().join(format!("ofs_plugin-{version}.so"));
        std::fs::write(&path, content).unwrap();
        let checksum = Checksum::of_bytes(content);
        let cached = CachedArtifact {
            local_path: path,
            version_id: version.to_string(),
            checksum,
        };
        let descriptor = ArtifactDescriptor::new(
            version,
            format!("http://host/ofs_plugin-{version}.so"),
            checksum,
        );
        (cached, descriptor)
    }

    fn registry() -> CountingLoader<StaticRegistry> {
        CountingLoader::new(
            StaticRegistry::new()
                .with_version("v1", create_v1)
                .with_version("v2", create_v2),
        )
    }

    #[test]
    fn entry_names_are_identifiers() {
        assert_eq!(entry_name("v3"), "ofs_plugin_v3_create");
        assert_eq!(entry_name("2.1.0-beta"), "ofs_plugin_2_1_0_beta_create");
    }

    #[test]
    fn same_artifact_reuses_the_scope() {
        let temp = TempDir::new().unwrap();
        let modules = registry();
        let opens = Arc::clone(&modules.opens);
        let loader = InstanceLoader::new(modules);
        let (cached, descriptor) = artifact(&temp, "v1", b"v1");

        let mut first = loader.load(&cached, &descriptor).unwrap();
        let second = loader.load(&cached, &descriptor).unwrap();

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(first.shares_code_with(&second));
        assert_eq!(second.version_id(), "v1");
        assert_eq!(first.entry_name(), "ofs_plugin_v1_create");
        // Distinct instances
        first.initialize("ofs://bucket-1/").unwrap();
        assert!(!std::ptr::addr_eq(&*first, &*second));
        assert_eq!(loader.loaded_version().as_deref(), Some("v1"));
    }

    #[test]
    fn different_checksum_reopens() {
        let temp = TempDir::new().unwrap();
        let modules = registry();
        let opens = Arc::clone(&modules.opens);
        let loader = InstanceLoader::new(modules);
        let (cached, descriptor) = artifact(&temp, "v1", b"v1");
        let republished = ArtifactDescriptor::new(
            "v1",
            descriptor.download_url.clone(),
            Checksum::of_bytes(b"v1 rebuilt"),
        );

        let first = loader.load(&cached, &descriptor).unwrap();
        let second = loader.load(&cached, &republished).unwrap();

        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert!(!first.shares_code_with(&second));
        assert_eq!(second.descriptor(), &republished);
    }

    #[test]
    fn switching_versions_keeps_old_instances_alive() {
        let temp = TempDir::new().unwrap();
        let loader = InstanceLoader::new(registry());
        let (v1, v1_descriptor) = artifact(&temp, "v1", b"v1");
        let (v2, v2_descriptor) = artifact(&temp, "v2", b"v2");

        let old = loader.load(&v1, &v1_descriptor).unwrap();
        let new = loader.load(&v2, &v2_descriptor).unwrap();

        assert_eq!(old.version_id(), "v1");
        assert_eq!(new.version_id(), "v2");
        assert_eq!(loader.loaded_version().as_deref(), Some("v2"));
    }

    #[test]
    fn missing_entry() {
        let temp = TempDir::new().unwrap();
        let loader = InstanceLoader::new(registry());
        let (cached, descriptor) = artifact(&temp, "v9", b"v9");

        let err = loader.load(&cached, &descriptor).unwrap_err();

        assert!(
            matches!(err, ResolveError::EntryNotFound { ref entry, .. } if entry == "ofs_plugin_v9_create"),
            "{err:?}"
        );
        assert!(!err.is_transient());
        assert_eq!(loader.loaded_version(), None);
    }

    #[test]
    fn failing_constructors_are_instantiation_errors() {
        fn broken() -> Result<Box<dyn FileSystemImpl>, BoxError> {
            Err("no default configuration".into())
        }
        fn panics() -> Result<Box<dyn FileSystemImpl>, BoxError> {
            panic!("boom");
        }
        let temp = TempDir::new().unwrap();
        let loader = InstanceLoader::new(
            StaticRegistry::new()
                .with_version("v1", broken)
                .with_version("v2", panics),
        );
        let (v1, v1_descriptor) = artifact(&temp, "v1", b"v1");
        let (v2, v2_descriptor) = artifact(&temp, "v2", b"v2");

        let err = loader.load(&v1, &v1_descriptor).unwrap_err();
        assert!(matches!(err, ResolveError::Instantiation { .. }), "{err:?}");

        let err = loader.load(&v2, &v2_descriptor).unwrap_err();
        match err {
            ResolveError::Instantiation { source, .. } => {
                assert!(source.to_string().contains("boom"), "{source}");
            }
            other => panic!("Unexpected error: {other:?}"),
        }
    }

    unsafe extern "C" fn exported_v1() -> *mut c_void {
        into_exported(Box::new(MemoryFs {
            version: "v1",
            mounted: None,
        }))
    }

    unsafe extern "C" fn exported_null() -> *mut c_void {
        std::ptr::null_mut()
    }

    #[test]
    fn exported_constructors() {
        let instance = Constructor::Exported(exported_v1)
            .instantiate("ofs_plugin_v1_create")
            .unwrap();
        assert_eq!(instance.version_id(), "v1");

        let Err(err) = Constructor::Exported(exported_null).instantiate("ofs_plugin_v1_create")
        else {
            panic!("a null instance should not be accepted");
        };
        assert!(matches!(err, ResolveError::Instantiation { .. }), "{err:?}");
    }
}
