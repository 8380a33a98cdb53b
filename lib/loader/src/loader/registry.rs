use std::{collections::HashMap, sync::Arc};

use crate::{
    cache::CachedArtifact,
    error::ResolveError,
    loader::{Constructor, ModuleLoader, ModuleScope, NativeConstructor, entry_name},
};

/// A [`ModuleLoader`] for plugin versions that were compiled into the
/// current binary.
///
/// The artifact still has to be downloaded and verified like any other, so
/// "opening" it only checks that the cached file is there.
#[derive(Debug, Default, Clone)]
pub struct StaticRegistry {
    entries: Arc<HashMap<String, NativeConstructor>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        StaticRegistry::default()
    }

    /// Register the constructor for a plugin version.
    pub fn with_version(self, version_id: &str, constructor: NativeConstructor) -> Self {
        self.with_entry(entry_name(version_id), constructor)
    }

    pub fn with_entry(mut self, name: impl Into<String>, constructor: NativeConstructor) -> Self {
        Arc::make_mut(&mut self.entries).insert(name.into(), constructor);
        self
    }
}

impl ModuleLoader for StaticRegistry {
    fn open(&self, artifact: &CachedArtifact) -> Result<Arc<dyn ModuleScope>, ResolveError> {
        std::fs::metadata(&artifact.local_path)
            .map_err(|e| ResolveError::io(&artifact.local_path, e))?;

        Ok(Arc::new(StaticScope {
            entries: Arc::clone(&self.entries),
        }))
    }
}

#[derive(Debug)]
struct StaticScope {
    entries: Arc<HashMap<String, NativeConstructor>>,
}

impl ModuleScope for StaticScope {
    fn entry(&self, name: &str) -> Option<Constructor> {
        self.entries.get(name).copied().map(Constructor::Native)
    }
}
