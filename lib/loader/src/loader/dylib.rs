use std::{path::PathBuf, sync::Arc};

use libloading::{Library, Symbol};

use crate::{
    cache::CachedArtifact,
    error::ResolveError,
    loader::{Constructor, ExportedConstructor, ModuleLoader, ModuleScope},
};

/// Loads plugins that were built as dynamic libraries.
///
/// Each artifact is opened with the platform's default (local) symbol
/// visibility, so two versions living in the same process don't see each
/// other's symbols. The library is mapped from the artifact's pinned copy,
/// so a version that was republished with different content gets its own
/// mapping.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl ModuleLoader for DylibLoader {
    fn open(&self, artifact: &CachedArtifact) -> Result<Arc<dyn ModuleScope>, ResolveError> {
        let path = artifact.pin()?;

        // Safety: the artifact was verified against the checksum published
        // by the metadata service, which is as much trust as we can get.
        let library = unsafe { Library::new(&path) }.map_err(|e| ResolveError::Open {
            path: path.clone(),
            source: Box::new(e),
        })?;

        tracing::debug!(path = %path.display(), "Opened dynamic library");

        Ok(Arc::new(DylibScope { path, library }))
    }
}

/// Keeps the library mapped until the last instance created from it is gone.
#[derive(Debug)]
struct DylibScope {
    path: PathBuf,
    library: Library,
}

impl ModuleScope for DylibScope {
    fn entry(&self, name: &str) -> Option<Constructor> {
        let symbol: Symbol<'_, ExportedConstructor> =
            match unsafe { self.library.get(name.as_bytes()) } {
                Ok(symbol) => symbol,
                Err(e) => {
                    tracing::debug!(
                        path = %self.path.display(),
                        entry = name,
                        error = &e as &dyn std::error::Error,
                        "Symbol lookup failed",
                    );
                    return None;
                }
            };

        Some(Constructor::Exported(*symbol))
    }
}
