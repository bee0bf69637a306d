//! Manifest registry.
//!
//! Pure metadata storage: registering an extension never allocates an
//! execution context. The lifecycle manager reads entries from here when it
//! needs to build a sandbox.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::error::{ExtensionError, ExtensionResult};
use super::manifest::Manifest;
use super::permissions::AllowedDomainSet;
use super::ExtensionId;

/// A registered extension: manifest, package location and derived domain set.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub manifest: Manifest,
    pub load_path: PathBuf,
    pub allowed: AllowedDomainSet,
}

/// Stores manifests of installed extensions by id.
#[derive(Debug, Default)]
pub struct ManifestRegistry {
    entries: HashMap<ExtensionId, RegistryEntry>,
}

impl ManifestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an extension's manifest.
    ///
    /// Manifests are expected to be validated by the caller; only the domain
    /// set derivation can fail here.
    pub fn register(
        &mut self,
        id: &str,
        manifest: Manifest,
        load_path: impl Into<PathBuf>,
    ) -> ExtensionResult<()> {
        let allowed = AllowedDomainSet::from_manifest(&manifest)?;
        self.entries.insert(
            id.to_string(),
            RegistryEntry {
                manifest,
                load_path: load_path.into(),
                allowed,
            },
        );
        Ok(())
    }

    /// Get the manifest for an extension.
    pub fn get(&self, id: &str) -> ExtensionResult<&Manifest> {
        self.entry(id).map(|e| &e.manifest)
    }

    /// Get the full registry entry for an extension.
    pub fn entry(&self, id: &str) -> ExtensionResult<&RegistryEntry> {
        self.entries
            .get(id)
            .ok_or_else(|| ExtensionError::ExtensionNotFound(id.to_string()))
    }

    /// Remove an extension. Returns the removed entry, if any.
    pub fn unregister(&mut self, id: &str) -> Option<RegistryEntry> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All registered manifests, sorted by id.
    pub fn list(&self) -> Vec<&Manifest> {
        let mut manifests: Vec<&Manifest> = self.entries.values().map(|e| &e.manifest).collect();
        manifests.sort_by(|a, b| a.id.cmp(&b.id));
        manifests
    }

    /// Scan a directory of extension packages and register every valid one.
    ///
    /// Invalid packages are logged and skipped. Returns the ids registered.
    pub fn scan_dir(&mut self, extensions_dir: &Path) -> ExtensionResult<Vec<ExtensionId>> {
        let mut registered = Vec::new();

        if !extensions_dir.exists() {
            // No extensions directory - that's fine, just no extensions
            return Ok(registered);
        }

        for entry in std::fs::read_dir(extensions_dir)?.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            match Manifest::load_package(&path) {
                Ok(manifest) => {
                    let id = manifest.id.clone();
                    if let Err(e) = self.register(&id, manifest, &path) {
                        tracing::warn!(path = %path.display(), error = %e, "skipping extension");
                        continue;
                    }
                    tracing::debug!(extension = %id, path = %path.display(), "registered extension");
                    registered.push(id);
                }
                Err(ExtensionError::ManifestNotFound(_)) => {
                    // Not an extension directory, skip
                    continue;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "invalid extension package");
                    continue;
                }
            }
        }

        registered.sort();
        Ok(registered)
    }
}
