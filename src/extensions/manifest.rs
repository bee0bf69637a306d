//! Extension manifest parsing.
//!
//! Each extension package is a directory with a `manifest.json` that defines:
//! - Extension metadata (id, name, version, icon)
//! - The site it scrapes (`baseUrl`) and any extra domains it reaches
//! - Capability hints (streaming, filters, challenge handling)
//! - The entry module executed inside the sandbox

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use super::error::{ExtensionError, ExtensionResult};

/// File name of the manifest inside an extension package.
pub const MANIFEST_FILE: &str = "manifest.json";

fn default_entry() -> String {
    "index.js".to_string()
}

/// Complete extension manifest parsed from `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Unique identifier (lowercase, alphanumeric, hyphens, underscores, dots).
    #[serde(default)]
    pub id: String,

    /// Human-readable display name.
    #[serde(default)]
    pub name: String,

    /// Extension version (e.g., "1.0.0").
    #[serde(default)]
    pub version: String,

    /// Root URL of the site this extension scrapes.
    #[serde(default)]
    pub base_url: String,

    /// Icon filename relative to the package root, or a remote URL.
    #[serde(default)]
    pub icon: Option<String>,

    /// Whether the source serves adult content.
    #[serde(default)]
    pub nsfw: bool,

    /// Additional domains the extension may reach (supports "*.example.com").
    #[serde(default, rename = "domains", alias = "declaredDomains")]
    pub declared_domains: Vec<String>,

    /// Capability hints declared by the author.
    #[serde(default)]
    pub capabilities: ManifestCapabilities,

    /// Entry module, relative to the package root.
    #[serde(default = "default_entry")]
    pub main: String,
}

/// Optional features an extension claims to implement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestCapabilities {
    /// Exposes `getChapterPagesStreaming`.
    #[serde(default)]
    pub streaming: bool,

    /// Exposes `getFilters`.
    #[serde(default)]
    pub filters: bool,

    /// Source sits behind an anti-automation challenge.
    #[serde(default)]
    pub cloudflare: bool,
}

impl Manifest {
    /// Load manifest from a package directory containing `manifest.json`.
    pub fn load(extension_dir: &Path) -> ExtensionResult<Self> {
        let manifest_path = extension_dir.join(MANIFEST_FILE);

        if !manifest_path.exists() {
            return Err(ExtensionError::ManifestNotFound(
                extension_dir.to_path_buf(),
            ));
        }

        let content = std::fs::read_to_string(&manifest_path)?;

        serde_json::from_str(&content).map_err(|e| ExtensionError::ManifestInvalid {
            path: manifest_path,
            message: e.to_string(),
        })
    }

    /// Load a package and validate both the manifest and its entry file.
    pub fn load_package(extension_dir: &Path) -> ExtensionResult<Self> {
        let manifest = Self::load(extension_dir)?;
        manifest.validate()?;

        let entry = manifest.entry_path(extension_dir);
        if !entry.is_file() {
            return Err(invalid(format!(
                "entry module '{}' not found",
                manifest.main
            )));
        }

        Ok(manifest)
    }

    /// Validate the manifest for required fields and constraints.
    pub fn validate(&self) -> ExtensionResult<()> {
        if self.id.is_empty() {
            return Err(invalid("id is required"));
        }

        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid(format!(
                "id '{}' may only contain lowercase letters, digits, '-', '_' and '.'",
                self.id
            )));
        }

        if self.name.is_empty() {
            return Err(invalid("name is required"));
        }

        if self.version.is_empty() {
            return Err(invalid("version is required"));
        }

        if self.base_url.is_empty() {
            return Err(invalid("baseUrl is required"));
        }

        self.base_host()?;

        if self.main.is_empty() || self.main.contains("..") || Path::new(&self.main).is_absolute() {
            return Err(invalid(format!(
                "main '{}' must be a relative path inside the package",
                self.main
            )));
        }

        for domain in &self.declared_domains {
            if domain.trim().is_empty() || domain.contains('/') {
                return Err(invalid(format!("invalid declared domain '{}'", domain)));
            }
        }

        Ok(())
    }

    /// Host of `baseUrl`, lowercased.
    pub fn base_host(&self) -> ExtensionResult<String> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| invalid(format!("baseUrl '{}' is not a URL: {}", self.base_url, e)))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(invalid(format!(
                    "baseUrl scheme '{}' is not http(s)",
                    other
                )))
            }
        }

        url.host_str()
            .map(|h| h.to_ascii_lowercase())
            .ok_or_else(|| invalid(format!("baseUrl '{}' has no host", self.base_url)))
    }

    /// Absolute path of the entry module for a package rooted at `extension_dir`.
    pub fn entry_path(&self, extension_dir: &Path) -> PathBuf {
        extension_dir.join(&self.main)
    }
}

fn invalid(message: impl Into<String>) -> ExtensionError {
    ExtensionError::ManifestInvalid {
        path: MANIFEST_FILE.into(),
        message: message.into(),
    }
}
