//! Capability table for a loaded extension.
//!
//! Built once per sandbox instance from the functions the module exports.
//! Invocations look the name up here instead of probing the context, so a
//! missing optional function is reported as "not found" without a round trip.

use std::collections::BTreeMap;
use std::fmt;

use super::manifest::ManifestCapabilities;

/// Functions the host knows how to call on a source extension.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExtensionFunction {
    GetPopularManga,
    GetLatestManga,
    SearchManga,
    GetMangaDetails,
    GetChapterList,
    GetChapterPages,
    GetChapterPagesStreaming,
    GetImageUrl,
    GetMangaCover,
    GetFilters,
    /// Any other exported function.
    Other(String),
}

impl ExtensionFunction {
    pub fn parse(name: &str) -> Self {
        match name {
            "getPopularManga" => Self::GetPopularManga,
            "getLatestManga" => Self::GetLatestManga,
            "searchManga" => Self::SearchManga,
            "getMangaDetails" => Self::GetMangaDetails,
            "getChapterList" => Self::GetChapterList,
            "getChapterPages" => Self::GetChapterPages,
            "getChapterPagesStreaming" => Self::GetChapterPagesStreaming,
            "getImageUrl" => Self::GetImageUrl,
            "getMangaCover" => Self::GetMangaCover,
            "getFilters" => Self::GetFilters,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::GetPopularManga => "getPopularManga",
            Self::GetLatestManga => "getLatestManga",
            Self::SearchManga => "searchManga",
            Self::GetMangaDetails => "getMangaDetails",
            Self::GetChapterList => "getChapterList",
            Self::GetChapterPages => "getChapterPages",
            Self::GetChapterPagesStreaming => "getChapterPagesStreaming",
            Self::GetImageUrl => "getImageUrl",
            Self::GetMangaCover => "getMangaCover",
            Self::GetFilters => "getFilters",
            Self::Other(name) => name,
        }
    }

    /// Functions every source is expected to export.
    pub fn is_required(&self) -> bool {
        matches!(
            self,
            Self::GetPopularManga
                | Self::SearchManga
                | Self::GetMangaDetails
                | Self::GetChapterList
                | Self::GetChapterPages
        )
    }
}

impl fmt::Display for ExtensionFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Map from exported name to the function it resolves to.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    functions: BTreeMap<String, ExtensionFunction>,
}

impl CapabilityTable {
    /// Build the table from the names a module exports.
    pub fn from_exports<I, S>(exports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let functions = exports
            .into_iter()
            .filter(|name| !name.as_ref().is_empty())
            .map(|name| {
                let name = name.as_ref();
                (name.to_string(), ExtensionFunction::parse(name))
            })
            .collect();
        Self { functions }
    }

    /// Resolve a function name, `None` when the module does not export it.
    pub fn resolve(&self, name: &str) -> Option<&ExtensionFunction> {
        self.functions.get(name)
    }

    pub fn supports(&self, function: &ExtensionFunction) -> bool {
        self.functions.contains_key(function.name())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Required functions the module does not export.
    pub fn missing_required(&self) -> Vec<ExtensionFunction> {
        [
            ExtensionFunction::GetPopularManga,
            ExtensionFunction::SearchManga,
            ExtensionFunction::GetMangaDetails,
            ExtensionFunction::GetChapterList,
            ExtensionFunction::GetChapterPages,
        ]
        .into_iter()
        .filter(|f| !self.supports(f))
        .collect()
    }

    /// Capabilities declared in the manifest but not backed by an export.
    pub fn undeclared_gaps(&self, declared: &ManifestCapabilities) -> Vec<ExtensionFunction> {
        let mut gaps = Vec::new();
        if declared.streaming && !self.supports(&ExtensionFunction::GetChapterPagesStreaming) {
            gaps.push(ExtensionFunction::GetChapterPagesStreaming);
        }
        if declared.filters && !self.supports(&ExtensionFunction::GetFilters) {
            gaps.push(ExtensionFunction::GetFilters);
        }
        gaps
    }
}
