//! Rendering surfaces: real browser pages the host drives on a sandbox's behalf.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::extensions::bridge::NetworkIdentity;
use crate::extensions::error::{ExtensionError, ExtensionResult};

/// Whether a surface is shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceMode {
    /// A window the user can interact with, used for challenge solving.
    Visible,
    /// An offscreen page used for rendered fetches.
    Hidden,
}

/// A navigation failure reported by a surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    /// Whether the failure concerns the top-level document.
    pub main_frame: bool,
    pub url: String,
    pub description: String,
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description, self.url)
    }
}

/// Decide whether a load failure should abort a rendered fetch.
///
/// Challenge interstitials routinely abort their own navigations while they
/// redirect, so failures seen after a challenge was detected are ignored, as
/// are subresource failures. A main-frame failure on a page that never
/// showed a challenge is a real error.
pub fn load_failure_is_fatal(failure: &LoadFailure, challenged: bool) -> bool {
    failure.main_frame && !challenged
}

/// Content of a rendered page at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    /// Document content type, e.g. `application/json`.
    pub content_type: String,
    /// `document.body.innerText`.
    pub text: String,
    /// Serialized document.
    pub html: String,
}

/// A browser cookie as reported by a surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    /// Unix timestamp in seconds, `None` for session cookies.
    #[serde(default)]
    pub expires: Option<f64>,
}

impl SurfaceCookie {
    /// Render as a `Set-Cookie` value.
    pub fn to_set_cookie(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if !self.domain.is_empty() {
            out.push_str("; Domain=");
            out.push_str(&self.domain);
        }
        out.push_str("; Path=");
        out.push_str(if self.path.is_empty() { "/" } else { &self.path });
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out
    }
}

/// Join cookies into a `Cookie` request header value.
pub fn cookie_header(cookies: &[SurfaceCookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A live browser page.
#[async_trait]
pub trait RenderSurface: Send + Sync {
    async fn title(&self) -> ExtensionResult<String>;

    async fn current_url(&self) -> ExtensionResult<String>;

    /// Whether the user (or the browser) closed the page.
    fn is_closed(&self) -> bool;

    /// Take the most recent navigation failure, if any.
    fn take_load_failure(&self) -> Option<LoadFailure>;

    async fn snapshot(&self) -> ExtensionResult<PageSnapshot>;

    async fn cookies(&self) -> ExtensionResult<Vec<SurfaceCookie>>;

    async fn close(&self) -> ExtensionResult<()>;
}

/// Opens rendering surfaces.
#[async_trait]
pub trait SurfaceFactory: Send + Sync {
    /// Open a page at `url` that presents as `identity`: its user agent, and
    /// the cookies its jar holds for `url` set before navigation.
    async fn open(
        &self,
        url: &str,
        mode: SurfaceMode,
        identity: &NetworkIdentity,
    ) -> ExtensionResult<Box<dyn RenderSurface>>;
}

/// Factory used when the crate is built without a browser backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unavailable;

#[async_trait]
impl SurfaceFactory for Unavailable {
    async fn open(
        &self,
        url: &str,
        _mode: SurfaceMode,
        _identity: &NetworkIdentity,
    ) -> ExtensionResult<Box<dyn RenderSurface>> {
        Err(ExtensionError::Surface(format!(
            "no rendering surface available for {} (build with the `chromium` feature)",
            url
        )))
    }
}
