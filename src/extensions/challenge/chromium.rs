//! Chromium-backed rendering surfaces (feature `chromium`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::extensions::bridge::NetworkIdentity;
use crate::extensions::error::{ExtensionError, ExtensionResult};

use super::surface::{
    LoadFailure, PageSnapshot, RenderSurface, SurfaceCookie, SurfaceFactory, SurfaceMode,
};

const SNAPSHOT_SCRIPT: &str = r#"JSON.stringify({
    contentType: document.contentType || "",
    text: document.body ? document.body.innerText : "",
    html: document.documentElement ? document.documentElement.outerHTML : ""
})"#;

fn surface_err(e: impl std::fmt::Display) -> ExtensionError {
    ExtensionError::Surface(e.to_string())
}

/// Launches a dedicated Chromium process per surface.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChromiumSurfaces;

#[async_trait]
impl SurfaceFactory for ChromiumSurfaces {
    async fn open(
        &self,
        url: &str,
        mode: SurfaceMode,
        identity: &NetworkIdentity,
    ) -> ExtensionResult<Box<dyn RenderSurface>> {
        let mut builder =
            BrowserConfig::builder().arg(format!("--user-agent={}", identity.user_agent()));
        if mode == SurfaceMode::Visible {
            builder = builder.with_head().window_size(1000, 760);
        }
        let config = builder.build().map_err(surface_err)?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(surface_err)?;

        let closed = Arc::new(AtomicBool::new(false));
        let handler_task = tokio::spawn({
            let closed = closed.clone();
            async move {
                while let Some(event) = handler.next().await {
                    if event.is_err() {
                        break;
                    }
                }
                closed.store(true, Ordering::SeqCst);
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(surface_err)?;

        // Carry the identity's cookies (clearance included) into the page
        let seeded = seed_cookies(url, identity)?;
        if !seeded.is_empty() {
            page.set_cookies(seeded).await.map_err(surface_err)?;
        }

        let surface = ChromiumSurface {
            browser: tokio::sync::Mutex::new(browser),
            page,
            closed,
            failure: Mutex::new(None),
            handler_task,
        };

        if let Err(e) = surface.page.goto(url).await {
            tracing::debug!(url, error = %e, "surface navigation failed");
            surface.record_failure(LoadFailure {
                main_frame: true,
                url: url.to_string(),
                description: e.to_string(),
            });
        }

        Ok(Box::new(surface))
    }
}

fn seed_cookies(url: &str, identity: &NetworkIdentity) -> ExtensionResult<Vec<CookieParam>> {
    let Ok(parsed) = url::Url::parse(url) else {
        return Ok(Vec::new());
    };
    identity
        .surface_cookies(&parsed)
        .into_iter()
        .map(|cookie| {
            CookieParam::builder()
                .name(cookie.name)
                .value(cookie.value)
                .url(url)
                .path(cookie.path)
                .secure(cookie.secure)
                .build()
                .map_err(surface_err)
        })
        .collect()
}

struct ChromiumSurface {
    browser: tokio::sync::Mutex<Browser>,
    page: Page,
    closed: Arc<AtomicBool>,
    failure: Mutex<Option<LoadFailure>>,
    handler_task: JoinHandle<()>,
}

impl ChromiumSurface {
    fn record_failure(&self, failure: LoadFailure) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(failure);
    }

    fn check<T>(&self, result: chromiumoxide::error::Result<T>) -> ExtensionResult<T> {
        result.map_err(|e| {
            // A dead connection means the window is gone
            if self.handler_task.is_finished() {
                self.closed.store(true, Ordering::SeqCst);
            }
            surface_err(e)
        })
    }
}

#[derive(serde::Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawSnapshot {
    content_type: String,
    text: String,
    html: String,
}

#[async_trait]
impl RenderSurface for ChromiumSurface {
    async fn title(&self) -> ExtensionResult<String> {
        Ok(self.check(self.page.get_title().await)?.unwrap_or_default())
    }

    async fn current_url(&self) -> ExtensionResult<String> {
        Ok(self.check(self.page.url().await)?.unwrap_or_default())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_load_failure(&self) -> Option<LoadFailure> {
        self.failure.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn snapshot(&self) -> ExtensionResult<PageSnapshot> {
        let result = self.check(self.page.evaluate(SNAPSHOT_SCRIPT).await)?;
        let raw: String = result.into_value().map_err(surface_err)?;
        let raw: RawSnapshot = serde_json::from_str(&raw)?;

        Ok(PageSnapshot {
            url: self.current_url().await?,
            title: self.title().await?,
            content_type: raw.content_type,
            text: raw.text,
            html: raw.html,
        })
    }

    async fn cookies(&self) -> ExtensionResult<Vec<SurfaceCookie>> {
        let cookies = self.check(self.page.get_cookies().await)?;
        Ok(cookies
            .into_iter()
            .map(|c| SurfaceCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                secure: c.secure,
                http_only: c.http_only,
                expires: (c.expires > 0.0).then_some(c.expires),
            })
            .collect())
    }

    async fn close(&self) -> ExtensionResult<()> {
        let mut browser = self.browser.lock().await;
        let result = browser.close().await;
        self.closed.store(true, Ordering::SeqCst);
        self.handler_task.abort();
        result.map(|_| ()).map_err(surface_err)
    }
}

impl Drop for ChromiumSurface {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}
