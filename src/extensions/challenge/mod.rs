//! Anti-bot challenge solving.
//!
//! When a site answers with an interstitial, the host opens a visible
//! surface at the URL and lets the user (or the page's own script) clear it.
//! Once the page shows a real title the surface's cookies are harvested so
//! later requests carry the clearance. Solves for one URL are debounced:
//! a request arriving while a solve is running, or within the debounce
//! window after it started, shares that attempt's outcome.

#[cfg(feature = "chromium")]
pub mod chromium;
mod surface;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use url::Url;

use crate::config::ChallengeConfig;
use crate::extensions::bridge::{is_challenge_page, NetworkIdentity};
use crate::extensions::ipc::ChallengeReply;

pub use surface::{
    cookie_header, load_failure_is_fatal, LoadFailure, PageSnapshot, RenderSurface,
    SurfaceCookie, SurfaceFactory, SurfaceMode, Unavailable,
};

/// Result of one solve attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeOutcome {
    pub url: String,
    pub success: bool,
    pub cookies: Vec<SurfaceCookie>,
    pub message: Option<String>,
}

impl ChallengeOutcome {
    fn solved(url: &str, cookies: Vec<SurfaceCookie>) -> Self {
        Self {
            url: url.to_string(),
            success: true,
            cookies,
            message: None,
        }
    }

    fn failed(url: &str, message: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            success: false,
            cookies: Vec::new(),
            message: Some(message.into()),
        }
    }

    /// Copy harvested cookies into each identity's jar.
    pub fn install(&self, identities: &[&NetworkIdentity]) {
        if !self.success || self.cookies.is_empty() {
            return;
        }
        let Ok(url) = Url::parse(&self.url) else {
            return;
        };
        for identity in identities {
            identity.add_cookies(&url, &self.cookies);
        }
    }

    /// Reply shape handed back to extension code.
    pub fn reply(&self) -> ChallengeReply {
        ChallengeReply {
            success: self.success,
            ok: self.success,
            status: None,
            cookies: self.success.then(|| cookie_header(&self.cookies)),
            message: self.message.clone(),
        }
    }
}

struct Attempt {
    started: Instant,
    outcome: Shared<BoxFuture<'static, ChallengeOutcome>>,
}

/// Runs challenge solves with per-URL debouncing.
pub struct ChallengeSolver {
    config: ChallengeConfig,
    surfaces: Arc<dyn SurfaceFactory>,
    attempts: Mutex<HashMap<String, Attempt>>,
}

impl ChallengeSolver {
    pub fn new(config: ChallengeConfig, surfaces: Arc<dyn SurfaceFactory>) -> Self {
        Self {
            config,
            surfaces,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn surfaces(&self) -> &Arc<dyn SurfaceFactory> {
        &self.surfaces
    }

    pub fn config(&self) -> &ChallengeConfig {
        &self.config
    }

    /// Solve the challenge at `url`, joining a recent attempt if one exists.
    ///
    /// A new attempt's window presents as `identity`. Joined attempts keep
    /// the identity of whoever started them.
    pub async fn solve(&self, url: &str, identity: &NetworkIdentity) -> ChallengeOutcome {
        let outcome = {
            let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            let window = self.config.debounce_window();

            attempts.retain(|_, a| a.started.elapsed() < window || a.outcome.peek().is_none());

            match attempts.get(url) {
                Some(attempt) => {
                    tracing::debug!(url, "joining recent challenge attempt");
                    attempt.outcome.clone()
                }
                None => {
                    let outcome = self.spawn_attempt(url, identity);
                    attempts.insert(
                        url.to_string(),
                        Attempt {
                            started: Instant::now(),
                            outcome: outcome.clone(),
                        },
                    );
                    outcome
                }
            }
        };

        outcome.await
    }

    fn spawn_attempt(
        &self,
        url: &str,
        identity: &NetworkIdentity,
    ) -> Shared<BoxFuture<'static, ChallengeOutcome>> {
        let task = tokio::spawn(run_solve(
            self.surfaces.clone(),
            url.to_string(),
            self.config.clone(),
            identity.clone(),
        ));

        let url = url.to_string();
        async move {
            task.await
                .unwrap_or_else(|e| ChallengeOutcome::failed(&url, format!("Challenge task failed: {}", e)))
        }
        .boxed()
        .shared()
    }
}

async fn run_solve(
    surfaces: Arc<dyn SurfaceFactory>,
    url: String,
    config: ChallengeConfig,
    identity: NetworkIdentity,
) -> ChallengeOutcome {
    tracing::info!(url = %url, "opening challenge window");

    let surface = match surfaces.open(&url, SurfaceMode::Visible, &identity).await {
        Ok(surface) => surface,
        Err(e) => return ChallengeOutcome::failed(&url, e.to_string()),
    };

    let deadline = Instant::now() + config.solve_timeout();

    let outcome = loop {
        tokio::time::sleep(config.poll_interval()).await;

        if surface.is_closed() {
            break ChallengeOutcome::failed(&url, "Challenge window was closed");
        }

        if let Some(failure) = surface.take_load_failure() {
            tracing::debug!(url = %url, failure = %failure, "challenge window load failure");
        }

        let title = surface.title().await.unwrap_or_default();
        let current = surface.current_url().await.unwrap_or_default();

        if !title.trim().is_empty() && !is_challenge_page(&title, &current) {
            match surface.cookies().await {
                Ok(cookies) => {
                    tracing::info!(url = %url, cookies = cookies.len(), "challenge cleared");
                    break ChallengeOutcome::solved(&url, cookies);
                }
                Err(e) => break ChallengeOutcome::failed(&url, e.to_string()),
            }
        }

        if Instant::now() >= deadline {
            tracing::warn!(url = %url, "challenge not cleared before timeout");
            break ChallengeOutcome::failed(
                &url,
                format!(
                    "Challenge not cleared within {}s",
                    config.solve_timeout().as_secs()
                ),
            );
        }
    };

    if !surface.is_closed() {
        if let Err(e) = surface.close().await {
            tracing::debug!(url = %url, error = %e, "failed to close challenge window");
        }
    }

    outcome
}
