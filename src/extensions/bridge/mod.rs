//! Capability bridge.
//!
//! The only path from extension code to the network. A sandbox emits
//! requests on its [`BridgeChannel`]; the host-side [`Bridge`] performs them
//! against the sandbox's allowed domains and fills the response into the
//! sandbox's correlation table.
//!
//! ```text
//! sandbox ──emit──▶ pump ──▶ Bridge::server_fetch / browser_fetch / request_session
//!    ▲                              │
//!    └──── await(request_id) ◀── CorrelationTable::fill
//! ```

mod channel;
mod correlation;
mod network;
mod pump;

use std::sync::Arc;

use url::Url;

use crate::config::{BridgeConfig, ChallengeConfig};
use crate::extensions::challenge::{
    load_failure_is_fatal, ChallengeSolver, PageSnapshot, RenderSurface, SurfaceFactory,
    SurfaceMode,
};
use crate::extensions::error::ExtensionResult;
use crate::extensions::ipc::{ChallengeReply, FetchMethod, FetchRequest, FetchResponse};
use crate::extensions::permissions::AllowedDomainSet;

pub use channel::BridgeChannel;
pub use correlation::{CorrelationTable, PollTiming, RequestIds, RequestKind};
pub use network::{
    body_has_challenge_markers, is_challenge_page, is_challenge_response, is_provider_challenge,
    HttpTransport, NetworkIdentity, ReqwestTransport,
};
pub use pump::{spawn_pump, PumpContext};

/// Who a bridged request is made for.
#[derive(Clone, Copy)]
pub struct FetchScope<'a> {
    pub extension_id: &'a str,
    pub allowed: &'a AllowedDomainSet,
    pub identity: &'a NetworkIdentity,
}

/// Host side of the capability bridge, shared by every sandbox.
pub struct Bridge {
    config: BridgeConfig,
    transport: Arc<dyn HttpTransport>,
    identity: NetworkIdentity,
    solver: ChallengeSolver,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        challenge: ChallengeConfig,
        transport: Arc<dyn HttpTransport>,
        surfaces: Arc<dyn SurfaceFactory>,
    ) -> ExtensionResult<Self> {
        let identity = NetworkIdentity::new(&config)?;
        let solver = ChallengeSolver::new(challenge, surfaces);
        Ok(Self {
            config,
            transport,
            identity,
            solver,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The host's shared network identity.
    pub fn identity(&self) -> &NetworkIdentity {
        &self.identity
    }

    /// A fresh identity for a new sandbox.
    pub fn new_identity(&self) -> ExtensionResult<NetworkIdentity> {
        NetworkIdentity::new(&self.config)
    }

    pub fn solver(&self) -> &ChallengeSolver {
        &self.solver
    }

    /// Plain HTTP fetch through the sandbox's identity.
    ///
    /// A challenge response triggers one solve of the target's origin and a
    /// single retry with the harvested cookies.
    pub async fn server_fetch(&self, scope: FetchScope<'_>, request: FetchRequest) -> FetchResponse {
        let url = match scope.allowed.check_url(&request.url) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(extension = scope.extension_id, url = %request.url, "blocked serverFetch");
                return FetchResponse::rejected(&request.url, &e);
            }
        };

        let response = match self.transport.execute(scope.identity, &request).await {
            Ok(response) => response,
            Err(e) => return FetchResponse::failed(&request.url, 0, e.to_string()),
        };

        let challenged = if self.config.require_provider_headers {
            is_provider_challenge(&response)
        } else {
            is_challenge_response(&response)
        };
        if !challenged {
            return response;
        }

        tracing::info!(
            extension = scope.extension_id,
            url = %request.url,
            status = response.status,
            "challenge detected, solving"
        );

        let outcome = self.solver.solve(&origin_of(&url), scope.identity).await;
        if !outcome.success {
            return response;
        }
        outcome.install(&[&self.identity, scope.identity]);

        match self.transport.execute(scope.identity, &request).await {
            Ok(retried) => retried,
            Err(e) => FetchResponse::failed(&request.url, 0, e.to_string()),
        }
    }

    /// Fetch through a hidden rendering surface, waiting for any challenge
    /// the page shows to clear.
    pub async fn browser_fetch(&self, scope: FetchScope<'_>, request: FetchRequest) -> FetchResponse {
        if let Err(e) = scope.allowed.check_url(&request.url) {
            tracing::warn!(extension = scope.extension_id, url = %request.url, "blocked browserFetch");
            return FetchResponse::rejected(&request.url, &e);
        }

        if request.method != FetchMethod::Get {
            return FetchResponse::failed(
                &request.url,
                405,
                format!("browserFetch cannot send {}", request.method.as_str()),
            );
        }

        let surface = match self
            .solver
            .surfaces()
            .open(&request.url, SurfaceMode::Hidden, scope.identity)
            .await
        {
            Ok(surface) => surface,
            Err(e) => return FetchResponse::failed(&request.url, 0, e.to_string()),
        };

        let interval = self.solver.config().poll_interval();
        let mut challenged = false;
        let mut result = None;

        for poll in 0..self.config.browser_settle_polls {
            if poll > 0 {
                tokio::time::sleep(interval).await;
            }

            if surface.is_closed() {
                result = Some(FetchResponse::failed(&request.url, 0, "Rendering surface closed"));
                break;
            }

            if let Some(failure) = surface.take_load_failure() {
                if load_failure_is_fatal(&failure, challenged) {
                    result = Some(FetchResponse::failed(&request.url, 502, failure.to_string()));
                    break;
                }
                tracing::debug!(url = %request.url, failure = %failure, "ignoring load failure");
            }

            let snapshot = match surface.snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::debug!(url = %request.url, error = %e, "snapshot failed");
                    continue;
                }
            };

            if is_challenge_page(&snapshot.title, &snapshot.url) {
                challenged = true;
                continue;
            }

            result = Some(snapshot_response(&request.url, snapshot));
            break;
        }

        // Keep whatever the page set, clearance included, for later requests
        if result.as_ref().is_some_and(|r| r.ok) {
            self.harvest(surface.as_ref(), &request.url, scope.identity).await;
        }

        if let Err(e) = surface.close().await {
            tracing::debug!(url = %request.url, error = %e, "failed to close surface");
        }

        result.unwrap_or_else(|| {
            tracing::warn!(extension = scope.extension_id, url = %request.url, "rendered fetch never cleared");
            FetchResponse::failed(&request.url, 503, "Challenge did not clear")
        })
    }

    /// Explicit challenge solve requested by extension code.
    pub async fn request_session(&self, scope: FetchScope<'_>, url: &str) -> ChallengeReply {
        if let Err(e) = scope.allowed.check_url(url) {
            tracing::warn!(extension = scope.extension_id, url, "blocked challenge session");
            return ChallengeReply {
                success: false,
                ok: false,
                status: Some(403),
                cookies: None,
                message: Some(e.to_string()),
            };
        }

        let outcome = self.solver.solve(url, scope.identity).await;
        outcome.install(&[&self.identity, scope.identity]);
        outcome.reply()
    }

    async fn harvest(&self, surface: &dyn RenderSurface, url: &str, identity: &NetworkIdentity) {
        let Ok(parsed) = Url::parse(url) else {
            return;
        };
        match surface.cookies().await {
            Ok(cookies) if !cookies.is_empty() => {
                identity.add_cookies(&parsed, &cookies);
                self.identity.add_cookies(&parsed, &cookies);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(url, error = %e, "failed to read surface cookies"),
        }
    }
}

/// The guarded fetch primitive extension code calls directly.
///
/// Checks the allowed domains before touching the network and never solves
/// challenges; that is what `serverFetch` is for.
pub async fn guarded_fetch(
    transport: &dyn HttpTransport,
    scope: FetchScope<'_>,
    request: &FetchRequest,
) -> FetchResponse {
    if let Err(e) = scope.allowed.check_url(&request.url) {
        tracing::warn!(extension = scope.extension_id, url = %request.url, "blocked fetch");
        return FetchResponse::rejected(&request.url, &e);
    }

    match transport.execute(scope.identity, request).await {
        Ok(response) => response,
        Err(e) => FetchResponse::failed(&request.url, 0, e.to_string()),
    }
}

/// `scheme://host[:port]/` of a URL.
fn origin_of(url: &Url) -> String {
    format!("{}/", url.origin().ascii_serialization())
}

/// Turn a rendered page into a response body.
///
/// JSON and plain-text documents yield their text (browsers wrap them in a
/// `<pre>`); anything else yields the serialized document.
fn snapshot_response(requested: &str, snapshot: PageSnapshot) -> FetchResponse {
    let content_type = snapshot.content_type.to_ascii_lowercase();
    let text_like = content_type.contains("json") || content_type.starts_with("text/plain");
    let looks_json = {
        let trimmed = snapshot.text.trim_start();
        (trimmed.starts_with('{') || trimmed.starts_with('['))
            && serde_json::from_str::<serde_json::Value>(snapshot.text.trim()).is_ok()
    };

    let body = if text_like || looks_json {
        snapshot.text
    } else {
        snapshot.html
    };

    let mut headers = std::collections::HashMap::new();
    if !snapshot.content_type.is_empty() {
        headers.insert("content-type".to_string(), snapshot.content_type);
    }

    FetchResponse {
        ok: true,
        status: 200,
        status_text: "OK".to_string(),
        url: if snapshot.url.is_empty() {
            requested.to_string()
        } else {
            snapshot.url
        },
        headers,
        body,
        encoding: None,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::challenge::{LoadFailure, SurfaceCookie};
    use crate::extensions::test_support::{RecordingTransport, ScriptedSurfaces, SurfacePlan};

    fn fast_challenge() -> ChallengeConfig {
        ChallengeConfig {
            solve_timeout_secs: 1,
            poll_interval_ms: 5,
            debounce_secs: 5,
        }
    }

    fn bridge(transport: Arc<RecordingTransport>, surfaces: Arc<ScriptedSurfaces>) -> Bridge {
        let config = BridgeConfig {
            browser_settle_polls: 5,
            ..Default::default()
        };
        Bridge::new(config, fast_challenge(), transport, surfaces).unwrap()
    }

    fn allowed() -> AllowedDomainSet {
        AllowedDomainSet::from_patterns(["demo.test", "*.demo.test"])
    }

    #[tokio::test]
    async fn test_disallowed_domain_never_reaches_network() {
        let transport = Arc::new(RecordingTransport::ok("unused"));
        let surfaces = Arc::new(ScriptedSurfaces::new(SurfacePlan::default()));
        let bridge = bridge(transport.clone(), surfaces.clone());
        let identity = bridge.new_identity().unwrap();
        let allowed = allowed();
        let scope = FetchScope {
            extension_id: "demo",
            allowed: &allowed,
            identity: &identity,
        };

        let response = bridge
            .server_fetch(scope, FetchRequest::get("https://evil.test/steal"))
            .await;
        assert!(!response.ok);
        assert_eq!(response.status, 403);

        let response = bridge
            .browser_fetch(scope, FetchRequest::get("https://evil.test/steal"))
            .await;
        assert_eq!(response.status, 403);

        let reply = bridge.request_session(scope, "https://evil.test").await;
        assert!(!reply.success);
        assert!(!reply.ok);
        assert_eq!(reply.status, Some(403));
        assert!(reply.message.is_some());

        assert_eq!(transport.attempts(), 0);
        assert!(surfaces.opened().is_empty());
    }

    #[tokio::test]
    async fn test_server_fetch_passes_through() {
        let transport = Arc::new(RecordingTransport::ok("<h1>hello</h1>"));
        let surfaces = Arc::new(ScriptedSurfaces::new(SurfacePlan::default()));
        let bridge = bridge(transport.clone(), surfaces.clone());
        let identity = bridge.new_identity().unwrap();
        let allowed = allowed();

        let response = bridge
            .server_fetch(
                FetchScope {
                    extension_id: "demo",
                    allowed: &allowed,
                    identity: &identity,
                },
                FetchRequest::get("https://api.demo.test/list"),
            )
            .await;
        assert!(response.ok);
        assert_eq!(response.body, "<h1>hello</h1>");
        assert_eq!(transport.attempts(), 1);
        assert!(surfaces.opened().is_empty());
    }

    #[tokio::test]
    async fn test_server_fetch_solves_challenge_and_retries_once() {
        let transport = Arc::new(RecordingTransport::challenged_then("<h1>content</h1>"));
        let surfaces = Arc::new(ScriptedSurfaces::new(SurfacePlan {
            titles: vec!["Just a moment...".into(), "Demo".into()],
            cookies: vec![SurfaceCookie {
                name: "cf_clearance".into(),
                value: "ok".into(),
                domain: "demo.test".into(),
                path: "/".into(),
                ..Default::default()
            }],
            ..Default::default()
        }));
        let bridge = bridge(transport.clone(), surfaces.clone());
        let identity = bridge.new_identity().unwrap();
        let allowed = allowed();

        let response = bridge
            .server_fetch(
                FetchScope {
                    extension_id: "demo",
                    allowed: &allowed,
                    identity: &identity,
                },
                FetchRequest::get("https://demo.test/manga/1"),
            )
            .await;

        assert!(response.ok);
        assert_eq!(response.body, "<h1>content</h1>");
        assert_eq!(transport.attempts(), 2);
        assert_eq!(surfaces.opened(), vec![SurfaceMode::Visible]);

        let url = Url::parse("https://demo.test/").unwrap();
        assert!(identity.cookie_header(&url).unwrap().contains("cf_clearance=ok"));
        assert!(bridge.identity().cookie_header(&url).unwrap().contains("cf_clearance=ok"));
    }

    #[tokio::test]
    async fn test_bare_503_is_solved_unless_provider_headers_required() {
        let surfaces = Arc::new(ScriptedSurfaces::new(SurfacePlan {
            titles: vec!["Demo".into()],
            ..Default::default()
        }));
        let transport =
            Arc::new(RecordingTransport::ok("<h1>content</h1>").then_respond(503, &[("server", "nginx")], "busy"));
        let bridge = bridge(transport.clone(), surfaces.clone());
        let identity = bridge.new_identity().unwrap();
        let allowed = allowed();
        let scope = FetchScope {
            extension_id: "demo",
            allowed: &allowed,
            identity: &identity,
        };

        let response = bridge
            .server_fetch(scope, FetchRequest::get("https://demo.test/manga/1"))
            .await;
        assert_eq!(response.body, "<h1>content</h1>");
        assert_eq!(transport.attempts(), 2);
        assert_eq!(surfaces.opened(), vec![SurfaceMode::Visible]);

        // Strict detection leaves a plain 503 alone
        let transport =
            Arc::new(RecordingTransport::ok("<h1>content</h1>").then_respond(503, &[("server", "nginx")], "busy"));
        let surfaces = Arc::new(ScriptedSurfaces::new(SurfacePlan::default()));
        let config = BridgeConfig {
            require_provider_headers: true,
            ..Default::default()
        };
        let strict = Bridge::new(config, fast_challenge(), transport.clone(), surfaces.clone()).unwrap();

        let response = strict
            .server_fetch(scope, FetchRequest::get("https://demo.test/manga/1"))
            .await;
        assert_eq!(response.status, 503);
        assert_eq!(transport.attempts(), 1);
        assert!(surfaces.opened().is_empty());
    }

    #[tokio::test]
    async fn test_surfaces_present_the_sandbox_identity() {
        let surfaces = Arc::new(ScriptedSurfaces::new(SurfacePlan {
            titles: vec!["Demo".into()],
            snapshot: PageSnapshot {
                content_type: "text/html".into(),
                html: "<html><body>ok</body></html>".into(),
                ..Default::default()
            },
            cookies: vec![SurfaceCookie {
                name: "session".into(),
                value: "rendered".into(),
                domain: "demo.test".into(),
                path: "/".into(),
                ..Default::default()
            }],
            ..Default::default()
        }));
        let bridge = bridge(Arc::new(RecordingTransport::ok("")), surfaces.clone());
        let identity = bridge.new_identity().unwrap();
        let url = Url::parse("https://demo.test/").unwrap();
        identity.add_cookie_header(&url, "cf_clearance=earlier");
        let allowed = allowed();
        let scope = FetchScope {
            extension_id: "demo",
            allowed: &allowed,
            identity: &identity,
        };

        let response = bridge
            .browser_fetch(scope, FetchRequest::get("https://demo.test/chapter/1"))
            .await;
        assert!(response.ok, "{:?}", response.error);

        bridge.request_session(scope, "https://demo.test/").await;

        // Both surfaces opened carrying the clearance the sandbox already held
        let seeded = surfaces.seeded();
        assert_eq!(seeded.len(), 2);
        for cookies in &seeded {
            assert!(cookies.iter().any(|c| c.name == "cf_clearance" && c.value == "earlier"));
        }
        assert_eq!(surfaces.user_agents(), vec![identity.user_agent().to_string(); 2]);

        // Cookies the rendered page set are kept for later fetches
        let header = identity.cookie_header(&url).unwrap();
        assert!(header.contains("session=rendered"));
        assert!(bridge.identity().cookie_header(&url).unwrap().contains("session=rendered"));
    }

    #[tokio::test]
    async fn test_browser_fetch_waits_for_challenge_and_extracts_json() {
        let transport = Arc::new(RecordingTransport::ok("unused"));
        let surfaces = Arc::new(ScriptedSurfaces::new(SurfacePlan {
            titles: vec!["Just a moment...".into(), "".into()],
            snapshot: PageSnapshot {
                url: "https://demo.test/api".into(),
                content_type: "application/json".into(),
                text: r#"{"items":[1,2]}"#.into(),
                html: r#"<html><body><pre>{"items":[1,2]}</pre></body></html>"#.into(),
                ..Default::default()
            },
            load_failure: Some(LoadFailure {
                main_frame: true,
                url: "https://demo.test/api".into(),
                description: "net::ERR_ABORTED".into(),
            }),
            failure_after_polls: 1,
            ..Default::default()
        }));
        let bridge = bridge(transport.clone(), surfaces.clone());
        let identity = bridge.new_identity().unwrap();
        let allowed = allowed();

        let response = bridge
            .browser_fetch(
                FetchScope {
                    extension_id: "demo",
                    allowed: &allowed,
                    identity: &identity,
                },
                FetchRequest::get("https://demo.test/api"),
            )
            .await;

        assert!(response.ok, "{:?}", response.error);
        assert_eq!(response.body, r#"{"items":[1,2]}"#);
        assert_eq!(surfaces.opened(), vec![SurfaceMode::Hidden]);
        assert_eq!(surfaces.closed_count(), 1);
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn test_browser_fetch_main_frame_failure_without_challenge() {
        let surfaces = Arc::new(ScriptedSurfaces::new(SurfacePlan {
            titles: vec!["".into()],
            load_failure: Some(LoadFailure {
                main_frame: true,
                url: "https://demo.test/".into(),
                description: "net::ERR_NAME_NOT_RESOLVED".into(),
            }),
            ..Default::default()
        }));
        let bridge = bridge(Arc::new(RecordingTransport::ok("")), surfaces);
        let identity = bridge.new_identity().unwrap();
        let allowed = allowed();

        let response = bridge
            .browser_fetch(
                FetchScope {
                    extension_id: "demo",
                    allowed: &allowed,
                    identity: &identity,
                },
                FetchRequest::get("https://demo.test/"),
            )
            .await;
        assert_eq!(response.status, 502);
        assert!(response.error.unwrap().contains("ERR_NAME_NOT_RESOLVED"));
    }

    #[tokio::test]
    async fn test_browser_fetch_gives_up_when_challenge_persists() {
        let surfaces = Arc::new(ScriptedSurfaces::new(SurfacePlan {
            titles: vec!["Just a moment...".into()],
            ..Default::default()
        }));
        let bridge = bridge(Arc::new(RecordingTransport::ok("")), surfaces.clone());
        let identity = bridge.new_identity().unwrap();
        let allowed = allowed();

        let response = bridge
            .browser_fetch(
                FetchScope {
                    extension_id: "demo",
                    allowed: &allowed,
                    identity: &identity,
                },
                FetchRequest::get("https://demo.test/"),
            )
            .await;
        assert_eq!(response.status, 503);
        assert_eq!(surfaces.closed_count(), 1);
    }

    #[tokio::test]
    async fn test_guarded_fetch() {
        let transport = RecordingTransport::ok("data");
        let identity = NetworkIdentity::new(&BridgeConfig::default()).unwrap();
        let allowed = AllowedDomainSet::from_patterns(["demo.test"]);
        let scope = FetchScope {
            extension_id: "demo",
            allowed: &allowed,
            identity: &identity,
        };

        let ok = guarded_fetch(&transport, scope, &FetchRequest::get("https://demo.test/api")).await;
        assert_eq!(ok.body, "data");

        let blocked = guarded_fetch(&transport, scope, &FetchRequest::get("https://evil.test")).await;
        assert_eq!(blocked.status, 403);
        assert_eq!(transport.attempts(), 1);
    }

    #[test]
    fn test_snapshot_response_prefers_html_for_documents() {
        let response = snapshot_response(
            "https://demo.test/",
            PageSnapshot {
                url: String::new(),
                title: "Demo".into(),
                content_type: "text/html".into(),
                text: "Chapter 1".into(),
                html: "<html><body>Chapter 1</body></html>".into(),
            },
        );
        assert_eq!(response.body, "<html><body>Chapter 1</body></html>");
        assert_eq!(response.url, "https://demo.test/");
        assert_eq!(response.header("Content-Type"), Some("text/html"));
    }

    #[test]
    fn test_origin_of() {
        let url = Url::parse("https://demo.test:8443/a/b?c=1").unwrap();
        assert_eq!(origin_of(&url), "https://demo.test:8443/");
    }
}
