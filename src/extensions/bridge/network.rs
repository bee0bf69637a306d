//! Host-side HTTP: network identities, the transport seam and challenge detection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use reqwest::cookie::{CookieStore, Jar};
use url::Url;

use crate::config::BridgeConfig;
use crate::extensions::challenge::SurfaceCookie;
use crate::extensions::error::ExtensionResult;
use crate::extensions::ipc::{FetchMethod, FetchRequest, FetchResponse, ResponseType};

/// Titles shown by anti-bot interstitials.
const CHALLENGE_TITLES: &[&str] = &[
    "just a moment",
    "attention required",
    "checking your browser",
    "please wait",
    "ddos-guard",
    "one more step",
    "security check",
];

/// Markup only present on interstitial pages. Cleared pages behind the same
/// provider still load `challenge-platform` scripts, so that is not a marker.
const CHALLENGE_BODY_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "cf_chl_opt",
    "_cf_chl",
    "cf-challenge-running",
    "ddos-guard/js-challenge",
];

const CHALLENGE_URL_MARKERS: &[&str] = &["/cdn-cgi/challenge-platform", "__cf_chl"];

/// A cookie jar plus the client bound to it.
///
/// The host owns one shared identity; every sandbox gets its own so cookies
/// set by one extension's traffic never leak into another's.
#[derive(Clone)]
pub struct NetworkIdentity {
    jar: Arc<Jar>,
    client: reqwest::Client,
    user_agent: String,
}

impl NetworkIdentity {
    pub fn new(config: &BridgeConfig) -> ExtensionResult<Self> {
        let jar = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            jar,
            client,
            user_agent: config.user_agent.clone(),
        })
    }

    /// Same cookie jar, new client.
    ///
    /// A client's pooled connections belong to the runtime that opened them,
    /// so a sandbox thread with its own runtime needs its own client.
    pub fn rebind(&self, config: &BridgeConfig) -> ExtensionResult<Self> {
        let client = reqwest::Client::builder()
            .cookie_provider(self.jar.clone())
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            jar: self.jar.clone(),
            client,
            user_agent: config.user_agent.clone(),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Install cookies harvested from a rendering surface.
    pub fn add_cookies(&self, url: &Url, cookies: &[SurfaceCookie]) {
        for cookie in cookies {
            self.jar.add_cookie_str(&cookie.to_set_cookie(), url);
        }
    }

    /// Install a raw `name=value; name2=value2` cookie header.
    pub fn add_cookie_header(&self, url: &Url, header: &str) {
        for pair in header.split(';').map(str::trim).filter(|p| p.contains('=')) {
            self.jar.add_cookie_str(&format!("{}; Path=/", pair), url);
        }
    }

    /// Cookies this identity would send to `url`, in the form a rendering
    /// surface is seeded with.
    pub fn surface_cookies(&self, url: &Url) -> Vec<SurfaceCookie> {
        let Some(header) = self.cookie_header(url) else {
            return Vec::new();
        };
        let domain = url.host_str().unwrap_or_default();
        header
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .map(|(name, value)| SurfaceCookie {
                name: name.to_string(),
                value: value.to_string(),
                domain: domain.to_string(),
                path: "/".to_string(),
                secure: url.scheme() == "https",
                ..Default::default()
            })
            .collect()
    }

    /// Cookie header this identity would send to `url`.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        self.jar
            .cookies(url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }
}

/// Executes HTTP requests on behalf of a sandbox.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform the request. Transport failures are errors; any HTTP status,
    /// including 4xx and 5xx, is a response.
    async fn execute(
        &self,
        identity: &NetworkIdentity,
        request: &FetchRequest,
    ) -> ExtensionResult<FetchResponse>;
}

/// Transport backed by the identity's reqwest client.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReqwestTransport;

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        identity: &NetworkIdentity,
        request: &FetchRequest,
    ) -> ExtensionResult<FetchResponse> {
        let client = identity.client();
        let mut builder = match request.method {
            FetchMethod::Get => client.get(&request.url),
            FetchMethod::Post => client.post(&request.url),
            FetchMethod::Put => client.put(&request.url),
            FetchMethod::Delete => client.delete(&request.url),
            FetchMethod::Patch => client.patch(&request.url),
            FetchMethod::Head => client.head(&request.url),
            FetchMethod::Options => client.request(reqwest::Method::OPTIONS, &request.url),
        };

        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;

        let status = response.status();
        let final_url = response.url().to_string();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|val| (k.as_str().to_string(), val.to_string()))
            })
            .collect();

        let (body, encoding) = match request.response_type {
            ResponseType::Text => (response.text().await?, None),
            ResponseType::Base64 => {
                let bytes = response.bytes().await?;
                (
                    base64::engine::general_purpose::STANDARD.encode(&bytes),
                    Some("base64".to_string()),
                )
            }
        };

        Ok(FetchResponse {
            ok: status.is_success(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            url: final_url,
            headers,
            body,
            encoding,
            error: None,
        })
    }
}

/// Whether an HTTP response is an anti-bot interstitial rather than content.
///
/// Either the body carries challenge markup or the status is 403/503.
pub fn is_challenge_response(response: &FetchResponse) -> bool {
    has_body_markers(response) || matches!(response.status, 403 | 503)
}

/// Stricter form of [`is_challenge_response`]: a 403/503 only counts when a
/// known challenge provider sent it.
pub fn is_provider_challenge(response: &FetchResponse) -> bool {
    if has_body_markers(response) {
        return true;
    }

    if !matches!(response.status, 403 | 503) {
        return false;
    }

    if response
        .header("cf-mitigated")
        .is_some_and(|v| v.eq_ignore_ascii_case("challenge"))
    {
        return true;
    }

    response.header("server").is_some_and(|server| {
        let server = server.to_ascii_lowercase();
        server.contains("cloudflare") || server.contains("ddos-guard")
    })
}

fn has_body_markers(response: &FetchResponse) -> bool {
    response.encoding.is_none() && body_has_challenge_markers(&response.body)
}

pub fn body_has_challenge_markers(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    CHALLENGE_BODY_MARKERS.iter().any(|m| lower.contains(m))
}

/// Whether a rendered page still shows an interstitial.
pub fn is_challenge_page(title: &str, url: &str) -> bool {
    let title = title.trim().to_ascii_lowercase();
    if CHALLENGE_TITLES.iter().any(|t| title.contains(t)) {
        return true;
    }
    CHALLENGE_URL_MARKERS.iter().any(|m| url.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, headers: &[(&str, &str)], body: &str) -> FetchResponse {
        FetchResponse {
            ok: (200..300).contains(&status),
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_challenge_response_detection() {
        assert!(is_challenge_response(&response(503, &[("Server", "cloudflare")], "<html></html>")));
        assert!(is_challenge_response(&response(403, &[], "Forbidden")));
        assert!(is_challenge_response(&response(503, &[("server", "nginx")], "down")));
        assert!(is_challenge_response(&response(
            200,
            &[],
            "<script>window._cf_chl_opt = {}</script>"
        )));

        assert!(!is_challenge_response(&response(404, &[("server", "cloudflare")], "nope")));
        assert!(!is_challenge_response(&response(200, &[], "<h1>Chapter 1</h1>")));
    }

    #[test]
    fn test_provider_challenge_detection() {
        assert!(is_provider_challenge(&response(503, &[("Server", "cloudflare")], "<html></html>")));
        assert!(is_provider_challenge(&response(403, &[("cf-mitigated", "challenge")], "")));
        assert!(is_provider_challenge(&response(403, &[("server", "ddos-guard")], "")));
        assert!(is_provider_challenge(&response(200, &[], "<div id=\"cf-challenge-running\">")));

        // Plain errors from other servers are left alone
        assert!(!is_provider_challenge(&response(503, &[("server", "nginx")], "down")));
        assert!(!is_provider_challenge(&response(403, &[], "Forbidden")));
    }

    #[test]
    fn test_binary_body_is_not_scanned() {
        let mut resp = response(200, &[], "_cf_chl_opt");
        resp.encoding = Some("base64".to_string());
        assert!(!is_challenge_response(&resp));
        assert!(!is_provider_challenge(&resp));
    }

    #[test]
    fn test_challenge_page_detection() {
        assert!(is_challenge_page("Just a moment...", "https://demo.test/"));
        assert!(is_challenge_page("DDoS-Guard", "https://demo.test/"));
        assert!(is_challenge_page(
            "",
            "https://demo.test/cdn-cgi/challenge-platform/h/b"
        ));
        assert!(!is_challenge_page("Popular Manga", "https://demo.test/popular"));
    }

    #[test]
    fn test_identity_cookies_are_isolated() {
        let config = BridgeConfig::default();
        let a = NetworkIdentity::new(&config).unwrap();
        let b = NetworkIdentity::new(&config).unwrap();
        let url = Url::parse("https://demo.test/").unwrap();

        a.add_cookies(
            &url,
            &[SurfaceCookie {
                name: "cf_clearance".to_string(),
                value: "abc".to_string(),
                domain: "demo.test".to_string(),
                path: "/".to_string(),
                ..Default::default()
            }],
        );

        assert_eq!(a.cookie_header(&url).as_deref(), Some("cf_clearance=abc"));
        assert!(b.cookie_header(&url).is_none());
    }

    #[test]
    fn test_rebind_shares_jar() {
        let config = BridgeConfig::default();
        let identity = NetworkIdentity::new(&config).unwrap();
        let rebound = identity.rebind(&config).unwrap();
        let url = Url::parse("https://demo.test/").unwrap();

        identity.add_cookie_header(&url, "session=1");
        assert_eq!(rebound.cookie_header(&url).as_deref(), Some("session=1"));
    }

    #[test]
    fn test_cookie_header_install() {
        let identity = NetworkIdentity::new(&BridgeConfig::default()).unwrap();
        let url = Url::parse("https://demo.test/").unwrap();
        identity.add_cookie_header(&url, "a=1; b=2");

        let header = identity.cookie_header(&url).unwrap();
        assert!(header.contains("a=1"));
        assert!(header.contains("b=2"));
    }

    #[test]
    fn test_surface_cookies_mirror_the_jar() {
        let identity = NetworkIdentity::new(&BridgeConfig::default()).unwrap();
        let url = Url::parse("https://demo.test/manga").unwrap();
        assert!(identity.surface_cookies(&url).is_empty());

        identity.add_cookie_header(&url, "cf_clearance=abc; lang=en");
        let cookies = identity.surface_cookies(&url);
        assert_eq!(cookies.len(), 2);
        let clearance = cookies.iter().find(|c| c.name == "cf_clearance").unwrap();
        assert_eq!(clearance.value, "abc");
        assert_eq!(clearance.domain, "demo.test");
        assert!(clearance.secure);
    }
}
