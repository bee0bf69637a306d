//! Scripted stand-ins for the network, rendering surfaces and the isolate
//! engine, shared by unit tests across the extension modules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::bridge::{BridgeChannel, HttpTransport, NetworkIdentity, RequestKind};
use super::challenge::{
    LoadFailure, PageSnapshot, RenderSurface, SurfaceCookie, SurfaceFactory, SurfaceMode,
};
use super::error::{ExtensionError, ExtensionResult};
use super::invoke::CallResult;
use super::ipc::{FetchRequest, FetchResponse, OutboundMessage, StreamBatch};
use super::isolate::{ContextSpec, ExecutionContext, SandboxEngine};

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// Transport that answers from a script and counts attempts.
pub struct RecordingTransport {
    responses: Mutex<Vec<FetchResponse>>,
    fallback: FetchResponse,
    attempts: AtomicUsize,
}

fn response(status: u16, headers: &[(&str, &str)], body: &str) -> FetchResponse {
    FetchResponse {
        ok: (200..300).contains(&status),
        status,
        status_text: String::new(),
        url: String::new(),
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        body: body.to_string(),
        encoding: None,
        error: None,
    }
}

impl RecordingTransport {
    /// Every request gets a 200 with `body`.
    pub fn ok(body: &str) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            fallback: response(200, &[], body),
            attempts: AtomicUsize::new(0),
        }
    }

    /// The first request hits an interstitial, later ones get `body`.
    pub fn challenged_then(body: &str) -> Self {
        let transport = Self::ok(body);
        transport.responses.lock().unwrap().push(response(
            503,
            &[("server", "cloudflare")],
            "<html><title>Just a moment...</title></html>",
        ));
        transport
    }

    /// Answer the next unscripted request with this response first.
    pub fn then_respond(self, status: u16, headers: &[(&str, &str)], body: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push(response(status, headers, body));
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for RecordingTransport {
    async fn execute(
        &self,
        _identity: &NetworkIdentity,
        request: &FetchRequest,
    ) -> ExtensionResult<FetchResponse> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        let mut response = if responses.is_empty() {
            self.fallback.clone()
        } else {
            responses.remove(0)
        };
        response.url = request.url.clone();
        Ok(response)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Surfaces
// ─────────────────────────────────────────────────────────────────────────────

/// How every surface opened by a [`ScriptedSurfaces`] behaves.
#[derive(Debug, Clone, Default)]
pub struct SurfacePlan {
    /// Title reported at each poll; the last one repeats.
    pub titles: Vec<String>,
    pub cookies: Vec<SurfaceCookie>,
    pub snapshot: PageSnapshot,
    /// Report the surface closed once this many polls happened.
    pub closed_after_polls: Option<usize>,
    pub load_failure: Option<LoadFailure>,
    /// Polls before `load_failure` is reported.
    pub failure_after_polls: usize,
}

#[derive(Default)]
struct SurfaceLog {
    opened: Vec<SurfaceMode>,
    /// Cookies the opening identity held for the URL, per open.
    seeded: Vec<Vec<SurfaceCookie>>,
    user_agents: Vec<String>,
    closed: usize,
}

pub struct ScriptedSurfaces {
    plan: SurfacePlan,
    log: Arc<Mutex<SurfaceLog>>,
}

impl ScriptedSurfaces {
    pub fn new(plan: SurfacePlan) -> Self {
        Self {
            plan,
            log: Arc::new(Mutex::new(SurfaceLog::default())),
        }
    }

    pub fn opened(&self) -> Vec<SurfaceMode> {
        self.log.lock().unwrap().opened.clone()
    }

    pub fn seeded(&self) -> Vec<Vec<SurfaceCookie>> {
        self.log.lock().unwrap().seeded.clone()
    }

    pub fn user_agents(&self) -> Vec<String> {
        self.log.lock().unwrap().user_agents.clone()
    }

    pub fn closed_count(&self) -> usize {
        self.log.lock().unwrap().closed
    }
}

#[async_trait]
impl SurfaceFactory for ScriptedSurfaces {
    async fn open(
        &self,
        url: &str,
        mode: SurfaceMode,
        identity: &NetworkIdentity,
    ) -> ExtensionResult<Box<dyn RenderSurface>> {
        let seeded = url::Url::parse(url)
            .map(|u| identity.surface_cookies(&u))
            .unwrap_or_default();
        {
            let mut log = self.log.lock().unwrap();
            log.opened.push(mode);
            log.seeded.push(seeded);
            log.user_agents.push(identity.user_agent().to_string());
        }
        Ok(Box::new(ScriptedSurface {
            plan: self.plan.clone(),
            url: url.to_string(),
            polls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            failure: Mutex::new(self.plan.load_failure.clone()),
            log: self.log.clone(),
        }))
    }
}

struct ScriptedSurface {
    plan: SurfacePlan,
    url: String,
    polls: AtomicUsize,
    closed: AtomicBool,
    failure: Mutex<Option<LoadFailure>>,
    log: Arc<Mutex<SurfaceLog>>,
}

impl ScriptedSurface {
    /// Title for the current poll, then advance.
    fn next_title(&self) -> String {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst);
        match self.plan.titles.len() {
            0 => String::new(),
            n => self.plan.titles[poll.min(n - 1)].clone(),
        }
    }

    fn url(&self) -> String {
        if self.plan.snapshot.url.is_empty() {
            self.url.clone()
        } else {
            self.plan.snapshot.url.clone()
        }
    }
}

#[async_trait]
impl RenderSurface for ScriptedSurface {
    async fn title(&self) -> ExtensionResult<String> {
        Ok(self.next_title())
    }

    async fn current_url(&self) -> ExtensionResult<String> {
        Ok(self.url())
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.plan.closed_after_polls, Some(n) if self.polls.load(Ordering::SeqCst) >= n)
    }

    fn take_load_failure(&self) -> Option<LoadFailure> {
        if self.polls.load(Ordering::SeqCst) < self.plan.failure_after_polls {
            return None;
        }
        self.failure.lock().unwrap().take()
    }

    async fn snapshot(&self) -> ExtensionResult<PageSnapshot> {
        let title = self.next_title();
        Ok(PageSnapshot {
            url: self.url(),
            title,
            ..self.plan.snapshot.clone()
        })
    }

    async fn cookies(&self) -> ExtensionResult<Vec<SurfaceCookie>> {
        Ok(self.plan.cookies.clone())
    }

    async fn close(&self) -> ExtensionResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.log.lock().unwrap().closed += 1;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// What a fake exported function does when called.
#[derive(Debug, Clone)]
pub enum FakeBehavior {
    Return(Value),
    Throw(String),
    /// Sleep, then return.
    Slow(Duration, Value),
    /// Emit one batch per entry until cancelled, then return how many went out.
    Stream(Vec<StreamBatch>),
    /// `serverFetch` the URL through the bridge and return the response.
    ServerFetch(String),
}

/// Engine whose contexts run scripted behaviors instead of JavaScript.
pub struct FakeEngine {
    behaviors: HashMap<String, FakeBehavior>,
    create_delay: Duration,
    fail_load: bool,
    created: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            create_delay: Duration::ZERO,
            fail_load: false,
            created: AtomicUsize::new(0),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with(mut self, function: &str, behavior: FakeBehavior) -> Self {
        self.behaviors.insert(function.to_string(), behavior);
        self
    }

    pub fn create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_load = true;
        self
    }

    /// Number of contexts created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxEngine for FakeEngine {
    async fn create(&self, spec: ContextSpec) -> ExtensionResult<Box<dyn ExecutionContext>> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        self.created.fetch_add(1, Ordering::SeqCst);

        if self.fail_load {
            return Err(ExtensionError::LoadFailed {
                extension: spec.extension_id,
                message: "scripted load failure".to_string(),
            });
        }

        let mut exports: Vec<String> = self.behaviors.keys().cloned().collect();
        exports.sort();

        Ok(Box::new(FakeContext {
            extension_id: spec.extension_id,
            channel: spec.channel,
            behaviors: self.behaviors.clone(),
            exports,
            stopped: AtomicBool::new(false),
            shutdowns: self.shutdowns.clone(),
        }))
    }
}

struct FakeContext {
    extension_id: String,
    channel: BridgeChannel,
    behaviors: HashMap<String, FakeBehavior>,
    exports: Vec<String>,
    stopped: AtomicBool,
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl ExecutionContext for FakeContext {
    fn exported_functions(&self) -> &[String] {
        &self.exports
    }

    async fn call(&self, function: &str, _args: Vec<Value>) -> ExtensionResult<CallResult> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ExtensionError::SandboxDestroyed(self.extension_id.clone()));
        }

        let Some(behavior) = self.behaviors.get(function) else {
            return Ok(CallResult::Missing);
        };

        Ok(match behavior {
            FakeBehavior::Return(value) => CallResult::Returned(value.clone()),
            FakeBehavior::Throw(message) => CallResult::Threw {
                message: message.clone(),
                stack: Some(format!("Error: {}\n    at {}", message, function)),
            },
            FakeBehavior::Slow(delay, value) => {
                tokio::time::sleep(*delay).await;
                CallResult::Returned(value.clone())
            }
            FakeBehavior::Stream(batches) => {
                let mut emitted = 0;
                for batch in batches {
                    if self.channel.stream_cancelled() {
                        break;
                    }
                    self.channel.emit(OutboundMessage::StreamBatch {
                        batch: batch.clone(),
                    })?;
                    emitted += 1;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                CallResult::Returned(json!({ "emitted": emitted }))
            }
            FakeBehavior::ServerFetch(url) => {
                let response = self
                    .channel
                    .fetch(RequestKind::ServerFetch, FetchRequest::get(url))
                    .await?;
                CallResult::Returned(response)
            }
        })
    }

    fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
