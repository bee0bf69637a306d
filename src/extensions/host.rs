//! Sandbox host - lifecycle manager and invocation layer.
//!
//! The SandboxHost is responsible for:
//! - Holding the manifest registry
//! - Creating at most one sandbox instance per extension, on demand
//! - Pinning instances the user is actively reading from
//! - Reclaiming idle instances
//! - Routing invocations and streaming sessions to instances

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::SandboxConfig;

use super::bridge::{spawn_pump, Bridge, BridgeChannel, HttpTransport, NetworkIdentity, PumpContext, ReqwestTransport};
use super::capabilities::{CapabilityTable, ExtensionFunction};
use super::challenge::SurfaceFactory;
use super::error::{ExtensionError, ExtensionResult};
use super::idle;
use super::invoke::InvocationOutcome;
use super::isolate::{ContextSpec, DenoEngine, ExecutionContext, SandboxEngine};
use super::manifest::Manifest;
use super::registry::{ManifestRegistry, RegistryEntry};
use super::streaming::{BatchCallback, SessionId, StreamingRelay};
use super::ExtensionId;

type Creation = Result<Arc<SandboxInstance>, Arc<ExtensionError>>;

/// In-flight creation every concurrent `acquire` for one id awaits.
type PendingCreation = Shared<BoxFuture<'static, Creation>>;

/// A live, loaded extension.
pub struct SandboxInstance {
    extension_id: ExtensionId,

    /// The isolated execution context running the extension's code.
    context: Box<dyn ExecutionContext>,

    /// Exported functions, built once at load.
    capabilities: CapabilityTable,

    /// Cookie jar used by this sandbox's network traffic.
    identity: NetworkIdentity,

    /// Dispatcher serving this sandbox's bridge requests.
    pump: JoinHandle<()>,

    created_at: Instant,
    last_used: Mutex<Instant>,
    in_flight: AtomicUsize,
}

impl SandboxInstance {
    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    pub fn identity(&self) -> &NetworkIdentity {
        &self.identity
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Calls currently running in the context.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Call a function, checking the capability table first.
    async fn call(&self, function: &str, args: Vec<Value>) -> InvocationOutcome {
        if self.capabilities.resolve(function).is_none() {
            return InvocationOutcome::NotFound {
                function: function.to_string(),
            };
        }

        let result = {
            let _guard = InFlight::enter(self);
            self.context.call(function, args).await
        };

        match result {
            Ok(result) => InvocationOutcome::from_call(function, result),
            Err(e) => {
                tracing::warn!(extension = %self.extension_id, function, error = %e, "invocation failed");
                InvocationOutcome::from_error(&e)
            }
        }
    }

    fn teardown(&self) {
        self.context.shutdown();
        self.pump.abort();
    }
}

/// Counts one running invocation; released even when the caller's future
/// is dropped mid-call.
struct InFlight<'a>(&'a SandboxInstance);

impl<'a> InFlight<'a> {
    fn enter(instance: &'a SandboxInstance) -> Self {
        instance.touch();
        instance.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(instance)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.touch();
    }
}

impl Drop for SandboxInstance {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for SandboxInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxInstance")
            .field("extension_id", &self.extension_id)
            .field("functions", &self.capabilities.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[derive(Default)]
struct HostState {
    instances: HashMap<ExtensionId, Arc<SandboxInstance>>,
    pending: HashMap<ExtensionId, PendingCreation>,
    /// Instances the user is actively using; never reclaimed.
    pinned: HashSet<ExtensionId>,
    /// Bumped by every creation and destroy so a creation that lost a race
    /// with `destroy` discards its context.
    generations: HashMap<ExtensionId, u64>,
    reaper: Option<JoinHandle<()>>,
}

impl HostState {
    fn bump_generation(&mut self, id: &str) -> u64 {
        let generation = self.generations.entry(id.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }
}

/// Shared core of a [`SandboxHost`].
///
/// Lock order: `state` before `registry`, and `state` before the relay's
/// internal lock.
pub(crate) struct HostInner {
    config: SandboxConfig,
    engine: Arc<dyn SandboxEngine>,
    bridge: Arc<Bridge>,
    relay: Arc<StreamingRelay>,
    registry: Mutex<ManifestRegistry>,
    state: Mutex<HostState>,
}

impl HostInner {
    fn lock_state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_registry(&self) -> MutexGuard<'_, ManifestRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Build a context for an extension and wire it to the bridge.
    async fn build(&self, id: &str, entry: RegistryEntry) -> ExtensionResult<SandboxInstance> {
        let identity = self.bridge.new_identity()?;
        let cancel_flag = self.relay.cancel_flag(id);
        let (channel, receiver) = BridgeChannel::new(id, self.config.bridge.clone(), cancel_flag);
        let slots = channel.slots().clone();

        let capabilities_hint = entry.manifest.capabilities.clone();
        let context = self
            .engine
            .create(ContextSpec {
                extension_id: id.to_string(),
                manifest: entry.manifest,
                load_path: entry.load_path,
                allowed: entry.allowed.clone(),
                channel,
                identity: identity.clone(),
            })
            .await?;

        let capabilities = CapabilityTable::from_exports(context.exported_functions());
        let missing = capabilities.missing_required();
        if !missing.is_empty() {
            tracing::warn!(extension = id, missing = %join(&missing), "extension lacks required functions");
        }
        let gaps = capabilities.undeclared_gaps(&capabilities_hint);
        if !gaps.is_empty() {
            tracing::warn!(extension = id, missing = %join(&gaps), "declared capabilities not exported");
        }

        let pump = spawn_pump(
            PumpContext {
                extension_id: id.to_string(),
                allowed: entry.allowed,
                identity: identity.clone(),
                slots,
                bridge: self.bridge.clone(),
                relay: self.relay.clone(),
            },
            receiver,
        );

        let now = Instant::now();
        Ok(SandboxInstance {
            extension_id: id.to_string(),
            context,
            capabilities,
            identity,
            pump,
            created_at: now,
            last_used: Mutex::new(now),
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Remove instances past the idle timeout. Returns the reclaimed ids.
    pub(crate) fn reclaim_idle(&self) -> Vec<ExtensionId> {
        let reclaimed: Vec<Arc<SandboxInstance>> = {
            let mut state = self.lock_state();
            let ids = idle::idle_candidates(
                &state.instances,
                &state.pinned,
                &self.relay,
                self.config.lifecycle.idle_timeout(),
            );
            ids.iter()
                .filter_map(|id| {
                    state.bump_generation(id);
                    self.relay.remove(id);
                    state.instances.remove(id)
                })
                .collect()
        };

        for instance in &reclaimed {
            tracing::info!(
                extension = %instance.extension_id,
                idle_secs = instance.idle_for().as_secs(),
                "reclaimed idle sandbox"
            );
            instance.teardown();
        }

        reclaimed
            .iter()
            .map(|instance| instance.extension_id.clone())
            .collect()
    }

    /// Clear the timer handle when nothing is left to reclaim. Returns true
    /// when the timer should exit.
    pub(crate) fn stop_reaper_if_empty(&self) -> bool {
        let mut state = self.lock_state();
        if state.instances.is_empty() {
            state.reaper = None;
            true
        } else {
            false
        }
    }
}

fn join(functions: &[ExtensionFunction]) -> String {
    functions
        .iter()
        .map(ExtensionFunction::name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Recover an owned error from one shared by every awaiting caller.
fn creation_error(id: &str, err: Arc<ExtensionError>) -> ExtensionError {
    match Arc::try_unwrap(err) {
        Ok(err) => err,
        Err(shared) => match shared.as_ref() {
            ExtensionError::LoadFailed { extension, message } => ExtensionError::LoadFailed {
                extension: extension.clone(),
                message: message.clone(),
            },
            ExtensionError::SandboxDestroyed(extension) => {
                ExtensionError::SandboxDestroyed(extension.clone())
            }
            other => ExtensionError::LoadFailed {
                extension: id.to_string(),
                message: other.to_string(),
            },
        },
    }
}

/// Runs on its own task so a caller dropping its `acquire` never strands
/// the other awaiters.
async fn create_instance(
    inner: Arc<HostInner>,
    id: ExtensionId,
    entry: RegistryEntry,
    generation: u64,
) -> Creation {
    let started = Instant::now();
    let result = inner.build(&id, entry).await;

    let mut state = inner.lock_state();
    let current = state.generations.get(&id) == Some(&generation);
    if current {
        state.pending.remove(&id);
    }

    match result {
        Ok(instance) if current => {
            let instance = Arc::new(instance);
            state.instances.insert(id.clone(), instance.clone());

            if state.reaper.is_none() {
                state.reaper = Some(idle::spawn_reaper(
                    Arc::downgrade(&inner),
                    inner.config.lifecycle.reclaim_interval(),
                ));
            }

            tracing::info!(
                extension = %id,
                functions = instance.capabilities.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "sandbox created"
            );
            Ok(instance)
        }
        Ok(instance) => {
            drop(state);
            tracing::debug!(extension = %id, "sandbox destroyed during creation");
            instance.teardown();
            Err(Arc::new(ExtensionError::SandboxDestroyed(id)))
        }
        Err(e) => {
            tracing::warn!(extension = %id, error = %e, "sandbox creation failed");
            Err(Arc::new(e))
        }
    }
}

/// The sandbox host manages every extension's isolated instance.
#[derive(Clone)]
pub struct SandboxHost {
    inner: Arc<HostInner>,
}

impl SandboxHost {
    /// Create a host from its collaborators.
    pub fn new(
        config: SandboxConfig,
        engine: Arc<dyn SandboxEngine>,
        transport: Arc<dyn HttpTransport>,
        surfaces: Arc<dyn SurfaceFactory>,
    ) -> ExtensionResult<Self> {
        let bridge = Bridge::new(
            config.bridge.clone(),
            config.challenge.clone(),
            transport,
            surfaces,
        )?;

        Ok(Self {
            inner: Arc::new(HostInner {
                config,
                engine,
                bridge: Arc::new(bridge),
                relay: Arc::new(StreamingRelay::new()),
                registry: Mutex::new(ManifestRegistry::new()),
                state: Mutex::new(HostState::default()),
            }),
        })
    }

    /// Create a host backed by V8 isolates, reqwest and (when built with
    /// the `chromium` feature) a Chromium rendering surface.
    pub fn with_defaults(config: SandboxConfig) -> ExtensionResult<Self> {
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport);
        let engine = Arc::new(DenoEngine::new(transport.clone()));
        Self::new(config, engine, transport, default_surfaces())
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    pub fn bridge(&self) -> &Bridge {
        &self.inner.bridge
    }

    // ─────────────────────────────────────────────────────────────────────
    // Registry
    // ─────────────────────────────────────────────────────────────────────

    /// Register an extension. Never creates an instance.
    pub fn register(
        &self,
        id: &str,
        manifest: Manifest,
        load_path: impl Into<PathBuf>,
    ) -> ExtensionResult<()> {
        self.inner.lock_registry().register(id, manifest, load_path)?;
        tracing::debug!(extension = id, "registered extension");
        Ok(())
    }

    /// Uninstall: destroy any instance and forget the manifest.
    pub fn unregister(&self, id: &str) -> bool {
        self.destroy(id);
        self.inner.lock_registry().unregister(id).is_some()
    }

    /// Replace an extension's manifest and drop its instance so the next
    /// call loads the new code.
    pub fn reload(
        &self,
        id: &str,
        manifest: Manifest,
        load_path: impl Into<PathBuf>,
    ) -> ExtensionResult<()> {
        self.inner.lock_registry().register(id, manifest, load_path)?;
        self.destroy(id);
        tracing::info!(extension = id, "reloaded extension");
        Ok(())
    }

    pub fn manifest(&self, id: &str) -> ExtensionResult<Manifest> {
        self.inner.lock_registry().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Manifest> {
        self.inner.lock_registry().list().into_iter().cloned().collect()
    }

    /// Register every valid package below a directory.
    pub fn scan(&self, extensions_dir: &Path) -> ExtensionResult<Vec<ExtensionId>> {
        self.inner.lock_registry().scan_dir(extensions_dir)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Get the ready instance for an extension, creating it if needed.
    ///
    /// Concurrent calls for one id share a single creation.
    pub async fn acquire(&self, id: &str) -> ExtensionResult<Arc<SandboxInstance>> {
        let pending = {
            let mut state = self.inner.lock_state();

            if let Some(instance) = state.instances.get(id) {
                instance.touch();
                tracing::trace!(extension = id, "reusing sandbox");
                return Ok(instance.clone());
            }

            match state.pending.get(id) {
                Some(pending) => {
                    tracing::debug!(extension = id, "joining pending sandbox creation");
                    pending.clone()
                }
                None => {
                    let entry = self.inner.lock_registry().entry(id)?.clone();
                    let generation = state.bump_generation(id);
                    let task = tokio::spawn(create_instance(
                        self.inner.clone(),
                        id.to_string(),
                        entry,
                        generation,
                    ));

                    let extension = id.to_string();
                    let pending = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(Arc::new(ExtensionError::LoadFailed {
                                extension,
                                message: format!("Creation task failed: {}", e),
                            }))
                        })
                    }
                    .boxed()
                    .shared();

                    state.pending.insert(id.to_string(), pending.clone());
                    tracing::debug!(extension = id, "creating sandbox");
                    pending
                }
            }
        };

        pending.await.map_err(|e| creation_error(id, e))
    }

    /// Whether a ready instance exists. Never creates one.
    pub fn is_ready(&self, id: &str) -> bool {
        self.inner.lock_state().instances.contains_key(id)
    }

    /// Pin an extension so idle reclamation leaves it alone.
    pub fn set_active(&self, id: &str) {
        if self.inner.lock_state().pinned.insert(id.to_string()) {
            tracing::debug!(extension = id, "pinned sandbox");
        }
    }

    pub fn clear_active(&self, id: &str) {
        if self.inner.lock_state().pinned.remove(id) {
            tracing::debug!(extension = id, "unpinned sandbox");
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.inner.lock_state().pinned.contains(id)
    }

    /// Tear down an extension's instance immediately, whatever its state.
    ///
    /// A creation still in flight is discarded when it completes. Returns
    /// true when a ready instance was destroyed.
    pub fn destroy(&self, id: &str) -> bool {
        let instance = {
            let mut state = self.inner.lock_state();
            state.bump_generation(id);
            state.pending.remove(id);
            self.inner.relay.remove(id);
            state.instances.remove(id)
        };

        match instance {
            Some(instance) => {
                instance.teardown();
                tracing::info!(extension = id, "sandbox destroyed");
                true
            }
            None => false,
        }
    }

    /// Destroy every instance and cancel every stream.
    pub fn shutdown(&self) {
        let (instances, reaper) = {
            let mut state = self.inner.lock_state();
            let ids: Vec<ExtensionId> = state
                .instances
                .keys()
                .chain(state.pending.keys())
                .cloned()
                .collect();
            for id in &ids {
                state.bump_generation(id);
            }
            state.pending.clear();
            self.inner.relay.cancel_all();
            (
                state.instances.drain().map(|(_, i)| i).collect::<Vec<_>>(),
                state.reaper.take(),
            )
        };

        if let Some(reaper) = reaper {
            reaper.abort();
        }
        for instance in &instances {
            instance.teardown();
        }
        tracing::info!(count = instances.len(), "sandbox host shut down");
    }

    /// Run one reclamation pass now. Returns the reclaimed ids.
    pub fn reclaim_idle(&self) -> Vec<ExtensionId> {
        self.inner.reclaim_idle()
    }

    pub fn instance_count(&self) -> usize {
        self.inner.lock_state().instances.len()
    }

    /// Whether the idle reclamation timer is running.
    pub fn reaper_running(&self) -> bool {
        self.inner.lock_state().reaper.is_some()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Invocation
    // ─────────────────────────────────────────────────────────────────────

    /// Call an exported function, creating the instance if needed.
    pub async fn invoke(&self, id: &str, function: &str, args: Vec<Value>) -> InvocationOutcome {
        match self.acquire(id).await {
            Ok(instance) => instance.call(function, args).await,
            Err(e) => InvocationOutcome::from_error(&e),
        }
    }

    /// Call a function only if the instance is already ready.
    pub async fn invoke_if_ready(
        &self,
        id: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Option<InvocationOutcome> {
        let instance = self.inner.lock_state().instances.get(id).cloned()?;
        instance.touch();
        Some(instance.call(function, args).await)
    }

    /// Resolve a reader-facing page URL into a real image URL.
    ///
    /// Extensions without `getImageUrl` serve image URLs directly, so the
    /// input comes back unchanged.
    pub async fn resolve_image_url(&self, id: &str, url: &str) -> ExtensionResult<String> {
        let outcome = self
            .invoke(id, ExtensionFunction::GetImageUrl.name(), vec![Value::from(url)])
            .await;

        match outcome {
            InvocationOutcome::NotFound { .. } => Ok(url.to_string()),
            InvocationOutcome::Success(Value::String(resolved)) if !resolved.is_empty() => {
                Ok(resolved)
            }
            InvocationOutcome::Success(Value::Null | Value::String(_)) => Ok(url.to_string()),
            InvocationOutcome::Success(other) => Err(ExtensionError::InvocationFailed {
                extension: id.to_string(),
                function: ExtensionFunction::GetImageUrl.name().to_string(),
                message: format!("expected an image URL, got {}", other),
                stack: None,
            }),
            failed => failed
                .into_result(id, ExtensionFunction::GetImageUrl.name())
                .map(|_| url.to_string()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Streaming
    // ─────────────────────────────────────────────────────────────────────

    /// Start a streaming session, cancelling any previous one.
    ///
    /// The instance is created first so the session's cancellation flag is
    /// the one its sandbox reads.
    pub async fn start_stream(
        &self,
        id: &str,
        on_batch: BatchCallback,
    ) -> ExtensionResult<SessionId> {
        self.acquire(id).await?;
        let session = self.inner.relay.start(id, on_batch);
        tracing::debug!(extension = id, "stream started");
        Ok(session)
    }

    /// Cancel the streaming session. Returns false when none was live.
    pub fn cancel_stream(&self, id: &str) -> bool {
        let cancelled = self.inner.relay.cancel(id);
        if cancelled {
            tracing::debug!(extension = id, "stream cancelled");
        }
        cancelled
    }

    /// End a session without touching a newer one.
    pub fn finish_stream(&self, id: &str, session: SessionId) {
        self.inner.relay.finish(id, session);
    }

    pub fn has_stream(&self, id: &str) -> bool {
        self.inner.relay.has_session(id)
    }

    /// Start a session and run a streaming function in it.
    ///
    /// The session stays open after the call returns until the extension
    /// emits a `done` batch, the stream is cancelled, or a new one replaces
    /// it; a failed call cancels it.
    pub async fn stream(
        &self,
        id: &str,
        function: &str,
        args: Vec<Value>,
        on_batch: BatchCallback,
    ) -> InvocationOutcome {
        let session = match self.start_stream(id, on_batch).await {
            Ok(session) => session,
            Err(e) => return InvocationOutcome::from_error(&e),
        };

        let outcome = self.invoke(id, function, args).await;
        if !outcome.is_success() {
            self.finish_stream(id, session);
        }
        outcome
    }
}

#[cfg(feature = "chromium")]
fn default_surfaces() -> Arc<dyn SurfaceFactory> {
    Arc::new(super::challenge::chromium::ChromiumSurfaces)
}

#[cfg(not(feature = "chromium"))]
fn default_surfaces() -> Arc<dyn SurfaceFactory> {
    Arc::new(super::challenge::Unavailable)
}
