//! Isolated execution contexts.
//!
//! Each extension runs in its own V8 isolate for memory isolation and crash
//! containment. A `JsRuntime` is not `Send`, so every isolate lives on a
//! dedicated thread with its own current-thread tokio runtime; the host talks
//! to it through a command channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use deno_core::{JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::bridge::{BridgeChannel, HttpTransport, NetworkIdentity};
use super::error::{ExtensionError, ExtensionResult};
use super::invoke::CallResult;
use super::ipc::{mangyomi_sandbox, SandboxContext};
use super::manifest::Manifest;
use super::permissions::AllowedDomainSet;
use super::ExtensionId;

/// Everything needed to build an execution context for one extension.
pub struct ContextSpec {
    pub extension_id: ExtensionId,
    pub manifest: Manifest,
    pub load_path: PathBuf,
    pub allowed: AllowedDomainSet,
    pub channel: BridgeChannel,
    pub identity: NetworkIdentity,
}

/// A loaded extension, ready to take calls.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// Names of the functions the module exports.
    fn exported_functions(&self) -> &[String];

    /// Call an exported function. Exceptions thrown by the extension are a
    /// [`CallResult::Threw`], not an error.
    async fn call(&self, function: &str, args: Vec<Value>) -> ExtensionResult<CallResult>;

    /// Tear the context down. Pending calls fail with `SandboxDestroyed`.
    fn shutdown(&self);
}

/// Builds execution contexts.
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    async fn create(&self, spec: ContextSpec) -> ExtensionResult<Box<dyn ExecutionContext>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Deno engine
// ─────────────────────────────────────────────────────────────────────────────

enum Command {
    Call {
        function: String,
        args: Vec<Value>,
        reply: oneshot::Sender<ExtensionResult<CallResult>>,
    },
    Shutdown,
}

/// Engine running each extension in a deno_core isolate.
pub struct DenoEngine {
    transport: Arc<dyn HttpTransport>,
}

impl DenoEngine {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl SandboxEngine for DenoEngine {
    async fn create(&self, spec: ContextSpec) -> ExtensionResult<Box<dyn ExecutionContext>> {
        let extension_id = spec.extension_id.clone();
        let (commands, receiver) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let transport = self.transport.clone();

        thread::Builder::new()
            .name(format!("sandbox-{}", extension_id))
            .spawn(move || worker_main(spec, transport, ready_tx, receiver))
            .map_err(|e| ExtensionError::LoadFailed {
                extension: extension_id.clone(),
                message: format!("Failed to start sandbox thread: {}", e),
            })?;

        let exports = ready_rx.await.map_err(|_| ExtensionError::LoadFailed {
            extension: extension_id.clone(),
            message: "Sandbox thread exited during load".to_string(),
        })??;

        tracing::debug!(extension = %extension_id, exports = exports.len(), "isolate ready");

        Ok(Box::new(DenoContext {
            extension_id,
            commands,
            exports,
        }))
    }
}

/// Host-side handle to an isolate thread.
struct DenoContext {
    extension_id: ExtensionId,
    commands: mpsc::UnboundedSender<Command>,
    exports: Vec<String>,
}

#[async_trait]
impl ExecutionContext for DenoContext {
    fn exported_functions(&self) -> &[String] {
        &self.exports
    }

    async fn call(&self, function: &str, args: Vec<Value>) -> ExtensionResult<CallResult> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Call {
                function: function.to_string(),
                args,
                reply,
            })
            .map_err(|_| ExtensionError::SandboxDestroyed(self.extension_id.clone()))?;

        result
            .await
            .map_err(|_| ExtensionError::SandboxDestroyed(self.extension_id.clone()))?
    }

    fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl Drop for DenoContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Isolate thread
// ─────────────────────────────────────────────────────────────────────────────

fn worker_main(
    spec: ContextSpec,
    transport: Arc<dyn HttpTransport>,
    ready: oneshot::Sender<ExtensionResult<Vec<String>>>,
    commands: mpsc::UnboundedReceiver<Command>,
) {
    let extension_id = spec.extension_id.clone();

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(ExtensionError::LoadFailed {
                extension: extension_id,
                message: format!("Failed to build sandbox runtime: {}", e),
            }));
            return;
        }
    };

    rt.block_on(async move {
        let mut runtime = match boot(spec, transport) {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!(extension = %extension_id, error = %e, "extension failed to load");
                let _ = ready.send(Err(e));
                return;
            }
        };

        let exports = runtime
            .op_state()
            .borrow()
            .borrow::<SandboxContext>()
            .exports
            .clone()
            .unwrap_or_default();

        if ready.send(Ok(exports)).is_err() {
            // Creation was abandoned
            return;
        }

        serve(&mut runtime, commands, &extension_id).await;

        runtime
            .op_state()
            .borrow_mut()
            .borrow_mut::<SandboxContext>()
            .fail_pending(|| ExtensionError::SandboxDestroyed(extension_id.clone()));

        tracing::debug!(extension = %extension_id, "isolate stopped");
    });
}

/// Create the runtime, install the sandbox and run the extension's module.
fn boot(spec: ContextSpec, transport: Arc<dyn HttpTransport>) -> ExtensionResult<JsRuntime> {
    let load_failed = |message: String| ExtensionError::LoadFailed {
        extension: spec.extension_id.clone(),
        message,
    };

    let entry = spec.manifest.entry_path(&spec.load_path);
    let source = std::fs::read_to_string(&entry)
        .map_err(|e| load_failed(format!("Failed to read {}: {}", entry.display(), e)))?;

    // Connections must belong to this thread's runtime
    let identity = spec.identity.rebind(spec.channel.config())?;

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![mangyomi_sandbox::init_ops_and_esm()],
        ..Default::default()
    });

    runtime.op_state().borrow_mut().put(SandboxContext::new(
        spec.extension_id.clone(),
        spec.allowed,
        spec.channel,
        identity,
        transport,
    ));

    let wrapped = format!(
        "globalThis.__mangyomi_host.load(function (module, exports, require) {{\n{}\n}});",
        source
    );
    runtime
        .execute_script("<extension>", wrapped)
        .map_err(|e| load_failed(format!("JavaScript error: {}", e)))?;

    if runtime
        .op_state()
        .borrow()
        .borrow::<SandboxContext>()
        .exports
        .is_none()
    {
        return Err(load_failed("Module did not finish loading".to_string()));
    }

    Ok(runtime)
}

enum Step {
    Command(Option<Command>),
    EventLoop(Result<(), deno_core::error::AnyError>),
}

fn has_pending_calls(runtime: &mut JsRuntime) -> bool {
    runtime
        .op_state()
        .borrow()
        .borrow::<SandboxContext>()
        .has_pending_calls()
}

/// Serve commands until shutdown, driving the event loop while calls are
/// in flight so several calls can wait on bridge responses at once.
async fn serve(
    runtime: &mut JsRuntime,
    mut commands: mpsc::UnboundedReceiver<Command>,
    extension_id: &str,
) {
    loop {
        let step = if has_pending_calls(runtime) {
            tokio::select! {
                command = commands.recv() => Step::Command(command),
                result = runtime.run_event_loop(PollEventLoopOptions::default()) => Step::EventLoop(result),
            }
        } else {
            Step::Command(commands.recv().await)
        };

        match step {
            Step::Command(None) | Step::Command(Some(Command::Shutdown)) => break,
            Step::Command(Some(Command::Call {
                function,
                args,
                reply,
            })) => start_call(runtime, extension_id, &function, args, reply),
            Step::EventLoop(result) => {
                // The loop ran dry; any call still pending can never settle
                let message = match result {
                    Ok(()) => "Call finished without returning a result".to_string(),
                    Err(e) => e.to_string(),
                };
                runtime
                    .op_state()
                    .borrow_mut()
                    .borrow_mut::<SandboxContext>()
                    .fail_pending(|| ExtensionError::JavaScript(message.clone()));
            }
        }
    }
}

fn start_call(
    runtime: &mut JsRuntime,
    extension_id: &str,
    function: &str,
    args: Vec<Value>,
    reply: oneshot::Sender<ExtensionResult<CallResult>>,
) {
    let call_id = runtime
        .op_state()
        .borrow_mut()
        .borrow_mut::<SandboxContext>()
        .queue_call(function, args, reply);

    // The runtime pulls the call from the queue; nothing about it is
    // spliced into script source
    if let Err(e) = runtime.execute_script("<dispatch>", "globalThis.__mangyomi_host.dispatch();") {
        tracing::warn!(extension = extension_id, function, error = %e, "dispatch script failed");
        settle_with_error(runtime, call_id, ExtensionError::JavaScript(e.to_string()));
    }
}

fn settle_with_error(runtime: &mut JsRuntime, call_id: u32, error: ExtensionError) {
    runtime
        .op_state()
        .borrow_mut()
        .borrow_mut::<SandboxContext>()
        .settle(call_id, Err(error));
}
