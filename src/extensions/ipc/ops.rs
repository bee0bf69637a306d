//! Deno ops for the sandbox runtime.
//!
//! These are the only functions the sandbox's JavaScript can reach, and
//! `runtime.js` hides them from extension code behind the bridge API. Each op
//! is exposed via deno_core's #[op2] macro and registered with the
//! mangyomi_sandbox extension below.

use std::cell::RefCell;
use std::rc::Rc;

use deno_core::{error::AnyError, op2, OpState};

use crate::extensions::bridge::{guarded_fetch, FetchScope, RequestKind};
use crate::extensions::html::{self, HtmlElement};
use crate::{sandbox_clone, sandbox_ctx, sandbox_ctx_mut};

use super::types::{FetchRequest, FetchResponse, QueuedCall, SettledCall};

// ─────────────────────────────────────────────────────────────────────────────
// Outbound Channel Ops
// ─────────────────────────────────────────────────────────────────────────────

/// Send one serialized message to the host.
#[op2(fast)]
fn op_sandbox_emit(state: &mut OpState, #[string] line: String) -> Result<(), AnyError> {
    let ctx = sandbox_ctx!(state);
    ctx.channel
        .emit_line(&line)
        .map_err(|e| anyhow::anyhow!("Bridge emit failed: {}", e))
}

/// Allocate a request id in the namespace of a request kind.
#[op2]
#[string]
fn op_sandbox_next_request_id(state: &mut OpState, #[string] kind: &str) -> Result<String, AnyError> {
    let kind = RequestKind::parse(kind)
        .ok_or_else(|| anyhow::anyhow!("Unknown bridge request kind '{}'", kind))?;
    let ctx = sandbox_ctx!(state);
    Ok(ctx.channel.next_request_id(kind))
}

/// Poll the correlation table until the response for `request_id` arrives.
#[op2(async)]
#[serde]
async fn op_sandbox_await(
    state: Rc<RefCell<OpState>>,
    #[string] request_id: String,
) -> Result<serde_json::Value, AnyError> {
    let channel = sandbox_clone!(state, channel);
    channel
        .await_response(&request_id)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))
}

// ─────────────────────────────────────────────────────────────────────────────
// Fetch Op
// ─────────────────────────────────────────────────────────────────────────────

/// Guarded direct fetch. Disallowed hosts get a 403 response, never an error.
#[op2(async)]
#[serde]
async fn op_sandbox_fetch(
    state: Rc<RefCell<OpState>>,
    #[serde] request: FetchRequest,
) -> Result<FetchResponse, AnyError> {
    let (transport, identity, allowed, extension_id) = {
        let state_ref = state.borrow();
        let ctx = sandbox_ctx!(state_ref);
        (
            ctx.transport.clone(),
            ctx.identity.clone(),
            ctx.allowed.clone(),
            ctx.extension_id.clone(),
        )
    };

    let scope = FetchScope {
        extension_id: &extension_id,
        allowed: &allowed,
        identity: &identity,
    };
    Ok(guarded_fetch(transport.as_ref(), scope, &request).await)
}

// ─────────────────────────────────────────────────────────────────────────────
// HTML Op
// ─────────────────────────────────────────────────────────────────────────────

/// Select elements from an HTML document.
#[op2]
#[serde]
fn op_sandbox_html_select(
    #[string] document: &str,
    #[string] selector: &str,
    first: bool,
) -> Result<Vec<HtmlElement>, AnyError> {
    let result = if first {
        html::select_first(document, selector).map(|e| e.into_iter().collect())
    } else {
        html::select(document, selector)
    };
    result.map_err(|e| anyhow::anyhow!("{}", e))
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming Op
// ─────────────────────────────────────────────────────────────────────────────

/// Whether the host cancelled the current streaming session.
#[op2(fast)]
fn op_sandbox_stream_cancelled(state: &mut OpState) -> bool {
    sandbox_ctx!(state).channel.stream_cancelled()
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle Ops
// ─────────────────────────────────────────────────────────────────────────────

/// Record the module's exported function names after load.
#[op2]
fn op_sandbox_exports(state: &mut OpState, #[serde] names: Vec<String>) {
    sandbox_ctx_mut!(state).exports = Some(names);
}

/// Hand the runtime the next invocation the host queued.
#[op2]
#[serde]
fn op_sandbox_next_call(state: &mut OpState) -> Option<QueuedCall> {
    sandbox_ctx_mut!(state).next_queued()
}

/// Settle a pending invocation.
#[op2]
fn op_sandbox_settle(state: &mut OpState, #[smi] call_id: u32, #[serde] settled: SettledCall) {
    let ctx = sandbox_ctx_mut!(state);
    if !ctx.settle(call_id, Ok(settled.into())) {
        tracing::debug!(extension = %ctx.extension_id, call_id, "settle for unknown call");
    }
}

/// Timer backing `setTimeout`.
#[op2(async)]
async fn op_sandbox_sleep(#[smi] millis: u32) {
    tokio::time::sleep(std::time::Duration::from_millis(millis as u64)).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Extension Registration
// ─────────────────────────────────────────────────────────────────────────────

deno_core::extension!(
    mangyomi_sandbox,
    ops = [
        // Outbound channel
        op_sandbox_emit,
        op_sandbox_next_request_id,
        op_sandbox_await,
        // Fetch
        op_sandbox_fetch,
        // HTML
        op_sandbox_html_select,
        // Streaming
        op_sandbox_stream_cancelled,
        // Lifecycle
        op_sandbox_exports,
        op_sandbox_next_call,
        op_sandbox_settle,
        op_sandbox_sleep,
    ],
    esm_entry_point = "ext:mangyomi_sandbox/runtime.js",
    esm = [dir "src/extensions/js", "runtime.js"],
);
