//! Sandbox context for extension execution.
//!
//! SandboxContext holds everything ops may touch on behalf of one extension:
//! its allowed domains, its bridge channel and its network identity. It is
//! stored in the Deno OpState and never leaves the sandbox thread.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::extensions::bridge::{BridgeChannel, HttpTransport, NetworkIdentity};
use crate::extensions::error::{ExtensionError, ExtensionResult};
use crate::extensions::invoke::CallResult;
use crate::extensions::permissions::AllowedDomainSet;
use crate::extensions::ExtensionId;

use super::types::QueuedCall;

/// Reply slot for an invocation waiting on its promise to settle.
pub type CallReply = oneshot::Sender<ExtensionResult<CallResult>>;

/// Context provided to ops during execution.
pub struct SandboxContext {
    pub extension_id: ExtensionId,

    /// Domains every network primitive is checked against.
    pub allowed: AllowedDomainSet,

    /// Outbound channel plus correlation table.
    pub channel: BridgeChannel,

    /// Cookie jar and client for the guarded fetch primitive.
    pub identity: NetworkIdentity,

    pub transport: Arc<dyn HttpTransport>,

    /// Exported function names, recorded once the module has loaded.
    pub exports: Option<Vec<String>>,

    /// Invocations whose promise has not settled yet.
    pub pending_calls: HashMap<u32, CallReply>,

    /// Invocations the runtime has not picked up yet. Only the host queues
    /// calls; the runtime drains them through `op_sandbox_next_call`.
    queued_calls: VecDeque<QueuedCall>,

    next_call: u32,
}

impl SandboxContext {
    pub fn new(
        extension_id: ExtensionId,
        allowed: AllowedDomainSet,
        channel: BridgeChannel,
        identity: NetworkIdentity,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            extension_id,
            allowed,
            channel,
            identity,
            transport,
            exports: None,
            pending_calls: HashMap::new(),
            queued_calls: VecDeque::new(),
            next_call: 0,
        }
    }

    /// Register a pending invocation and return its call id.
    pub fn begin_call(&mut self, reply: CallReply) -> u32 {
        self.next_call = self.next_call.wrapping_add(1);
        self.pending_calls.insert(self.next_call, reply);
        self.next_call
    }

    /// Register an invocation and queue it for the runtime to dispatch.
    pub fn queue_call(&mut self, function: &str, args: Vec<Value>, reply: CallReply) -> u32 {
        let call_id = self.begin_call(reply);
        self.queued_calls.push_back(QueuedCall {
            call_id,
            function: function.to_string(),
            args,
        });
        call_id
    }

    /// Next queued invocation, if any.
    pub fn next_queued(&mut self) -> Option<QueuedCall> {
        self.queued_calls.pop_front()
    }

    /// Resolve a pending invocation. Unknown ids are ignored.
    pub fn settle(&mut self, call_id: u32, result: ExtensionResult<CallResult>) -> bool {
        self.queued_calls.retain(|call| call.call_id != call_id);
        match self.pending_calls.remove(&call_id) {
            Some(reply) => {
                let _ = reply.send(result);
                true
            }
            None => false,
        }
    }

    /// Fail every pending invocation.
    pub fn fail_pending(&mut self, error: impl Fn() -> ExtensionError) {
        self.queued_calls.clear();
        for (_, reply) in self.pending_calls.drain() {
            let _ = reply.send(Err(error()));
        }
    }

    pub fn has_pending_calls(&self) -> bool {
        !self.pending_calls.is_empty()
    }
}
