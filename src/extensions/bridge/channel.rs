//! Sandbox-side endpoint of the bridge.
//!
//! Every capability a sandbox has is reached through this channel: requests
//! go out as [`OutboundMessage`]s, responses come back through the
//! correlation table. Nothing else crosses the boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::BridgeConfig;
use crate::extensions::error::{ExtensionError, ExtensionResult};
use crate::extensions::ipc::{FetchRequest, OutboundMessage};
use crate::extensions::ExtensionId;

use super::correlation::{CorrelationTable, RequestIds, RequestKind};

/// One sandbox's connection to the host.
#[derive(Clone)]
pub struct BridgeChannel {
    extension_id: ExtensionId,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    slots: CorrelationTable,
    ids: Arc<RequestIds>,
    stream_cancelled: Arc<AtomicBool>,
    config: BridgeConfig,
}

impl BridgeChannel {
    /// Create a channel and the receiver the host dispatcher drains.
    pub fn new(
        extension_id: impl Into<ExtensionId>,
        config: BridgeConfig,
        stream_cancelled: Arc<AtomicBool>,
    ) -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let channel = Self {
            extension_id: extension_id.into(),
            outbound,
            slots: CorrelationTable::new(),
            ids: Arc::new(RequestIds::new()),
            stream_cancelled,
            config,
        };
        (channel, receiver)
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Correlation table the host fills responses into.
    pub fn slots(&self) -> &CorrelationTable {
        &self.slots
    }

    pub fn next_request_id(&self, kind: RequestKind) -> String {
        self.ids.next(kind)
    }

    /// Send a message to the host, opening a response slot first when the
    /// message is a request.
    pub fn emit(&self, message: OutboundMessage) -> ExtensionResult<()> {
        let request_id = message.request_id().map(str::to_string);
        if let Some(id) = &request_id {
            self.slots.open(id);
        }

        if self.outbound.send(message).is_err() {
            if let Some(id) = &request_id {
                self.slots.abandon(id);
            }
            return Err(ExtensionError::SandboxDestroyed(self.extension_id.clone()));
        }
        Ok(())
    }

    /// Parse and send one serialized message line.
    pub fn emit_line(&self, line: &str) -> ExtensionResult<()> {
        let message: OutboundMessage = serde_json::from_str(line)?;
        self.emit(message)
    }

    /// Wait for the response to a previously emitted request.
    pub async fn await_response(&self, request_id: &str) -> ExtensionResult<Value> {
        let kind = RequestKind::from_request_id(request_id).ok_or_else(|| {
            ExtensionError::JavaScript(format!("Unknown bridge request id '{}'", request_id))
        })?;
        self.slots.wait(request_id, kind.timing(&self.config)).await
    }

    /// Emit a fetch request of the given kind and wait for its response.
    pub async fn fetch(&self, kind: RequestKind, request: FetchRequest) -> ExtensionResult<Value> {
        let request_id = self.next_request_id(kind);
        let message = match kind {
            RequestKind::ServerFetch => OutboundMessage::ServerFetch {
                request_id: request_id.clone(),
                request,
            },
            RequestKind::BrowserFetch => OutboundMessage::BrowserFetch {
                request_id: request_id.clone(),
                request,
            },
            RequestKind::ChallengeSession => OutboundMessage::ChallengeSession {
                request_id: request_id.clone(),
                url: request.url,
            },
        };
        self.emit(message)?;
        self.await_response(&request_id).await
    }

    /// Whether the host cancelled the current streaming session.
    pub fn stream_cancelled(&self) -> bool {
        self.stream_cancelled.load(Ordering::SeqCst)
    }
}
