//! Per-sandbox dispatcher draining the outbound channel.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::extensions::ipc::{LogLevel, OutboundMessage};
use crate::extensions::permissions::AllowedDomainSet;
use crate::extensions::streaming::StreamingRelay;
use crate::extensions::ExtensionId;

use super::correlation::CorrelationTable;
use super::network::NetworkIdentity;
use super::{Bridge, FetchScope};

/// Everything the dispatcher needs to serve one sandbox.
#[derive(Clone)]
pub struct PumpContext {
    pub extension_id: ExtensionId,
    pub allowed: AllowedDomainSet,
    pub identity: NetworkIdentity,
    pub slots: CorrelationTable,
    pub bridge: Arc<Bridge>,
    pub relay: Arc<StreamingRelay>,
}

impl PumpContext {
    fn scope(&self) -> FetchScope<'_> {
        FetchScope {
            extension_id: &self.extension_id,
            allowed: &self.allowed,
            identity: &self.identity,
        }
    }

    fn respond(&self, request_id: &str, response: &impl Serialize) {
        let value = match serde_json::to_value(response) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(extension = %self.extension_id, request_id, error = %e, "unserializable bridge response");
                return;
            }
        };
        if !self.slots.fill(request_id, value) {
            tracing::debug!(extension = %self.extension_id, request_id, "response arrived after requester gave up");
        }
    }
}

/// Spawn the dispatcher. Aborting the handle stops it and every request it
/// has in flight.
pub fn spawn_pump(
    ctx: PumpContext,
    receiver: mpsc::UnboundedReceiver<OutboundMessage>,
) -> JoinHandle<()> {
    tokio::spawn(run(ctx, receiver))
}

async fn run(ctx: PumpContext, mut receiver: mpsc::UnboundedReceiver<OutboundMessage>) {
    let mut requests = JoinSet::new();

    loop {
        tokio::select! {
            message = receiver.recv() => {
                let Some(message) = message else { break };
                dispatch(&ctx, &mut requests, message);
            }
            Some(joined) = requests.join_next(), if !requests.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(extension = %ctx.extension_id, "bridge request panicked");
                    }
                }
            }
        }
    }

    tracing::debug!(extension = %ctx.extension_id, "bridge channel closed");
}

fn dispatch(ctx: &PumpContext, requests: &mut JoinSet<()>, message: OutboundMessage) {
    match message {
        OutboundMessage::Log { level, message } => log_line(&ctx.extension_id, level, &message),
        OutboundMessage::StreamBatch { batch } => {
            ctx.relay.deliver(&ctx.extension_id, batch);
        }
        OutboundMessage::ServerFetch { request_id, request } => {
            tracing::debug!(extension = %ctx.extension_id, request_id = %request_id, kind = "serverFetch", url = %request.url, "bridge request");
            let ctx = ctx.clone();
            requests.spawn(async move {
                let response = ctx.bridge.server_fetch(ctx.scope(), request).await;
                ctx.respond(&request_id, &response);
            });
        }
        OutboundMessage::BrowserFetch { request_id, request } => {
            tracing::debug!(extension = %ctx.extension_id, request_id = %request_id, kind = "browserFetch", url = %request.url, "bridge request");
            let ctx = ctx.clone();
            requests.spawn(async move {
                let response = ctx.bridge.browser_fetch(ctx.scope(), request).await;
                ctx.respond(&request_id, &response);
            });
        }
        OutboundMessage::ChallengeSession { request_id, url } => {
            tracing::debug!(extension = %ctx.extension_id, request_id = %request_id, kind = "requestCloudflareSession", url = %url, "bridge request");
            let ctx = ctx.clone();
            requests.spawn(async move {
                let reply = ctx.bridge.request_session(ctx.scope(), &url).await;
                ctx.respond(&request_id, &reply);
            });
        }
    }
}

fn log_line(extension_id: &str, level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(target: "mangyomi::extension", extension = extension_id, "{}", message),
        LogLevel::Info => tracing::info!(target: "mangyomi::extension", extension = extension_id, "{}", message),
        LogLevel::Warn => tracing::warn!(target: "mangyomi::extension", extension = extension_id, "{}", message),
        LogLevel::Error => tracing::error!(target: "mangyomi::extension", extension = extension_id, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, ChallengeConfig};
    use crate::extensions::bridge::{BridgeChannel, RequestKind};
    use crate::extensions::ipc::{FetchRequest, StreamBatch};
    use crate::extensions::test_support::{RecordingTransport, ScriptedSurfaces, SurfacePlan};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    fn setup(
        transport: Arc<RecordingTransport>,
    ) -> (BridgeChannel, JoinHandle<()>, Arc<StreamingRelay>) {
        let bridge = Arc::new(
            Bridge::new(
                BridgeConfig::default(),
                ChallengeConfig::default(),
                transport,
                Arc::new(ScriptedSurfaces::new(SurfacePlan::default())),
            )
            .unwrap(),
        );
        let relay = Arc::new(StreamingRelay::new());
        let (channel, receiver) = BridgeChannel::new(
            "demo",
            BridgeConfig::default(),
            Arc::new(AtomicBool::new(false)),
        );
        let ctx = PumpContext {
            extension_id: "demo".to_string(),
            allowed: AllowedDomainSet::from_patterns(["demo.test"]),
            identity: bridge.new_identity().unwrap(),
            slots: channel.slots().clone(),
            bridge,
            relay: relay.clone(),
        };
        (channel, spawn_pump(ctx, receiver), relay)
    }

    #[tokio::test]
    async fn test_fetch_response_is_correlated() {
        let (channel, pump, _) = setup(Arc::new(RecordingTransport::ok("payload")));

        let value = channel
            .fetch(RequestKind::ServerFetch, FetchRequest::get("https://demo.test/x"))
            .await
            .unwrap();
        assert_eq!(value["ok"], serde_json::json!(true));
        assert_eq!(value["body"], serde_json::json!("payload"));

        let value = channel
            .fetch(RequestKind::ServerFetch, FetchRequest::get("https://other.test/x"))
            .await
            .unwrap();
        assert_eq!(value["status"], serde_json::json!(403));

        pump.abort();
    }

    #[tokio::test]
    async fn test_stream_batches_reach_relay() {
        let (channel, pump, relay) = setup(Arc::new(RecordingTransport::ok("")));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        relay.start(
            "demo",
            Arc::new(move |_id: &str, batch: StreamBatch| {
                sink.lock().unwrap().push(batch.pages.len());
            }),
        );

        channel
            .emit(OutboundMessage::StreamBatch {
                batch: StreamBatch {
                    pages: vec![serde_json::json!("p1"), serde_json::json!("p2")],
                    done: false,
                    total: Some(2),
                },
            })
            .unwrap();

        for _ in 0..50 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![2]);

        pump.abort();
    }
}
