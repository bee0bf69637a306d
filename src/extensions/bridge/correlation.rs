//! Request-id correlation between sandbox calls and host responses.
//!
//! A sandbox emits a request over its one-way channel and then polls its
//! correlation table for the matching id. The host fills the slot when the
//! work finishes. Slots are opened before the request leaves the sandbox so a
//! fast response can never arrive for an id nobody is waiting on.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::config::BridgeConfig;
use crate::extensions::error::{ExtensionError, ExtensionResult};

/// Kind of bridge request, which fixes its id prefix and polling contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    ServerFetch,
    BrowserFetch,
    ChallengeSession,
}

impl RequestKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::ServerFetch => "sf",
            Self::BrowserFetch => "bf",
            Self::ChallengeSession => "cf",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "serverFetch" | "sf" => Some(Self::ServerFetch),
            "browserFetch" | "bf" => Some(Self::BrowserFetch),
            "requestCloudflareSession" | "cf" => Some(Self::ChallengeSession),
            _ => None,
        }
    }

    /// Recover the kind from a request id such as `bf-12`.
    pub fn from_request_id(request_id: &str) -> Option<Self> {
        let (prefix, _) = request_id.split_once('-')?;
        match prefix {
            "sf" => Some(Self::ServerFetch),
            "bf" => Some(Self::BrowserFetch),
            "cf" => Some(Self::ChallengeSession),
            _ => None,
        }
    }

    /// Total wait and poll interval for this kind.
    pub fn timing(&self, config: &BridgeConfig) -> PollTiming {
        let (timeout_ms, interval_ms) = match self {
            Self::ServerFetch => (config.server_fetch_timeout_ms, config.server_fetch_poll_ms),
            Self::BrowserFetch => (config.browser_fetch_timeout_ms, config.browser_fetch_poll_ms),
            Self::ChallengeSession => (config.session_timeout_ms, config.session_poll_ms),
        };
        PollTiming {
            timeout: Duration::from_millis(timeout_ms),
            interval: Duration::from_millis(interval_ms),
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ServerFetch => "serverFetch",
            Self::BrowserFetch => "browserFetch",
            Self::ChallengeSession => "requestCloudflareSession",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    pub timeout: Duration,
    pub interval: Duration,
}

/// Per-instance request id generator.
#[derive(Debug, Default)]
pub struct RequestIds {
    next: AtomicU64,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, kind: RequestKind) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", kind.prefix(), n)
    }
}

#[derive(Debug)]
enum Slot {
    Waiting,
    Ready(Value),
}

/// Table of outstanding bridge requests for one sandbox instance.
#[derive(Debug, Clone, Default)]
pub struct CorrelationTable {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a slot for a request about to be emitted.
    pub fn open(&self, request_id: &str) {
        self.lock().insert(request_id.to_string(), Slot::Waiting);
    }

    /// Deliver a response. Returns false when nobody waits on the id anymore.
    pub fn fill(&self, request_id: &str, response: Value) -> bool {
        let mut slots = self.lock();
        match slots.get_mut(request_id) {
            Some(slot @ Slot::Waiting) => {
                *slot = Slot::Ready(response);
                true
            }
            _ => false,
        }
    }

    /// Take a ready response, leaving waiting slots untouched.
    pub fn take(&self, request_id: &str) -> Option<Value> {
        let mut slots = self.lock();
        if matches!(slots.get(request_id), Some(Slot::Ready(_))) {
            if let Some(Slot::Ready(value)) = slots.remove(request_id) {
                return Some(value);
            }
        }
        None
    }

    /// Stop waiting on a request; a late response is dropped.
    pub fn abandon(&self, request_id: &str) {
        self.lock().remove(request_id);
    }

    pub fn is_open(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    /// Number of requests still waiting for a response.
    pub fn pending(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Waiting))
            .count()
    }

    /// Drop every slot. Waiters observe their slot disappearing.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Poll for a response until it arrives or the timeout elapses.
    ///
    /// On timeout the slot is abandoned so a late response is discarded.
    pub async fn wait(&self, request_id: &str, timing: PollTiming) -> ExtensionResult<Value> {
        let deadline = tokio::time::Instant::now() + timing.timeout;

        loop {
            if let Some(value) = self.take(request_id) {
                return Ok(value);
            }

            if !self.is_open(request_id) {
                return Err(ExtensionError::Network(format!(
                    "Bridge request '{}' was cancelled",
                    request_id
                )));
            }

            if tokio::time::Instant::now() >= deadline {
                self.abandon(request_id);
                return Err(ExtensionError::BridgeTimeout {
                    request_id: request_id.to_string(),
                    timeout_ms: timing.timeout.as_millis() as u64,
                });
            }

            tokio::time::sleep(timing.interval).await;
        }
    }
}
