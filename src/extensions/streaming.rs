//! Streaming relay for incrementally delivered results.
//!
//! At most one session is live per extension. Starting a new session cancels
//! the previous one before the new callback is registered, so a stale
//! callback never sees a batch meant for its replacement.
//!
//! Cancellation is cooperative. The host flips a flag the sandbox can read
//! between fetches; an extension that never checks it keeps running until
//! its call returns, but its batches are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::ipc::StreamBatch;
use super::ExtensionId;

/// Receives batches for a streaming session.
///
/// Called with the relay lock held; it must not call back into the relay.
pub type BatchCallback = Arc<dyn Fn(&str, StreamBatch) + Send + Sync>;

struct Session {
    id: u64,
    on_batch: BatchCallback,
}

#[derive(Default)]
struct RelayState {
    sessions: HashMap<ExtensionId, Session>,
    flags: HashMap<ExtensionId, Arc<AtomicBool>>,
    next_session: u64,
}

impl RelayState {
    fn flag(&mut self, extension_id: &str) -> Arc<AtomicBool> {
        self.flags
            .entry(extension_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }
}

/// Token identifying one started session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId(u64);

#[derive(Default)]
pub struct StreamingRelay {
    state: Mutex<RelayState>,
}

impl StreamingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cancellation flag shared with the extension's sandbox.
    ///
    /// The same flag lives for the extension's whole lifetime so a sandbox
    /// created before or after a session starts observes it.
    pub fn cancel_flag(&self, extension_id: &str) -> Arc<AtomicBool> {
        self.lock().flag(extension_id)
    }

    /// Start a session, replacing (and cancelling) any previous one.
    pub fn start(&self, extension_id: &str, on_batch: BatchCallback) -> SessionId {
        let mut state = self.lock();

        if state.sessions.remove(extension_id).is_some() {
            tracing::debug!(extension = extension_id, "replacing streaming session");
        }

        state.next_session += 1;
        let id = state.next_session;
        state.flag(extension_id).store(false, Ordering::SeqCst);
        state
            .sessions
            .insert(extension_id.to_string(), Session { id, on_batch });

        SessionId(id)
    }

    /// Cancel the session for an extension, if any.
    pub fn cancel(&self, extension_id: &str) -> bool {
        let mut state = self.lock();
        state.flag(extension_id).store(true, Ordering::SeqCst);
        state.sessions.remove(extension_id).is_some()
    }

    /// End a specific session without touching a newer one.
    pub fn finish(&self, extension_id: &str, session: SessionId) {
        let mut state = self.lock();
        if state
            .sessions
            .get(extension_id)
            .is_some_and(|s| s.id == session.0)
        {
            state.sessions.remove(extension_id);
        }
    }

    /// Forward a batch to the live session. A `done` batch ends the session.
    ///
    /// Returns false when the batch was dropped.
    pub fn deliver(&self, extension_id: &str, batch: StreamBatch) -> bool {
        let mut state = self.lock();

        let cancelled = state
            .flags
            .get(extension_id)
            .is_some_and(|f| f.load(Ordering::SeqCst));
        if cancelled {
            return false;
        }

        let Some(session) = state.sessions.get(extension_id) else {
            tracing::debug!(extension = extension_id, "dropping batch without session");
            return false;
        };

        let done = batch.done;
        (session.on_batch)(extension_id, batch);

        if done {
            state.sessions.remove(extension_id);
        }
        true
    }

    pub fn has_session(&self, extension_id: &str) -> bool {
        self.lock().sessions.contains_key(extension_id)
    }

    /// Cancel every session, e.g. on shutdown.
    pub fn cancel_all(&self) {
        let mut state = self.lock();
        for flag in state.flags.values() {
            flag.store(true, Ordering::SeqCst);
        }
        state.sessions.clear();
    }

    /// Forget an extension entirely once its sandbox is gone.
    pub fn remove(&self, extension_id: &str) {
        let mut state = self.lock();
        if let Some(flag) = state.flags.remove(extension_id) {
            flag.store(true, Ordering::SeqCst);
        }
        state.sessions.remove(extension_id);
    }
}
