//! Idle reclamation.
//!
//! A single timer per host wakes on a fixed interval and destroys instances
//! that have sat unused past the idle timeout. Pinned instances, instances
//! with a live streaming session and instances with a call in flight are
//! never reclaimed. The timer exits once no instances remain and is started
//! again by the next creation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::host::{HostInner, SandboxInstance};
use super::streaming::StreamingRelay;
use super::ExtensionId;

/// Ids of instances eligible for reclamation.
pub(crate) fn idle_candidates(
    instances: &HashMap<ExtensionId, Arc<SandboxInstance>>,
    pinned: &HashSet<ExtensionId>,
    relay: &StreamingRelay,
    timeout: Duration,
) -> Vec<ExtensionId> {
    instances
        .iter()
        .filter(|(id, instance)| {
            instance.idle_for() > timeout
                && instance.in_flight() == 0
                && !pinned.contains(id.as_str())
                && !relay.has_session(id)
        })
        .map(|(id, _)| id.clone())
        .collect()
}

/// Spawn the reclamation timer for a host.
///
/// Holds only a weak reference so a dropped host stops it on the next tick.
pub(crate) fn spawn_reaper(host: Weak<HostInner>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!(interval_secs = interval.as_secs(), "idle reclamation started");

        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(host) = host.upgrade() else { break };
            host.reclaim_idle();
            if host.stop_reaper_if_empty() {
                break;
            }
        }

        tracing::debug!("idle reclamation stopped");
    })
}
