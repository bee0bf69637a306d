//! IPC module for sandbox-to-host communication.
//!
//! This module holds the wire types that cross the sandbox boundary and the
//! deno_core ops that back the bridge primitives inside each isolate.

mod context;
mod macros;
mod ops;
mod types;

pub use context::{CallReply, SandboxContext};
pub use ops::mangyomi_sandbox;
pub use types::{
    ChallengeReply, FetchMethod, FetchRequest, FetchResponse, LogLevel, OutboundMessage,
    QueuedCall, ResponseType, SettledCall, StreamBatch,
};
