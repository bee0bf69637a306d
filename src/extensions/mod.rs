//! Extension sandbox for Mangyomi.
//!
//! Third-party source extensions are untrusted JavaScript. Each one runs in
//! its own V8 isolate with no ambient capabilities; everything it can do to
//! the outside world goes through the capability bridge, checked against the
//! domains its manifest declares.
//!
//! # Architecture
//!
//! ```text
//! SandboxHost
//! ├── registry: ManifestRegistry (id -> manifest, package path, allowed domains)
//! ├── instances: HashMap<ExtensionId, SandboxInstance>
//! │   ├── context: ExecutionContext (isolate thread)
//! │   ├── capabilities: CapabilityTable
//! │   └── pump: outbound channel dispatcher
//! ├── pending: HashMap<ExtensionId, PendingCreation>
//! ├── pinned: HashSet<ExtensionId>
//! └── reaper: idle reclamation timer
//!
//! Bridge (shared)
//! ├── identity: host NetworkIdentity (cookie jar)
//! ├── transport: HttpTransport
//! └── solver: ChallengeSolver (debounced, visible surface)
//!
//! StreamingRelay
//! └── sessions + cancellation flags per extension
//! ```
//!
//! Instances are created on first use, shared by concurrent callers, and
//! reclaimed after sitting idle unless pinned or streaming.

pub mod bridge;
mod capabilities;
pub mod challenge;
mod error;
mod host;
pub mod html;
mod idle;
mod invoke;
pub mod ipc;
mod isolate;
mod manifest;
pub mod permissions;
mod registry;
mod streaming;

#[cfg(test)]
pub(crate) mod test_support;

pub use bridge::{Bridge, HttpTransport, NetworkIdentity, ReqwestTransport};
pub use capabilities::{CapabilityTable, ExtensionFunction};
pub use challenge::{ChallengeOutcome, ChallengeSolver, RenderSurface, SurfaceFactory};
pub use error::{ExtensionError, ExtensionResult};
pub use host::{SandboxHost, SandboxInstance};
pub use invoke::{CallResult, InvocationOutcome};
pub use ipc::{mangyomi_sandbox, FetchRequest, FetchResponse, SandboxContext, StreamBatch};
pub use isolate::{ContextSpec, DenoEngine, ExecutionContext, SandboxEngine};
pub use manifest::{Manifest, ManifestCapabilities, MANIFEST_FILE};
pub use permissions::AllowedDomainSet;
pub use registry::{ManifestRegistry, RegistryEntry};
pub use streaming::{BatchCallback, SessionId, StreamingRelay};

/// Unique identifier for an extension.
pub type ExtensionId = String;
