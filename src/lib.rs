//! Mangyomi - sandboxed extension runtime for a manga reader.
//!
//! Source extensions are third-party JavaScript that scrape manga sites.
//! This crate runs each one in an isolated V8 context and mediates every
//! capability it uses: network access limited to declared domains,
//! anti-bot challenge solving in a real browser surface, and incremental
//! page delivery.
//!
//! # Architecture
//!
//! - [`config`] - Sandbox configuration loading and defaults
//! - [`extensions`] - Registry, lifecycle manager, capability bridge,
//!   challenge solver, streaming relay and invocation layer
//! - [`cli`] - Developer commands for extension authors
//!
//! # Example
//!
//! ```ignore
//! use mangyomi::{SandboxConfig, SandboxHost};
//!
//! let config = SandboxConfig::load();
//! let host = SandboxHost::with_defaults(config.clone())?;
//! host.scan(&config.extensions_dir)?;
//!
//! let outcome = host.invoke("mangadex", "getPopularManga", vec![1.into()]).await;
//! println!("{}", outcome.to_json());
//! ```

pub mod cli;
pub mod config;
pub mod extensions;

pub use config::SandboxConfig;
pub use extensions::{
    ExtensionError, ExtensionResult, InvocationOutcome, Manifest, SandboxHost,
};
