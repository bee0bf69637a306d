//! Invoke command for `mangyomi invoke`.
//!
//! Loads a package into a real sandbox, calls one function and prints the
//! structured outcome.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use serde_json::Value;

use crate::config::SandboxConfig;
use crate::extensions::{Manifest, SandboxHost, StreamBatch};

/// Parse a CLI argument as JSON, falling back to a plain string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn run_invoke(
    config: SandboxConfig,
    path: &Path,
    function: &str,
    args: &[String],
    stream: bool,
) -> Result<()> {
    let ext_dir = path
        .canonicalize()
        .context(format!("Extension directory not found: {}", path.display()))?;

    let manifest = Manifest::load_package(&ext_dir)
        .map_err(|e| anyhow::anyhow!("Invalid extension package: {}", e))?;
    let id = manifest.id.clone();
    let args: Vec<Value> = args.iter().map(|a| parse_arg(a)).collect();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        let host = SandboxHost::with_defaults(config)?;
        host.register(&id, manifest, &ext_dir)?;

        let outcome = if stream {
            let on_batch = Arc::new(|_: &str, batch: StreamBatch| {
                let total = batch
                    .total
                    .map(|t| format!("/{}", t))
                    .unwrap_or_default();
                println!(
                    "{} {} page(s){}{}",
                    style("▸").cyan(),
                    batch.pages.len(),
                    total,
                    if batch.done { " (done)" } else { "" }
                );
                for page in &batch.pages {
                    println!("    {}", page);
                }
            });
            host.stream(&id, function, args, on_batch).await
        } else {
            host.invoke(&id, function, args).await
        };

        let marker = if outcome.is_success() {
            style("✓").green().bold()
        } else {
            style("✗").red().bold()
        };
        println!("{} {}", marker, style(function).cyan());
        println!("{}", serde_json::to_string_pretty(&outcome.to_json())?);

        host.shutdown();
        Ok::<(), anyhow::Error>(())
    })
}
