//! List command for `mangyomi list`.

use std::path::Path;

use anyhow::Result;
use console::style;

use crate::extensions::ManifestRegistry;

/// Scan an extensions directory and print every valid package.
pub fn run_list(dir: &Path) -> Result<()> {
    let mut registry = ManifestRegistry::new();
    registry
        .scan_dir(dir)
        .map_err(|e| anyhow::anyhow!("Failed to scan {}: {}", dir.display(), e))?;

    if registry.is_empty() {
        println!(
            "{} {}",
            style("No extensions installed in").dim(),
            dir.display()
        );
        return Ok(());
    }

    for manifest in registry.list() {
        let nsfw = if manifest.nsfw {
            style(" nsfw").red().to_string()
        } else {
            String::new()
        };
        println!(
            "{} {}{}  {}",
            style(&manifest.id).cyan().bold(),
            style(format!("v{}", manifest.version)).dim(),
            nsfw,
            manifest.base_url
        );
    }

    Ok(())
}
