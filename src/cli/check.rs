//! Check command for `mangyomi check`.
//!
//! Validates a package the same way the registry does before it loads one.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use crate::extensions::{AllowedDomainSet, Manifest};

/// Validate a package and print what the sandbox would allow it to reach.
pub fn run_check(path: &Path) -> Result<()> {
    let ext_dir = path
        .canonicalize()
        .context(format!("Extension directory not found: {}", path.display()))?;

    let manifest = Manifest::load_package(&ext_dir)
        .map_err(|e| anyhow::anyhow!("Invalid extension package: {}", e))?;

    let allowed = AllowedDomainSet::from_manifest(&manifest)
        .map_err(|e| anyhow::anyhow!("Invalid domains: {}", e))?;

    println!(
        "{} {} {}",
        style("✓").green().bold(),
        style(&manifest.name).cyan().bold(),
        style(format!("{} v{}", manifest.id, manifest.version)).dim()
    );
    println!("  {} {}", style("entry").dim(), manifest.main);
    println!("  {} {}", style("base url").dim(), manifest.base_url);

    println!("  {}", style("allowed domains").dim());
    for pattern in allowed.patterns() {
        println!("    {}", pattern);
    }

    let caps = &manifest.capabilities;
    let mut flags = Vec::new();
    if caps.streaming {
        flags.push("streaming");
    }
    if caps.filters {
        flags.push("filters");
    }
    if caps.cloudflare {
        flags.push("cloudflare");
    }
    if manifest.nsfw {
        flags.push("nsfw");
    }
    if !flags.is_empty() {
        println!("  {} {}", style("capabilities").dim(), flags.join(", "));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_check_valid_package() {
        let temp = tempdir().unwrap();
        fs::write(
            temp.path().join("manifest.json"),
            r#"{"id":"demo","name":"Demo","version":"1.0.0","baseUrl":"https://demo.test","domains":["*.cdn.test"]}"#,
        )
        .unwrap();
        fs::write(temp.path().join("index.js"), "module.exports = {};").unwrap();

        assert!(run_check(temp.path()).is_ok());
    }

    #[test]
    fn test_check_missing_entry() {
        let temp = tempdir().unwrap();
        fs::write(
            temp.path().join("manifest.json"),
            r#"{"id":"demo","name":"Demo","version":"1.0.0","baseUrl":"https://demo.test"}"#,
        )
        .unwrap();

        let err = run_check(temp.path()).unwrap_err();
        assert!(err.to_string().contains("index.js"));
    }
}
