//! CLI commands for Mangyomi.
//!
//! Developer tooling for extension authors: check, list, invoke.

pub mod check;
pub mod invoke;
pub mod list;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mangyomi")]
#[command(about = "Sandboxed extension runtime for Mangyomi", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: <config_dir>/mangyomi/sandbox.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate an extension package
    Check {
        /// Path to extension directory (default: current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// List installed extension packages
    List {
        /// Extensions directory (default: from config)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Load a package into a sandbox and call one of its functions
    Invoke {
        /// Path to extension directory
        path: PathBuf,

        /// Exported function to call
        function: String,

        /// Arguments, each a JSON value (bare words are passed as strings)
        args: Vec<String>,

        /// Print streamed page batches as they arrive
        #[arg(long)]
        stream: bool,
    },
}

/// Parse arguments and run the selected command.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => crate::config::SandboxConfig::load_from(path),
        None => crate::config::SandboxConfig::load(),
    };

    match cli.command {
        Commands::Check { path } => check::run_check(&path),
        Commands::List { dir } => {
            let dir = dir.unwrap_or_else(|| config.extensions_dir.clone());
            list::run_list(&dir)
        }
        Commands::Invoke {
            path,
            function,
            args,
            stream,
        } => invoke::run_invoke(config, &path, &function, &args, stream),
    }
}
