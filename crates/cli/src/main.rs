mod config;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use stackward_engine::LocalStackApi;
use stackward_lsp::Backend;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Change-set validation and deployment for infrastructure templates.
#[derive(Parser)]
#[command(
    name = "stackward",
    version,
    about = "Change-set validation and deployment for infrastructure templates"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the language server (stdio)
    Lsp {
        /// Path to stackward.toml
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration as JSON
    Config {
        /// Path to stackward.toml
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Lsp { config } => cmd_lsp(config.as_deref()),
        Commands::Config { config } => cmd_config(config.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Config {
    match config::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
}

/// `RUST_LOG` wins over the configured level. Logs go to stderr; stdout
/// carries the protocol.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_lsp(path: Option<&Path>) {
    let config = load_config(path);
    init_logging(&config.log_level);
    tracing::info!(
        region = %config.region,
        enhanced_regions = ?config.enhanced_diagnostics.regions,
        "starting language server"
    );

    let backend = Backend {
        api: Arc::new(LocalStackApi::new()),
        flags: Arc::new(config.feature_flags()),
        settings: config.engine_settings(),
    };
    if let Err(e) = stackward_lsp::run(backend) {
        eprintln!("error: language server failed: {}", e);
        process::exit(1);
    }
}

fn cmd_config(path: Option<&Path>) {
    let config = load_config(path);
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("error: could not serialize configuration: {}", e);
            process::exit(1);
        }
    }
}
