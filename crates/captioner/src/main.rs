//! Captioner CLI - image captioning service.
//!
//! Captioner loads a vision encoder-decoder model once at startup and
//! captions uploaded JPEG and PNG images over HTTP.
//!
//! # Usage
//!
//! ```bash
//! # Start the HTTP service
//! captioner serve --port 8000
//!
//! # Caption a single image
//! captioner caption cat.jpg
//!
//! # Check the model directory
//! captioner models check
//!
//! # View configuration
//! captioner config show
//! ```

use clap::{Parser, Subcommand};

mod cli;
mod logging;
mod server;

/// Captioner - image captioning service backed by a vision encoder-decoder model.
#[derive(Parser, Debug)]
#[command(name = "captioner")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP captioning service
    Serve(cli::serve::ServeArgs),

    /// Caption a single image file
    Caption(cli::caption::CaptionArgs),

    /// Inspect the model artifact directory
    Models(cli::models::ModelsArgs),

    /// View and manage configuration
    Config(cli::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging isn't initialized yet, so config warnings go through eprintln.
    let config = match captioner_core::Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Warning: Failed to load config: {e}\n  \
                 Using default configuration. Check your config file with `captioner config path`."
            );
            captioner_core::Config::default()
        }
    };
    logging::init_from_config(&config, cli.verbose, cli.json_logs);

    tracing::debug!("Captioner v{}", captioner_core::VERSION);

    match cli.command {
        Commands::Serve(args) => cli::serve::execute(args, config).await,
        Commands::Caption(args) => cli::caption::execute(args, config).await,
        Commands::Models(args) => cli::models::execute(args, config).await,
        Commands::Config(args) => cli::config::execute(args).await,
    }
}
