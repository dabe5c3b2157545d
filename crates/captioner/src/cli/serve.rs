//! The `captioner serve` command.

use std::path::PathBuf;

use clap::Args;
use captioner_core::Config;

use crate::server;

/// Arguments for the `serve` command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind (overrides `server.host`)
    #[arg(long, env = "CAPTIONER_HOST")]
    pub host: Option<String>,

    /// Port to bind (overrides `server.port`)
    #[arg(short, long, env = "CAPTIONER_PORT")]
    pub port: Option<u16>,

    /// Model artifact directory (overrides `general.model_dir`)
    #[arg(long, env = "CAPTIONER_MODEL_DIR")]
    pub model_dir: Option<PathBuf>,

    /// Built front end directory (overrides `server.static_dir`)
    #[arg(long)]
    pub static_dir: Option<PathBuf>,

    /// Concurrent caption generations (overrides `inference.workers`)
    #[arg(short, long)]
    pub workers: Option<usize>,
}

/// Execute the serve command.
///
/// The model is loaded before the listener binds; a broken artifact
/// directory aborts startup instead of failing every request.
pub async fn execute(args: ServeArgs, mut config: Config) -> anyhow::Result<()> {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(model_dir) = args.model_dir {
        config.general.model_dir = model_dir;
    }
    if let Some(static_dir) = args.static_dir {
        config.server.static_dir = static_dir;
    }
    if let Some(workers) = args.workers {
        config.inference.workers = workers;
    }
    config.validate()?;

    let captioner = super::load_captioner(&config).await?;
    server::serve(captioner, &config).await
}
