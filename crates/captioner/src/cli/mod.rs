//! Command handlers.

pub mod caption;
pub mod config;
pub mod models;
pub mod serve;

use captioner_core::{Captioner, Config};

/// Load the model on a blocking thread; assembly reads and parses every artifact.
pub async fn load_captioner(config: &Config) -> anyhow::Result<Captioner> {
    let config = config.clone();
    let captioner = tokio::task::spawn_blocking(move || Captioner::load(&config)).await??;
    Ok(captioner)
}
