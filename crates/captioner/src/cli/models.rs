//! The `captioner models` command for inspecting the artifact directory.

use clap::{Args, Subcommand};
use captioner_core::{ArtifactPaths, Config, ModelAssembler};

/// Arguments for the `models` command.
#[derive(Args, Debug)]
pub struct ModelsArgs {
    #[command(subcommand)]
    pub command: ModelsCommand,
}

/// Subcommands for model management.
#[derive(Subcommand, Debug)]
pub enum ModelsCommand {
    /// Check that every artifact is present
    Check {
        /// Also assemble the full model bundle
        #[arg(long)]
        load: bool,
    },

    /// Show model directory path
    Path,
}

/// Execute the models command.
pub async fn execute(args: ModelsArgs, config: Config) -> anyhow::Result<()> {
    let model_dir = config.model_dir();

    match args.command {
        ModelsCommand::Check { load } => {
            let paths = ArtifactPaths::in_dir(&model_dir);
            println!("Model directory: {}", model_dir.display());
            for (name, path) in paths.entries() {
                let status = if path.exists() { "ok" } else { "MISSING" };
                println!("  {:<26} {:<8} {}", name, status, path.display());
            }

            let missing = paths.missing();
            if !missing.is_empty() {
                anyhow::bail!("{} artifact(s) missing", missing.len());
            }

            if load {
                let bundle = tokio::task::spawn_blocking(move || {
                    ModelAssembler::new(paths).assemble()
                })
                .await??;
                let config = bundle.model.config();
                println!(
                    "Model bundle OK: {} (vocab {}, image {}px, tokenizer vocab {})",
                    config.model_type.as_deref().unwrap_or("unknown"),
                    config.decoder.vocab_size,
                    config.encoder.image_size,
                    bundle.tokenizer.vocab_size()
                );
            }
        }

        ModelsCommand::Path => {
            println!("{}", model_dir.display());
        }
    }

    Ok(())
}
