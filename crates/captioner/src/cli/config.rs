//! The `captioner config` command for configuration management.

use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};
use captioner_core::Config;

/// Arguments for the `config` command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Display the effective configuration as TOML
    Show {
        /// Show built-in defaults instead of the config file
        #[arg(long)]
        defaults: bool,
    },

    /// Show config file path
    Path,

    /// Write a config file with defaults
    Init {
        /// Write here instead of the platform config directory
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

/// Execute the config command.
pub async fn execute(args: ConfigArgs) -> anyhow::Result<()> {
    match args.command {
        ConfigCommand::Show { defaults } => {
            let config = if defaults {
                Config::default()
            } else {
                Config::load()?
            };
            println!("{}", config.to_toml()?);
        }

        ConfigCommand::Path => {
            let path = Config::default_path();
            let note = if path.exists() { "" } else { " (not created)" };
            println!("{}{}", path.display(), note);
        }

        ConfigCommand::Init { path, force } => {
            let path = path.unwrap_or_else(Config::default_path);
            write_default(&path, force)?;
            tracing::info!("Config file created at: {}", path.display());
            println!("Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn write_default(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at: {}\nUse --force to overwrite.",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, Config::default().to_toml()?)?;
    Ok(())
}
