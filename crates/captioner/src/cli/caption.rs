//! The `captioner caption` command for one-off captions from the terminal.

use std::path::PathBuf;

use clap::Args;
use captioner_core::{Config, UploadedFile};

/// Arguments for the `caption` command.
#[derive(Args, Debug)]
pub struct CaptionArgs {
    /// Image file to caption
    pub file: PathBuf,

    /// Declared content type (default: guessed from the extension)
    #[arg(long)]
    pub content_type: Option<String>,

    /// Model artifact directory (overrides `general.model_dir`)
    #[arg(long, env = "CAPTIONER_MODEL_DIR")]
    pub model_dir: Option<PathBuf>,

    /// Print the HTTP response JSON instead of plain captions
    #[arg(long)]
    pub json: bool,
}

/// Execute the caption command.
pub async fn execute(args: CaptionArgs, mut config: Config) -> anyhow::Result<()> {
    if let Some(model_dir) = args.model_dir {
        config.general.model_dir = model_dir;
    }

    let bytes = std::fs::read(&args.file)?;
    let filename = args
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();
    let content_type = args
        .content_type
        .or_else(|| content_type_for(&filename).map(str::to_string));
    let file = UploadedFile::new(filename, content_type, bytes);

    let captioner = super::load_captioner(&config).await?;

    if args.json {
        let response = captioner.respond(file).await;
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    match captioner.caption(file).await {
        Ok(captions) => {
            for caption in captions {
                println!("{}", caption);
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// The content type a browser would declare for this filename.
fn content_type_for(filename: &str) -> Option<&'static str> {
    let ext = filename.rsplit_once('.')?.1;
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}
