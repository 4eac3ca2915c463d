#![forbid(unsafe_code)]

//! One-shot CLI around the acquisition pipeline: fetch a single video's audio
//! and leave the MP3 where the caller asked.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use meme_audio::acquire::{Acquirer, AcquisitionRequest};
use meme_audio::config::{RuntimeOverrides, resolve_runtime_settings};
use meme_audio::logging::init_tracing;
use meme_audio::security::ensure_not_root;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "fetch_audio", about = "Download a YouTube video's audio as MP3")]
struct FetchArgs {
    /// Video URL (youtube.com, youtu.be, shorts, embeds).
    url: String,

    /// Name used for logging and for the default output file.
    #[arg(short, long, default_value = "audio")]
    name: String,

    /// Destination file. Defaults to `<name>.<ext>` in the current directory.
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    media_root: Option<PathBuf>,

    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// yt-dlp binary to use instead of searching PATH.
    #[arg(long)]
    ytdlp: Option<PathBuf>,

    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl FetchArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            media_root: self.media_root.clone(),
            scratch_dir: self.scratch_dir.clone(),
            ytdlp_bin: self.ytdlp.clone(),
            acquire_timeout_secs: self.timeout_secs,
            env_path: self.env_file.clone(),
            ..RuntimeOverrides::default()
        }
    }
}

/// `<name>.<ext>` with path separators flattened so the name cannot point
/// outside the working directory.
fn default_destination(name: &str, acquired: &Path) -> PathBuf {
    let stem: String = name
        .trim()
        .chars()
        .map(|ch| if matches!(ch, '/' | '\\') { '_' } else { ch })
        .collect();
    let stem = match stem.as_str() {
        "" | "." | ".." => "audio".to_string(),
        _ => stem,
    };
    let ext = acquired
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("mp3");
    PathBuf::from(format!("{stem}.{ext}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = FetchArgs::parse();
    ensure_not_root("fetch_audio")?;

    let settings = resolve_runtime_settings(args.overrides())?;
    let acquirer = Acquirer::new(settings.acquire_config()).context("checking yt-dlp")?;

    let request = AcquisitionRequest::new(args.url.clone(), args.name.clone());
    let result = acquirer
        .acquire(&request)
        .await
        .map_err(|err| anyhow!("{} ({})", err, err.kind().as_str()))?;

    let size = result.size_bytes();
    let destination = args
        .output
        .clone()
        .unwrap_or_else(|| default_destination(&args.name, result.local_file_path()));
    let placed = result
        .persist(&destination)
        .with_context(|| format!("placing audio at {}", destination.display()))?;

    info!(path = %placed.display(), size_bytes = size, "audio saved");
    println!("{}", placed.display());
    Ok(())
}
