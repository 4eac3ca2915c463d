#![forbid(unsafe_code)]

//! Process-level guards shared by the meme-audio binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to start as root; yt-dlp and ffmpeg are spawned with the
/// caller's privileges.
pub fn ensure_not_root(process: &str) -> Result<()> {
    refuse_root(Uid::current(), process)
}

fn refuse_root(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; start it from an unprivileged service account");
    }
    Ok(())
}
