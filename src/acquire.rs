#![forbid(unsafe_code)]

//! Audio acquisition pipeline.
//!
//! Turns a YouTube URL into a local MP3 by running yt-dlp once per call:
//! validate the URL, spawn the tool with a deterministic output name, wait
//! with a deadline, then verify the file. Every file the call created in the
//! scratch directory is removed on the way out except the returned MP3, and
//! that one is deleted when the [`AcquisitionResult`] is dropped unless the
//! caller persists it somewhere else.

use std::{
    env, fs, io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use chrono::Utc;
use thiserror::Error;
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{DEFAULT_ACQUIRE_TIMEOUT_SECS, DEFAULT_AUDIO_QUALITY, DEFAULT_MAX_FILESIZE};
use crate::error::{ErrorKind, ToolFailureKind};

const TOOL_NAME: &str = "yt-dlp";
const OUTPUT_EXTENSION: &str = "mp3";
const FALLBACK_BINARIES: &[&str] = &["/usr/local/bin/yt-dlp", "/usr/bin/yt-dlp"];
// yt-dlp leaves these behind while a download or postprocessor is running.
const PARTIAL_EXTENSIONS: &[&str] = &["part", "ytdl", "temp", "tmp"];
const STDERR_GRACE: Duration = Duration::from_secs(5);

const YOUTUBE_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtube-nocookie.com",
    "www.youtube-nocookie.com",
];
const SHORT_LINK_HOSTS: &[&str] = &["youtu.be", "www.youtu.be"];

static SEQUENCE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("yt-dlp is not installed: {0}")]
    ToolNotInstalled(String),
    #[error("yt-dlp did not finish within {0:?}")]
    Timeout(Duration),
    #[error("{message}")]
    ExternalTool {
        kind: ToolFailureKind,
        message: String,
    },
    #[error("yt-dlp produced an empty file at {}", .0.display())]
    EmptyOutput(PathBuf),
    #[error("{operation} {}: {source}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AcquireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::ToolNotInstalled(_) => ErrorKind::ToolNotInstalled,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ExternalTool { kind, .. } => ErrorKind::ExternalToolFailure(*kind),
            Self::EmptyOutput(_) => ErrorKind::EmptyOutput,
            Self::Io { .. } => ErrorKind::Internal,
        }
    }

    fn io(operation: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A single "turn this URL into audio" call.
#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    pub source_url: String,
    /// Human-facing name (the upload title); only used for logs here.
    pub logical_name: String,
}

impl AcquisitionRequest {
    pub fn new(source_url: impl Into<String>, logical_name: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            logical_name: logical_name.into(),
        }
    }
}

/// Local MP3 produced by [`Acquirer::acquire`].
///
/// The file belongs to this value: dropping it deletes the file. Callers
/// that want to keep the audio must call [`AcquisitionResult::persist`].
#[derive(Debug)]
pub struct AcquisitionResult {
    path: PathBuf,
    size_bytes: u64,
    armed: bool,
}

impl AcquisitionResult {
    fn new(path: PathBuf, size_bytes: u64) -> Self {
        Self {
            path,
            size_bytes,
            armed: true,
        }
    }

    pub fn local_file_path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Moves the file to `destination` and gives up ownership of it.
    ///
    /// Falls back to copy-then-delete when a rename is not possible (the
    /// scratch directory often lives on another filesystem).
    pub fn persist(mut self, destination: &Path) -> Result<PathBuf, AcquireError> {
        if let Some(parent) = destination
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            fs::create_dir_all(parent)
                .map_err(|err| AcquireError::io("creating destination directory", parent, err))?;
        }

        if fs::rename(&self.path, destination).is_ok() {
            self.armed = false;
            return Ok(destination.to_path_buf());
        }

        fs::copy(&self.path, destination)
            .map_err(|err| AcquireError::io("copying acquired audio to", destination, err))?;
        // Still armed: dropping `self` removes the scratch copy.
        Ok(destination.to_path_buf())
    }
}

impl Drop for AcquisitionResult {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        remove_quietly(&self.path);
    }
}

/// Knobs for [`Acquirer`]. Built from [`crate::config::RuntimeSettings`] by
/// the binaries, or directly in tests.
#[derive(Debug, Clone)]
pub struct AcquireConfig {
    /// Explicit yt-dlp location. `None` searches `PATH` and then a few
    /// well-known install locations.
    pub binary: Option<PathBuf>,
    pub scratch_dir: PathBuf,
    pub timeout: Duration,
    /// Passed verbatim to `--max-filesize` (e.g. `50M`).
    pub max_filesize: String,
    /// Passed verbatim to `--audio-quality` (`0` is best VBR).
    pub audio_quality: String,
    pub ffmpeg_location: Option<PathBuf>,
}

impl AcquireConfig {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: None,
            scratch_dir: scratch_dir.into(),
            timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            max_filesize: DEFAULT_MAX_FILESIZE.to_string(),
            audio_quality: DEFAULT_AUDIO_QUALITY.to_string(),
            ffmpeg_location: None,
        }
    }
}

/// Validated handle to a yt-dlp installation plus the settings every call
/// shares. Cheap to clone; holds no per-call state.
#[derive(Debug, Clone)]
pub struct Acquirer {
    binary: PathBuf,
    config: AcquireConfig,
}

impl Acquirer {
    /// Locates yt-dlp and checks that `--version` succeeds.
    pub fn new(config: AcquireConfig) -> Result<Self, AcquireError> {
        let binary = resolve_binary(config.binary.as_deref())?;
        ensure_tool_runs(&binary)?;
        info!(binary = %binary.display(), scratch = %config.scratch_dir.display(), "yt-dlp ready");
        Ok(Self { binary, config })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn config(&self) -> &AcquireConfig {
        &self.config
    }

    pub async fn acquire(
        &self,
        request: &AcquisitionRequest,
    ) -> Result<AcquisitionResult, AcquireError> {
        self.acquire_with_timeout(request, self.config.timeout).await
    }

    pub async fn acquire_with_timeout(
        &self,
        request: &AcquisitionRequest,
        timeout: Duration,
    ) -> Result<AcquisitionResult, AcquireError> {
        let url = validate_source_url(&request.source_url)?;
        if request.logical_name.trim().is_empty() {
            return Err(AcquireError::InvalidInput("a name is required".into()));
        }

        let scratch_dir = &self.config.scratch_dir;
        tokio::fs::create_dir_all(scratch_dir)
            .await
            .map_err(|err| AcquireError::io("creating scratch directory", scratch_dir, err))?;

        let token = next_token();
        let mut sweep = ScratchSweep::new(scratch_dir, &token);
        let expected = scratch_dir.join(format!("{token}.{OUTPUT_EXTENSION}"));
        let started = Instant::now();
        info!(%token, url = %url, name = %request.logical_name, "starting acquisition");

        let stderr = self.run_tool(&url, &token, timeout).await?;

        let Some(output) = resolve_output(scratch_dir, &token, &expected) else {
            let kind = match classify_failure(&stderr) {
                ToolFailureKind::FileTooLarge => ToolFailureKind::FileTooLarge,
                _ => ToolFailureKind::Generic,
            };
            return Err(AcquireError::ExternalTool {
                kind,
                message: summarize_stderr(&stderr)
                    .unwrap_or_else(|| "yt-dlp exited successfully but wrote no file".into()),
            });
        };

        let size_bytes = fs::metadata(&output)
            .map_err(|err| AcquireError::io("reading metadata of", &output, err))?
            .len();
        if size_bytes == 0 {
            return Err(AcquireError::EmptyOutput(output));
        }

        sweep.keep(&output);
        info!(
            %token,
            path = %output.display(),
            size_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "acquisition finished"
        );
        Ok(AcquisitionResult::new(output, size_bytes))
    }

    /// Spawns yt-dlp and waits for it. Returns captured stderr on a zero exit.
    async fn run_tool(
        &self,
        url: &Url,
        token: &str,
        timeout: Duration,
    ) -> Result<String, AcquireError> {
        let template = self.config.scratch_dir.join(format!("{token}.%(ext)s"));

        let mut command = Command::new(&self.binary);
        command
            .arg("--format")
            .arg("bestaudio/best")
            .arg("--extract-audio")
            .arg("--audio-format")
            .arg(OUTPUT_EXTENSION)
            .arg("--audio-quality")
            .arg(&self.config.audio_quality)
            .arg("--max-filesize")
            .arg(&self.config.max_filesize)
            .arg("--no-playlist")
            .arg("--no-progress")
            .arg("--no-warnings")
            .arg("--no-overwrites")
            .arg("--output")
            .arg(&template);
        if let Some(ffmpeg) = &self.config.ffmpeg_location {
            command.arg("--ffmpeg-location").arg(ffmpeg);
        }
        command
            .arg(url.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // ffmpeg runs as a child of yt-dlp; a group kill takes it down too.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                AcquireError::ExternalTool {
                    kind: ToolFailureKind::BinaryMissing,
                    message: format!("{} is missing: {err}", self.binary.display()),
                }
            } else {
                AcquireError::io("spawning", &self.binary, err)
            }
        })?;

        let stderr_task = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Err(err) = pipe.read_to_end(&mut buf).await {
                    debug!("stopped reading yt-dlp stderr: {err}");
                }
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(waited) => {
                waited.map_err(|err| AcquireError::io("waiting for", &self.binary, err))?
            }
            Err(_) => {
                warn!(%token, ?timeout, "yt-dlp timed out; killing it");
                terminate(&mut child, token).await;
                if let Some(task) = stderr_task {
                    task.abort();
                }
                return Err(AcquireError::Timeout(timeout));
            }
        };

        let stderr = match stderr_task {
            Some(task) => match tokio::time::timeout(STDERR_GRACE, task).await {
                Ok(Ok(text)) => text,
                _ => String::new(),
            },
            None => String::new(),
        };

        if status.success() {
            debug!(%token, "yt-dlp exited cleanly");
            return Ok(stderr);
        }

        let kind = classify_failure(&stderr);
        let message =
            summarize_stderr(&stderr).unwrap_or_else(|| format!("yt-dlp exited with {status}"));
        warn!(%token, kind = kind.as_str(), %status, "yt-dlp failed: {message}");
        Err(AcquireError::ExternalTool { kind, message })
    }
}

/// Kills the tool's whole process group and reaps the direct child.
async fn terminate(child: &mut Child, token: &str) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Some(pgid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) => {
                    if let Err(err) = child.wait().await {
                        warn!(%token, "failed to reap yt-dlp: {err}");
                    }
                    return;
                }
                Err(err) => warn!(%token, "failed to kill yt-dlp process group: {err}"),
            }
        }
    }
    if let Err(err) = child.kill().await {
        warn!(%token, "failed to kill yt-dlp: {err}");
    }
}

/// Accepts only links that point at a single YouTube video.
pub fn validate_source_url(raw: &str) -> Result<Url, AcquireError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AcquireError::InvalidInput("a source URL is required".into()));
    }
    let url = Url::parse(trimmed)
        .map_err(|err| AcquireError::InvalidInput(format!("{trimmed:?} is not a URL: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AcquireError::InvalidInput(format!(
            "unsupported URL scheme {:?}",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| AcquireError::InvalidInput("URL has no host".into()))?;
    let video_id = if SHORT_LINK_HOSTS.contains(&host.as_str()) {
        url.path_segments()
            .and_then(|mut segments| segments.next())
            .map(str::to_owned)
    } else if YOUTUBE_HOSTS.contains(&host.as_str()) {
        youtube_video_id(&url)
    } else {
        return Err(AcquireError::InvalidInput(format!(
            "{host} is not a supported video host"
        )));
    };

    match video_id {
        Some(id) if is_video_id(&id) => Ok(url),
        _ => Err(AcquireError::InvalidInput(format!(
            "{trimmed} does not point at a single video"
        ))),
    }
}

fn youtube_video_id(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    match segments.next()? {
        "watch" => url
            .query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.into_owned()),
        "shorts" | "embed" | "live" | "v" => segments.next().map(str::to_owned),
        _ => None,
    }
}

fn is_video_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

/// `<millis>-<pid>-<seq>`: unique across concurrent calls in this process
/// and across processes sharing a scratch directory.
fn next_token() -> String {
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}-{}-{sequence}",
        Utc::now().timestamp_millis(),
        std::process::id()
    )
}

/// Maps yt-dlp's stderr onto a failure class. Matching is on lowercase text
/// because yt-dlp's wording shifts between releases.
pub fn classify_failure(stderr: &str) -> ToolFailureKind {
    let text = stderr.to_ascii_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|needle| text.contains(needle));

    if any(&["larger than max-filesize", "file is larger than"]) {
        ToolFailureKind::FileTooLarge
    } else if any(&[
        "video unavailable",
        "private video",
        "this video is not available",
        "has been removed",
        "members-only",
        "sign in to confirm your age",
        "unsupported url",
        "is not a valid url",
        "requested format is not available",
        "no video formats found",
    ]) {
        ToolFailureKind::SourceUnavailable
    } else if any(&[
        "unable to download webpage",
        "timed out",
        "connection reset",
        "connection refused",
        "temporary failure in name resolution",
        "failed to resolve",
        "network is unreachable",
        "http error 5",
        "ssl",
    ]) {
        ToolFailureKind::Network
    } else {
        ToolFailureKind::Generic
    }
}

/// Picks the most useful line of stderr: the last `ERROR:` line, otherwise the
/// last non-empty line.
fn summarize_stderr(stderr: &str) -> Option<String> {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    lines
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|line| line.to_string())
}

/// Returns the expected file, or the first finished file carrying the token
/// when yt-dlp picked another extension.
fn resolve_output(scratch_dir: &Path, token: &str, expected: &Path) -> Option<PathBuf> {
    if expected.is_file() {
        return Some(expected.to_path_buf());
    }
    let found = token_files(scratch_dir, token)
        .into_iter()
        .find(|path| !is_partial(path));
    if let Some(path) = &found {
        warn!(
            expected = %expected.display(),
            found = %path.display(),
            "expected output missing; using scanned file"
        );
    }
    found
}

fn is_partial(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| PARTIAL_EXTENSIONS.contains(&ext))
}

/// Every regular file in `dir` whose name starts with `<token>.`, sorted.
fn token_files(dir: &Path, token: &str) -> Vec<PathBuf> {
    let prefix = format!("{token}.");
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
        .map(|entry| entry.path())
        .collect();
    files.sort();
    files
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed scratch file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "failed to remove scratch file: {err}"),
    }
}

/// Removes every scratch file of one call when dropped, except the one
/// marked with [`ScratchSweep::keep`].
struct ScratchSweep {
    dir: PathBuf,
    token: String,
    keep: Option<PathBuf>,
}

impl ScratchSweep {
    fn new(dir: &Path, token: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            token: token.to_string(),
            keep: None,
        }
    }

    fn keep(&mut self, path: &Path) {
        self.keep = Some(path.to_path_buf());
    }
}

impl Drop for ScratchSweep {
    fn drop(&mut self) {
        for path in token_files(&self.dir, &self.token) {
            if self.keep.as_deref() == Some(path.as_path()) {
                continue;
            }
            remove_quietly(&path);
        }
    }
}

fn resolve_binary(explicit: Option<&Path>) -> Result<PathBuf, AcquireError> {
    if let Some(path) = explicit {
        // A bare name like `yt-dlp2` is looked up on PATH.
        if path.components().count() == 1 {
            if let Some(found) = find_on_path(path) {
                return Ok(found);
            }
        }
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(AcquireError::ToolNotInstalled(format!(
            "{} does not exist",
            path.display()
        )));
    }

    if let Some(found) = find_on_path(Path::new(TOOL_NAME)) {
        return Ok(found);
    }

    fallback_binaries()
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            AcquireError::ToolNotInstalled(format!(
                "{TOOL_NAME} not found in PATH or fallback locations"
            ))
        })
}

fn find_on_path(name: &Path) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn fallback_binaries() -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = FALLBACK_BINARIES.iter().map(PathBuf::from).collect();
    if let Some(home) = env::var_os("HOME") {
        candidates.push(PathBuf::from(home).join(".local/bin").join(TOOL_NAME));
    }
    candidates
}

/// Runs `<binary> --version` so a broken install fails at startup rather than
/// on the first upload.
fn ensure_tool_runs(binary: &Path) -> Result<(), AcquireError> {
    let status = std::process::Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(AcquireError::ToolNotInstalled(format!(
            "{} --version exited with {status}",
            binary.display()
        ))),
        Err(err) => Err(AcquireError::ToolNotInstalled(format!(
            "{} could not be started: {err}",
            binary.display()
        ))),
    }
}
