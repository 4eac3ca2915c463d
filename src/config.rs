#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::acquire::AcquireConfig;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_FILESIZE: &str = "50M";
pub const DEFAULT_AUDIO_QUALITY: &str = "0";
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

const SCRATCH_SUBDIR: &str = "scratch";
const LIBRARY_DB_FILE: &str = "library.db";

/// Everything the binaries need to know about their environment, already
/// merged from CLI overrides, the process environment and the `.env` file.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub media_root: PathBuf,
    pub scratch_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub public_base_url: String,
    pub ytdlp_bin: Option<PathBuf>,
    pub ffmpeg_location: Option<PathBuf>,
    pub acquire_timeout: Duration,
    pub max_filesize: String,
    pub audio_quality: String,
    pub auth_secret: Option<String>,
    pub token_ttl: Duration,
}

impl RuntimeSettings {
    pub fn library_db(&self) -> PathBuf {
        self.media_root.join(LIBRARY_DB_FILE)
    }

    pub fn acquire_config(&self) -> AcquireConfig {
        AcquireConfig {
            binary: self.ytdlp_bin.clone(),
            scratch_dir: self.scratch_dir.clone(),
            timeout: self.acquire_timeout,
            max_filesize: self.max_filesize.clone(),
            audio_quality: self.audio_quality.clone(),
            ffmpeg_location: self.ffmpeg_location.clone(),
        }
    }

    /// The backend cannot mint tokens without a secret, so it asks for one
    /// explicitly instead of silently generating a throwaway key.
    pub fn require_auth_secret(&self) -> Result<&str> {
        self.auth_secret
            .as_deref()
            .ok_or_else(|| anyhow!("AUTH_SECRET not set"))
    }
}

pub fn load_runtime_settings() -> Result<RuntimeSettings> {
    resolve_runtime_settings(RuntimeOverrides::default())
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub media_root: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub ytdlp_bin: Option<PathBuf>,
    pub acquire_timeout_secs: Option<u64>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeSettings> {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let media_root = overrides
        .media_root
        .or_else(|| lookup("MEDIA_ROOT").map(PathBuf::from))
        .ok_or_else(|| anyhow!("MEDIA_ROOT not set"))?;
    let scratch_dir = overrides
        .scratch_dir
        .or_else(|| lookup("SCRATCH_DIR").map(PathBuf::from))
        .unwrap_or_else(|| media_root.join(SCRATCH_SUBDIR));
    let port = overrides
        .port
        .or_else(|| lookup("MEME_AUDIO_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(non_blank)
        .or_else(|| lookup("MEME_AUDIO_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let public_base_url = lookup("PUBLIC_BASE_URL")
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| format!("http://{host}:{port}"));
    let acquire_timeout_secs = overrides
        .acquire_timeout_secs
        .or_else(|| {
            lookup("ACQUIRE_TIMEOUT_SECS").and_then(|value| value.parse::<u64>().ok())
        })
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS);
    let token_ttl_secs = lookup("TOKEN_TTL_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_TOKEN_TTL_SECS);

    Ok(RuntimeSettings {
        media_root,
        scratch_dir,
        host,
        port,
        public_base_url,
        ytdlp_bin: overrides
            .ytdlp_bin
            .or_else(|| lookup("YTDLP_BIN").map(PathBuf::from)),
        ffmpeg_location: lookup("FFMPEG_LOCATION").map(PathBuf::from),
        acquire_timeout: Duration::from_secs(acquire_timeout_secs),
        max_filesize: lookup("MAX_FILESIZE").unwrap_or_else(|| DEFAULT_MAX_FILESIZE.to_string()),
        audio_quality: lookup("AUDIO_QUALITY")
            .unwrap_or_else(|| DEFAULT_AUDIO_QUALITY.to_string()),
        auth_secret: lookup("AUTH_SECRET"),
        token_ttl: Duration::from_secs(token_ttl_secs),
    })
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .and_then(non_blank)
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
