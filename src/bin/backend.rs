#![forbid(unsafe_code)]

//! Axum backend for the meme-audio library.
//!
//! Accounts sign up and log in, authenticated users submit a YouTube URL plus
//! a title, and everyone can list, search and download what has been
//! collected. The heavy lifting lives in the library crate; this file is
//! routing, argument parsing and HTTP error mapping.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use meme_audio::acquire::Acquirer;
use meme_audio::auth::{Accounts, AuthError, LoginRequest, LoginResponse, SignupRequest, TokenSigner};
use meme_audio::config::{RuntimeOverrides, resolve_runtime_settings};
use meme_audio::error::ErrorKind;
use meme_audio::library::{AudioRecord, Library, LibraryError};
use meme_audio::logging::init_tracing;
use meme_audio::security::ensure_not_root;
use meme_audio::service::{ServiceError, UploadRequest, UploadResponse, UploadService};
use meme_audio::storage::LocalMediaStorage;
use mime_guess::MimeGuess;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
struct BackendArgs {
    overrides: RuntimeOverrides,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = RuntimeOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
                _ => (arg.clone(), None),
            };
            let mut value = || {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| anyhow!("{flag} requires a value"))
            };

            match flag.as_str() {
                "--media-root" => overrides.media_root = Some(PathBuf::from(value()?)),
                "--scratch-dir" => overrides.scratch_dir = Some(PathBuf::from(value()?)),
                "--ytdlp" => overrides.ytdlp_bin = Some(PathBuf::from(value()?)),
                "--env-file" => overrides.env_path = Some(PathBuf::from(value()?)),
                "--port" => overrides.port = Some(parse_port_arg(&value()?)?),
                "--host" => {
                    let host = value()?;
                    parse_host_arg(&host)?;
                    overrides.host = Some(host);
                }
                "--timeout-secs" => {
                    let secs = value()?;
                    overrides.acquire_timeout_secs = Some(
                        secs.parse::<u64>()
                            .context("expected a whole number of seconds for --timeout-secs")?,
                    );
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(Self { overrides })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/MEME_AUDIO_HOST")
}

#[derive(Clone)]
struct AppState {
    accounts: Accounts,
    uploads: UploadService,
    library: Library,
    media_dir: Arc<PathBuf>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let status = status_for(kind);
        let message = message.into();
        if status.is_server_error() {
            error!(kind = kind.as_str(), "{message}");
        }
        Self {
            status,
            kind: kind.as_str(),
            message,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::Unauthorized, message)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    use meme_audio::error::ToolFailureKind;

    match kind {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::DuplicateTitle | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ExternalToolFailure(ToolFailureKind::SourceUnavailable) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorKind::ExternalToolFailure(ToolFailureKind::FileTooLarge) => {
            StatusCode::PAYLOAD_TOO_LARGE
        }
        ErrorKind::ExternalToolFailure(_) | ErrorKind::EmptyOutput | ErrorKind::UploadFailure => {
            StatusCode::BAD_GATEWAY
        }
        ErrorKind::ToolNotInstalled | ErrorKind::PersistenceFailure | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self::from_kind(err.kind(), err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::from_kind(err.kind(), err.to_string())
    }
}

impl From<LibraryError> for ApiError {
    fn from(err: LibraryError) -> Self {
        Self::from_kind(err.kind(), err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::from_kind(ErrorKind::InvalidInput, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.message,
            "kind": self.kind,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let BackendArgs { overrides } = BackendArgs::parse()?;
    ensure_not_root("backend")?;

    let settings = resolve_runtime_settings(overrides)?;
    let secret = settings.require_auth_secret()?;
    let host = parse_host_arg(&settings.host)?;

    let library = Library::open(&settings.library_db())
        .await
        .context("opening library database")?;
    let acquirer = Acquirer::new(settings.acquire_config()).context("checking yt-dlp")?;
    let storage = LocalMediaStorage::new(&settings.media_root, settings.public_base_url.clone());
    let media_dir = storage.folder();

    let state = AppState {
        accounts: Accounts::new(
            library.clone(),
            TokenSigner::new(secret, settings.token_ttl),
        ),
        uploads: UploadService::new(acquirer, Arc::new(storage), library.clone()),
        library,
        media_dir: Arc::new(media_dir),
    };

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("API server listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/v1/auth/signup", post(signup))
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/audio/upload", post(upload_audio))
        .route("/api/v1/audio/all", get(list_audios))
        .route("/api/v1/audio/search", get(search_audios))
        .route("/media/yt-audios/{file}", get(serve_media))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
}

async fn root() -> &'static str {
    "API is running..."
}

async fn signup(
    State(state): State<AppState>,
    payload: Result<Json<SignupRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(request) = payload?;
    let user = state.accounts.signup(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "User created successfully",
            "user": user,
        })),
    ))
}

async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Json<LoginResponse>> {
    let Json(request) = payload?;
    Ok(Json(state.accounts.login(request).await?))
}

async fn upload_audio(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<UploadRequest>, JsonRejection>,
) -> ApiResult<Json<UploadResponse>> {
    let token = bearer_token(&headers)?;
    let user = state.accounts.authenticate(token).await?;
    let Json(request) = payload?;

    let audio = state.uploads.upload(request, Some(user.id)).await?;
    Ok(Json(UploadResponse {
        message: "Audio uploaded successfully",
        audio,
    }))
}

async fn list_audios(State(state): State<AppState>) -> ApiResult<Json<Vec<AudioRecord>>> {
    Ok(Json(state.library.list_audios().await?))
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: Option<String>,
}

async fn search_audios(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<AudioRecord>>> {
    let query = params.q.unwrap_or_default();
    Ok(Json(state.library.search_audios(&query).await?))
}

async fn serve_media(
    State(state): State<AppState>,
    AxumPath(file): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    ensure_safe_path_segment(&file)?;
    let mut response = stream_file(state.media_dir.join(&file), &headers).await?;
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{file}\""))
        .map_err(|_| ApiError::not_found("file not found"))?;
    response
        .headers_mut()
        .insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

/// Pulls the token out of `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> ApiResult<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
    let (scheme, token) = value
        .trim()
        .split_once(' ')
        .ok_or_else(|| ApiError::unauthorized("malformed authorization header"))?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(ApiError::unauthorized("malformed authorization header"));
    }
    Ok(token.trim())
}

/// Validates that a single dynamic path segment never escapes its base folder.
fn ensure_safe_path_segment(value: &str) -> ApiResult<()> {
    if value.is_empty()
        || Path::new(value)
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        || value.contains(['/', '\\'])
    {
        return Err(ApiError::not_found("file not found"));
    }

    Ok(())
}

fn header_value(value: impl ToString) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&value.to_string())
        .map_err(|_| ApiError::from_kind(ErrorKind::Internal, "invalid header value"))
}

async fn stream_file(
    path: PathBuf,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }
    let size = metadata.len();

    let guessed = MimeGuess::from_path(&path).first();
    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let stream = ReaderStream::new(file.take(length));
            let mut response = Body::from_stream(stream).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, header_value(length)?);
            response
        }
    } else {
        let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, header_value(size)?);
        response
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = guessed
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let (unit, range) = value.split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let range = range.trim();
    // Multi-range requests get the whole file.
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
