#![forbid(unsafe_code)]

//! Axum server for vidshelf.
//!
//! Pages are rendered in-process from the JSON catalog. Adding a video resolves
//! its metadata and caches the thumbnail; downloading runs yt-dlp for the
//! requested quality and stores one MP4 per video under `videos/`. Media and
//! thumbnails are streamed straight from disk.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Form, Json, Router,
    body::Body,
    extract::{Path as AxumPath, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use clap::Parser;
use mime_guess::MimeGuess;
use serde::Deserialize;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vidshelf::{
    catalog::{Catalog, VideoEntry},
    config::{Overrides, resolve_settings},
    downloads::{DEFAULT_QUALITY, DownloadOutcome, Downloader, Quality},
    library::{is_single_segment, locate_media},
    pages::{render_index, render_watch},
    thumbnail::ThumbnailFetcher,
    ytdlp::{Extractor, YtDlp},
};

// Layout below the data root.
const CATALOG_FILE: &str = "data.json";
const VIDEOS_SUBDIR: &str = "videos";
const THUMBS_SUBDIR: &str = "thumbs";

/// `server` is this binary's own target; the library logs under `vidshelf`.
const DEFAULT_LOG_FILTER: &str = "vidshelf=info,server=info";

#[derive(Debug, Parser)]
#[command(name = "vidshelf", about = "Personal video shelf: add, download and watch videos")]
struct ServerArgs {
    /// Directory holding data.json, videos/ and thumbs/.
    #[arg(long)]
    data_root: Option<PathBuf>,
    /// Address to listen on.
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// yt-dlp executable to run.
    #[arg(long)]
    ytdlp: Option<PathBuf>,
    /// Alternative .env file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl ServerArgs {
    fn into_overrides(self) -> Overrides {
        Overrides {
            data_root: self.data_root,
            host: self.host,
            port: self.port,
            ytdlp: self.ytdlp,
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/VIDSHELF_HOST")
}

/// Materialized file-system locations used at runtime.
struct FilePaths {
    catalog: PathBuf,
    videos: PathBuf,
    thumbs: PathBuf,
}

impl FilePaths {
    fn new(data_root: &Path) -> Self {
        Self {
            catalog: data_root.join(CATALOG_FILE),
            videos: data_root.join(VIDEOS_SUBDIR),
            thumbs: data_root.join(THUMBS_SUBDIR),
        }
    }

    fn prepare(&self) -> Result<()> {
        std::fs::create_dir_all(&self.videos)
            .with_context(|| format!("creating {}", self.videos.display()))?;
        std::fs::create_dir_all(&self.thumbs)
            .with_context(|| format!("creating {}", self.thumbs.display()))?;
        Ok(())
    }
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    catalog: Arc<Catalog>,
    extractor: Arc<dyn Extractor>,
    thumbnails: Arc<ThumbnailFetcher>,
    downloads: Arc<Downloader>,
    files: Arc<FilePaths>,
}

impl AppState {
    fn new(files: FilePaths, extractor: Arc<dyn Extractor>) -> Self {
        let catalog = Arc::new(Catalog::open(&files.catalog));
        let thumbnails = Arc::new(ThumbnailFetcher::new(&files.thumbs));
        let downloads = Arc::new(Downloader::new(
            extractor.clone(),
            catalog.clone(),
            files.videos.clone(),
        ));
        Self {
            catalog,
            extractor,
            thumbnails,
            downloads,
            files: Arc::new(files),
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let settings = resolve_settings(ServerArgs::parse().into_overrides())?;
    let host = parse_host_arg(&settings.host)?;

    let files = FilePaths::new(&settings.data_root);
    files.prepare()?;
    let state = AppState::new(files, Arc::new(YtDlp::new(&settings.ytdlp)));

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;

    info!(
        data_root = %settings.data_root.display(),
        ytdlp = %settings.ytdlp.display(),
        "vidshelf listening on http://{addr}"
    );
    info!("local access: http://localhost:{}", settings.port);
    info!("network access: http://{}:{}", lan_ip(), settings.port);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/add", post(add_video))
        .route("/video/{id}", get(watch_video))
        .route("/download/mp4", post(download_mp4))
        .route("/videos/{filename}", get(stream_video))
        .route("/thumbs/{filename}", get(stream_thumbnail))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {err}");
    }
}

/// Address other machines on the LAN can reach us at. Only used for the
/// startup banner; no packets are sent.
fn lan_ip() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

async fn index(State(state): State<AppState>) -> ApiResult<Html<String>> {
    let entries = load_entries(&state).await?;
    Ok(Html(render_index(&entries)))
}

#[derive(Deserialize)]
struct AddForm {
    #[serde(default)]
    url: Option<String>,
}

async fn add_video(State(state): State<AppState>, Form(form): Form<AddForm>) -> ApiResult<Redirect> {
    let url = form.url.as_deref().map(str::trim).unwrap_or_default();
    if url.is_empty() {
        return Ok(Redirect::to("/"));
    }

    let extractor = state.extractor.clone();
    let owned_url = url.to_string();
    let resolved = tokio::task::spawn_blocking(move || extractor.resolve(&owned_url))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    let info = match resolved {
        Ok(info) => info,
        Err(err) => {
            warn!(url, "could not add video: {err}");
            return Ok(Redirect::to("/"));
        }
    };

    let catalog = state.catalog.clone();
    let thumbnails = state.thumbnails.clone();
    let owned_url = url.to_string();
    let outcome = tokio::task::spawn_blocking(move || {
        let thumbnail_local = info
            .thumbnail
            .as_deref()
            .and_then(|remote| thumbnails.fetch(remote, &info.id));
        let entry = VideoEntry {
            id: info.id,
            title: info.title,
            thumbnail: info.thumbnail,
            thumbnail_local,
            url: owned_url,
            duration: info.duration,
            local_file: None,
        };
        let id = entry.id.clone();
        catalog.upsert(entry).map(|outcome| (id, outcome))
    })
    .await
    .map_err(|err| ApiError::internal(err.to_string()))?;

    match outcome {
        Ok((id, outcome)) => info!(id = %id, ?outcome, "video added"),
        Err(err) => {
            error!(url, "saving catalog failed: {err:#}");
            return Err(ApiError::internal(format!("saving catalog failed: {err}")));
        }
    }

    Ok(Redirect::to("/"))
}

async fn watch_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Html<String>> {
    let entries = load_entries(&state).await?;
    let entry = entries
        .into_iter()
        .find(|entry| entry.id == id)
        .ok_or_else(|| ApiError::not_found("Video not found"))?;
    let media_file = locate_media(&state.files.videos, &entry).await;
    Ok(Html(render_watch(&entry, media_file.as_deref())))
}

#[derive(Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    quality: Option<QualityField>,
}

/// Browsers send the select value as a string; scripted clients often send a
/// bare number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QualityField {
    Label(String),
    Height(u64),
}

impl QualityField {
    fn quality(&self) -> Quality {
        match self {
            Self::Label(label) => Quality::parse(label),
            Self::Height(height) => Quality::from_height(*height),
        }
    }
}

fn refused(status: StatusCode, reason: &str) -> (StatusCode, Json<DownloadOutcome>) {
    (
        status,
        Json(DownloadOutcome {
            success: false,
            message: format!("Download failed: {reason}"),
            filename: None,
        }),
    )
}

async fn download_mp4(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> (StatusCode, Json<DownloadOutcome>) {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => {
            warn!("rejected download request: {}", rejection.body_text());
            return refused(rejection.status(), &rejection.body_text());
        }
    };
    let url = request.url.as_deref().map(str::trim).unwrap_or_default();
    if url.is_empty() {
        return refused(StatusCode::BAD_REQUEST, "missing url");
    }
    let quality = request
        .quality
        .as_ref()
        .map_or_else(|| Quality::parse(DEFAULT_QUALITY), QualityField::quality);

    let outcome = state.downloads.download(url, quality).await;
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(outcome))
}

async fn stream_video(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    ensure_safe_path_segment(&filename)?;
    stream_file(state.files.videos.join(&filename), Some(&headers)).await
}

async fn stream_thumbnail(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> ApiResult<Response> {
    ensure_safe_path_segment(&filename)?;
    stream_file(state.files.thumbs.join(&filename), None).await
}

async fn load_entries(state: &AppState) -> ApiResult<Vec<VideoEntry>> {
    let catalog = state.catalog.clone();
    tokio::task::spawn_blocking(move || catalog.entries())
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .map_err(|err| {
            error!("reading catalog failed: {err:#}");
            ApiError::internal(format!("reading catalog failed: {err}"))
        })
}

/// Validates that a single dynamic path segment never escapes its base folder.
fn ensure_safe_path_segment(value: &str) -> ApiResult<()> {
    if is_single_segment(value) {
        Ok(())
    } else {
        Err(missing_file())
    }
}

fn missing_file() -> ApiError {
    ApiError::not_found("file not found")
}

/// The part of a file a `Range` header selects, already clamped to its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    Whole,
    /// Inclusive on both ends.
    Span { start: u64, end: u64 },
    Unsatisfiable,
}

impl ByteRange {
    fn requested(headers: Option<&HeaderMap>, size: u64) -> Self {
        headers
            .and_then(|headers| headers.get(header::RANGE))
            .and_then(|value| value.to_str().ok())
            .map_or(Self::Whole, |value| Self::parse(value, size))
    }

    /// Malformed headers are ignored and select the whole file. Only the
    /// first range of a multi-range request is honoured.
    fn parse(value: &str, size: u64) -> Self {
        let Some(ranges) = value.trim().strip_prefix("bytes=") else {
            return Self::Whole;
        };
        let first_range = ranges.split(',').next().unwrap_or_default();
        let Some((first, last)) = first_range.split_once('-') else {
            return Self::Whole;
        };
        let (first, last) = (first.trim(), last.trim());
        if first.is_empty() && last.is_empty() {
            return Self::Whole;
        }
        let Some(last_byte) = size.checked_sub(1) else {
            return Self::Unsatisfiable;
        };

        if first.is_empty() {
            return match last.parse::<u64>() {
                Ok(0) => Self::Unsatisfiable,
                Ok(suffix) => Self::Span {
                    start: size.saturating_sub(suffix),
                    end: last_byte,
                },
                Err(_) => Self::Whole,
            };
        }
        let Ok(start) = first.parse::<u64>() else {
            return Self::Whole;
        };
        let end = if last.is_empty() {
            last_byte
        } else {
            match last.parse::<u64>() {
                Ok(end) if end >= start => end,
                _ => return Self::Whole,
            }
        };
        if start > last_byte {
            Self::Unsatisfiable
        } else {
            Self::Span {
                start,
                end: end.min(last_byte),
            }
        }
    }
}

async fn stream_file(path: PathBuf, headers: Option<&HeaderMap>) -> ApiResult<Response> {
    let mut file = File::open(&path).await.map_err(|_| missing_file())?;
    let metadata = file.metadata().await.map_err(|_| missing_file())?;
    if !metadata.is_file() {
        return Err(missing_file());
    }
    let size = metadata.len();

    let mut response = match ByteRange::requested(headers, size) {
        ByteRange::Whole => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
        ByteRange::Span { start, end } => {
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|err| ApiError::internal(err.to_string()))?;
            let mut response =
                Body::from_stream(ReaderStream::new(file.take(length))).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        ByteRange::Unsatisfiable => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            return Ok(response);
        }
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&value).map_err(|err| ApiError::internal(err.to_string()))
}
