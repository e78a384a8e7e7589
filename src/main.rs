mod config;
mod error;
mod job;
mod layout;
mod manifest;
mod probe;
mod transcode;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path as UrlPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    BoxError, Json, Router,
};
use futures::{Stream, TryStreamExt};
use serde::Serialize;
use tokio::{fs::File, io::BufWriter};
use tokio_util::io::StreamReader;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::job::{FailureKind, JobController, SubmitOutcome};
use crate::layout::{is_valid_job_id, HlsLayout};
use crate::probe::FfprobeRunner;
use crate::transcode::{FfmpegExecutor, TranscodeOptions};

struct AppState {
    controller: JobController<FfmpegExecutor, FfprobeRunner>,
    config: Config,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();

    // A missing external binary is a configuration error; refuse to serve
    // rather than surface it on the first upload.
    if let Err(e) = FfmpegExecutor::verify(&config.ffmpeg_bin).await {
        error!("encoder health check failed: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = FfprobeRunner::verify(&config.ffprobe_bin).await {
        error!("probe health check failed: {}", e);
        std::process::exit(1);
    }

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .expect("Failed to create upload directory");
    tokio::fs::create_dir_all(&config.hls_root)
        .await
        .expect("Failed to create HLS root directory");

    let controller = JobController::new(
        HlsLayout::new(config.hls_root.clone()),
        FfmpegExecutor::new(config.ffmpeg_bin.clone(), config.job_timeout_secs),
        FfprobeRunner::new(config.ffprobe_bin.clone()),
        config.max_concurrent_jobs,
        TranscodeOptions::default(),
        config.cleanup_failed_output,
        config.keep_source,
    );

    let max_upload_bytes = config.max_upload_bytes;
    let addr = format!("{}:{}", config.addr, config.port);
    let state = Arc::new(AppState { controller, config });

    // Browser HLS players fetch the manifest cross-origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/upload", post(upload_media))
        .route("/hls/:job_id/:file", get(serve_asset))
        .layer(cors)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind TCP listener");
    info!("Listening at {}", addr);
    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "HLS server running" }))
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    message: &'static str,
    #[serde(rename = "videoId")]
    video_id: String,
    #[serde(rename = "hlsUrl")]
    hls_url: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

// Handler that accepts a multipart upload, stages the file on disk and
// runs the transcoding job synchronously within the request.
async fn upload_media(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), (StatusCode, Json<ErrorResponse>)> {
    while let Ok(Some(field)) = multipart.next_field().await {
        let Some(file_name) = field.file_name().map(str::to_owned) else {
            continue;
        };

        let is_video = field
            .content_type()
            .map(|t| t.starts_with("video/"))
            .unwrap_or(false);
        if !is_video {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "Only video files are allowed",
            ));
        }

        let staged = state
            .config
            .upload_dir
            .join(format!("{}{}", Uuid::new_v4(), safe_extension(&file_name)));
        info!("Saving new file to {:?}", staged);
        stream_to_file(&staged, field).await.map_err(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to stage upload: {}", e),
            )
        })?;

        return match state.controller.submit(&staged).await {
            SubmitOutcome::Succeeded { job_id, locator } => Ok((
                StatusCode::OK,
                Json(UploadResponse {
                    message: "Video uploaded & converted to HLS",
                    video_id: job_id,
                    hls_url: locator,
                }),
            )),
            SubmitOutcome::Failed {
                kind, diagnostic, ..
            } => {
                let status = match kind {
                    FailureKind::InvalidInput => StatusCode::BAD_REQUEST,
                    FailureKind::Internal | FailureKind::Transcode => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                Err(error_response(status, diagnostic))
            }
        };
    }

    Err(error_response(StatusCode::BAD_REQUEST, "No file uploaded"))
}

// Serves published assets only; staging directories use a suffix that can
// never appear in a valid job id token.
async fn serve_asset(
    State(state): State<Arc<AppState>>,
    UrlPath((job_id, file)): UrlPath<(String, String)>,
) -> Result<Response, StatusCode> {
    if !is_valid_job_id(&job_id) || !is_safe_file_name(&file) {
        return Err(StatusCode::NOT_FOUND);
    }

    let path = state.config.hls_root.join(&job_id).join(&file);
    let data = tokio::fs::read(&path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;

    Ok(([(header::CONTENT_TYPE, content_type_for(&file))], data).into_response())
}

fn content_type_for(file: &str) -> &'static str {
    match Path::new(file).extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        _ => "application/octet-stream",
    }
}

// Save a `Stream` to a file
async fn stream_to_file<S, E>(path: &PathBuf, stream: S) -> io::Result<()>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<BoxError>,
{
    let body_with_io_error = stream.map_err(|err| io::Error::new(io::ErrorKind::Other, err));
    let body_reader = StreamReader::new(body_with_io_error);
    futures::pin_mut!(body_reader);

    let mut file = BufWriter::new(File::create(path).await?);
    tokio::io::copy(&mut body_reader, &mut file).await?;

    Ok(())
}

// Extension taken from the client-supplied name, restricted to a short
// alphanumeric token; anything else is dropped.
fn safe_extension(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default()
}

fn is_safe_file_name(file: &str) -> bool {
    !file.is_empty()
        && !file.starts_with('.')
        && file
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
        && !file.contains("..")
}
