use std::sync::Arc;

use axum::{
    Form, Json, Router,
    body::Body,
    extract::{State, rejection::FormRejection},
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    error::{ApiError, ExtractionError},
    extractor::{AudioExtractor, JobRegistry, cleanup_stale_download_jobs},
};

pub const INVALID_URL_MESSAGE: &str = "Invalid URL. Please enter a valid YouTube URL.";
pub const ATTACHMENT_FILENAME: &str = "extracted_audio.mp3";
pub const AUDIO_CONTENT_TYPE: &str = "audio/mpeg";

const SUPPORTED_HOSTS: [&str; 2] = ["youtube.com", "youtu.be"];

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub extractor: Arc<dyn AudioExtractor>,
    pub jobs: JobRegistry,
}

#[derive(Debug, Deserialize)]
pub struct DownloadAudioForm {
    url: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/download-audio", post(download_audio))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn download_audio(
    State(state): State<AppState>,
    form: Result<Form<DownloadAudioForm>, FormRejection>,
) -> Result<Response, ApiError> {
    let Form(payload) = form.map_err(|rejection| {
        warn!("Rejected download form: {rejection}");
        ApiError::unprocessable(rejection.body_text())
    })?;

    let url = payload.url.trim();
    if !is_supported_video_url(url) {
        warn!("Rejected unsupported URL {:?}", url);
        return Err(ApiError::bad_request(INVALID_URL_MESSAGE));
    }

    cleanup_stale_download_jobs(
        &state.config.transfer_dir,
        state.config.stale_job_max_age_seconds,
        &state.jobs,
    )
    .await;

    let job = state
        .jobs
        .create_job(&state.config.transfer_dir)
        .await
        .map_err(|error| {
            error!("Could not create job directory: {error}");
            ApiError::internal(format!("Could not prepare the download directory: {error}"))
        })?;

    let request = job.request_for(url);
    let audio_path = state.extractor.extract_audio(&request).await?;

    let metadata = match tokio::fs::metadata(&audio_path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => return Err(ExtractionError::MissingOutput(audio_path).into()),
    };

    let reader = job.into_reader(&audio_path).await.map_err(|error| {
        error!("Could not open extracted audio {:?}: {error}", audio_path);
        ApiError::internal(error.to_string())
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(AUDIO_CONTENT_TYPE));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename={ATTACHMENT_FILENAME}"))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    info!("Sending {} bytes of audio for {:?}", metadata.len(), url);
    let body = Body::from_stream(ReaderStream::new(reader));
    Ok((headers, body).into_response())
}

fn is_supported_video_url(url: &str) -> bool {
    SUPPORTED_HOSTS.iter().any(|host| url.contains(host))
}
