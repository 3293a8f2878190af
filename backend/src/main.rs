use std::sync::Arc;

use axum::http::header::CONTENT_DISPOSITION;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

mod config;
mod error;
mod extractor;
mod routes;

use config::Config;
use error::ApiError;
use extractor::{JobRegistry, YtDlpExtractor, cleanup_stale_download_jobs};
use routes::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "yt_audio_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.transfer_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create transfer directory {:?}: {error}",
                config.transfer_dir
            ))
        })?;

    match &config.ffmpeg_location {
        Some(location) => info!("Using ffmpeg from {:?}", location),
        None => warn!("FFMPEG_LOCATION not set. yt-dlp will look for ffmpeg on PATH."),
    }
    info!(
        "Extracting with {:?} into {:?}",
        config.yt_dlp_path, config.transfer_dir
    );

    let jobs = JobRegistry::default();
    cleanup_stale_download_jobs(
        &config.transfer_dir,
        config.stale_job_max_age_seconds,
        &jobs,
    )
    .await;

    let extractor = YtDlpExtractor::from_config(&config);
    let addr = config.bind_addr.clone();
    let state = AppState {
        config: Arc::new(config),
        extractor: Arc::new(extractor),
        jobs,
    };

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer());

    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {addr}: {error}"))
    })?;

    info!("Backend ready on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

/// Any origin, method and header, with credentials.
///
/// Wildcards are not allowed together with credentials, so the request's own
/// values are echoed back instead.
fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .expose_headers([CONTENT_DISPOSITION])
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        body::Body,
        http::{Method, Request, StatusCode, header},
        routing::post,
    };
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/download-audio", post(|| async { "ok" }))
            .layer(build_cors_layer())
    }

    #[tokio::test]
    async fn preflight_mirrors_request_with_credentials() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/download-audio")
            .header(header::ORIGIN, "http://localhost:5173")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        let headers = response.headers();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:5173"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "POST");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "content-type");
    }

    #[tokio::test]
    async fn simple_request_exposes_content_disposition() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/download-audio")
            .header(header::ORIGIN, "https://app.example.org")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        let headers = response.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.example.org"
        );
        assert_eq!(
            headers[header::ACCESS_CONTROL_EXPOSE_HEADERS],
            "content-disposition"
        );
    }
}
