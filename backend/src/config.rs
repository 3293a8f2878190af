//! Runtime configuration, read from environment variables once at startup.

use std::path::PathBuf;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_YT_DLP_PATH: &str = "yt-dlp";
const DEFAULT_AUDIO_QUALITY: &str = "192K";
const DEFAULT_TRANSFER_DIR_NAME: &str = "yt-audio-backend";
const DEFAULT_STALE_JOB_MAX_AGE_SECONDS: u64 = 2 * 60 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    /// Executable used for extraction, looked up on `PATH` when not absolute.
    pub yt_dlp_path: PathBuf,
    /// Directory holding the ffmpeg binaries; yt-dlp searches `PATH` when unset.
    pub ffmpeg_location: Option<PathBuf>,
    pub audio_quality: String,
    /// Parent of the per-request job directories.
    pub transfer_dir: PathBuf,
    pub stale_job_max_age_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string))
        };

        Self {
            bind_addr: resolve_bind_addr(read("APP_ADDR"), read("PORT")),
            yt_dlp_path: read("YT_DLP_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP_PATH)),
            ffmpeg_location: read("FFMPEG_LOCATION").map(PathBuf::from),
            audio_quality: read("AUDIO_QUALITY")
                .unwrap_or_else(|| DEFAULT_AUDIO_QUALITY.to_string()),
            transfer_dir: read("TRANSFER_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_TRANSFER_DIR_NAME)),
            stale_job_max_age_seconds: read("STALE_JOB_MAX_AGE_SECONDS")
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(DEFAULT_STALE_JOB_MAX_AGE_SECONDS),
        }
    }
}

fn resolve_bind_addr(app_addr: Option<String>, port: Option<String>) -> String {
    if let Some(configured) = app_addr {
        return configured;
    }

    if let Some(port) = port.and_then(|value| value.parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
