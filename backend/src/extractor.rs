//! Audio extraction through an external yt-dlp process.
//!
//! Every request gets its own job directory under the transfer directory, so
//! concurrent extractions never share an output path. The directory is removed
//! when its [`JobDir`] owner is dropped, which for a successful request happens
//! once the response body has been streamed (or abandoned by the client).

use std::{
    collections::HashSet,
    ffi::OsStr,
    io::ErrorKind,
    path::{Path, PathBuf},
    pin::Pin,
    process::Output,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tokio::{
    fs::File,
    io::{AsyncRead, ReadBuf},
    process::Command,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{config::Config, error::ExtractionError};

pub const OUTPUT_STEM: &str = "extracted_audio";
pub const AUDIO_FORMAT: &str = "mp3";

#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub url: String,
    pub job_dir: PathBuf,
    /// Output template handed to the tool; `%(ext)s` is filled in by yt-dlp.
    pub output_template: PathBuf,
    pub output_path: PathBuf,
}

#[async_trait]
pub trait AudioExtractor: Send + Sync {
    /// Produces an audio file for `request.url` and returns where it landed.
    async fn extract_audio(&self, request: &ExtractionRequest) -> Result<PathBuf, ExtractionError>;
}

/// Ids of the job directories currently owned by a live [`JobDir`].
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl JobRegistry {
    pub async fn create_job(&self, transfer_dir: &Path) -> std::io::Result<JobDir> {
        let id = Uuid::new_v4();
        let path = transfer_dir.join(id.to_string());
        tokio::fs::create_dir_all(&path).await?;
        self.lock().insert(id);
        Ok(JobDir {
            id,
            path,
            registry: self.clone(),
        })
    }

    pub fn is_active(&self, id: &Uuid) -> bool {
        self.lock().contains(id)
    }

    fn release(&self, id: &Uuid) {
        self.lock().remove(id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A per-request scratch directory, deleted on drop.
#[derive(Debug)]
pub struct JobDir {
    id: Uuid,
    path: PathBuf,
    registry: JobRegistry,
}

impl JobDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn request_for(&self, url: &str) -> ExtractionRequest {
        let dir = self.path();
        ExtractionRequest {
            url: url.to_string(),
            job_dir: dir.to_path_buf(),
            output_template: dir.join(format!("{OUTPUT_STEM}.%(ext)s")),
            output_path: dir.join(format!("{OUTPUT_STEM}.{AUDIO_FORMAT}")),
        }
    }

    /// Opens `file` so that this job directory lives exactly as long as the reader.
    pub async fn into_reader(self, file: &Path) -> std::io::Result<JobFile> {
        let file = File::open(file).await?;
        Ok(JobFile { file, _job: self })
    }
}

impl Drop for JobDir {
    fn drop(&mut self) {
        self.registry.release(&self.id);
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                // Dropped if the runtime is shutting down; the startup sweep removes the leftover.
                handle.spawn(async move {
                    cleanup_download_job(&path).await;
                });
            }
            Err(_) => {
                if let Err(error) = std::fs::remove_dir_all(&path)
                    && error.kind() != ErrorKind::NotFound
                {
                    warn!("Could not remove job directory {:?}: {error}", path);
                }
            }
        }
    }
}

/// An open output file that keeps its job directory alive.
///
/// Field order matters: the file handle closes before the directory is removed.
pub struct JobFile {
    file: File,
    _job: JobDir,
}

impl AsyncRead for JobFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    program: PathBuf,
    ffmpeg_location: Option<PathBuf>,
    audio_quality: String,
}

impl YtDlpExtractor {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.yt_dlp_path.clone(),
            ffmpeg_location: config.ffmpeg_location.clone(),
            audio_quality: config.audio_quality.clone(),
        }
    }

    fn build_args(&self, request: &ExtractionRequest) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--newline".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "-o".to_string(),
            request.output_template.to_string_lossy().into_owned(),
            "-f".to_string(),
            "bestaudio/best".to_string(),
            "-x".to_string(),
            "--audio-format".to_string(),
            AUDIO_FORMAT.to_string(),
            "--audio-quality".to_string(),
            self.audio_quality.clone(),
        ];

        if let Some(location) = &self.ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(location.to_string_lossy().into_owned());
        }

        args.push(request.url.clone());
        args
    }
}

#[async_trait]
impl AudioExtractor for YtDlpExtractor {
    async fn extract_audio(&self, request: &ExtractionRequest) -> Result<PathBuf, ExtractionError> {
        info!("Extracting audio from {:?}", request.url);

        let output = run_yt_dlp(&self.program, self.build_args(request)).await?;
        let printed_path = extract_printed_path(&output.stdout);
        let resolved = resolve_downloaded_file(request, printed_path.as_deref()).await?;

        let canonical_job_dir = tokio::fs::canonicalize(&request.job_dir).await?;
        let final_path = match request.output_path.file_name() {
            Some(name) => canonical_job_dir.join(name),
            None => request.output_path.clone(),
        };

        if resolved != final_path {
            debug!("Renaming {:?} to {:?}", resolved, final_path);
            tokio::fs::rename(&resolved, &final_path).await?;
        }

        info!("Audio extracted to {:?}", final_path);
        Ok(final_path)
    }
}

fn run_error_message(stderr: &[u8], status: std::process::ExitStatus) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("yt-dlp exited with {status}"))
}

async fn run_yt_dlp(program: &Path, args: Vec<String>) -> Result<Output, ExtractionError> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ExtractionError::ToolMissing(format!(
                    "{} is not installed or not on PATH.",
                    program.display()
                ))
            } else {
                ExtractionError::Io(error)
            }
        })?;

    if !output.status.success() {
        return Err(ExtractionError::Download(run_error_message(
            &output.stderr,
            output.status,
        )));
    }

    Ok(output)
}

fn extract_printed_path(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

async fn resolve_downloaded_file(
    request: &ExtractionRequest,
    printed_path: Option<&str>,
) -> Result<PathBuf, ExtractionError> {
    let job_dir = &request.job_dir;
    let canonical_job_dir = tokio::fs::canonicalize(job_dir).await?;

    let mut candidates = Vec::new();
    if let Some(path_value) = printed_path {
        candidates.push(PathBuf::from(path_value));
        candidates.push(job_dir.join(path_value));
    }
    candidates.push(request.output_path.clone());

    for candidate in &candidates {
        if let Some(valid_path) = resolve_download_candidate(&canonical_job_dir, candidate).await? {
            return Ok(valid_path);
        }
    }

    let mut entries = tokio::fs::read_dir(job_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if let Some(valid_path) = resolve_download_candidate(&canonical_job_dir, &path).await? {
            return Ok(valid_path);
        }
    }

    Err(ExtractionError::MissingOutput(request.output_path.clone()))
}

async fn resolve_download_candidate(
    canonical_job_dir: &Path,
    candidate_path: &Path,
) -> Result<Option<PathBuf>, ExtractionError> {
    let metadata = match tokio::fs::metadata(candidate_path).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    if !metadata.is_file() || candidate_path.extension() != Some(OsStr::new(AUDIO_FORMAT)) {
        return Ok(None);
    }

    let canonical_candidate = tokio::fs::canonicalize(candidate_path).await?;
    if !canonical_candidate.starts_with(canonical_job_dir) {
        warn!(
            "Ignoring file outside of the job directory: {:?}",
            canonical_candidate
        );
        return Ok(None);
    }

    Ok(Some(canonical_candidate))
}

pub async fn cleanup_download_job(job_dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(job_dir).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!("Could not remove job directory {:?}: {error}", job_dir);
    }
}

/// Removes job directories older than `older_than_secs` from `transfer_dir`; 0 disables.
///
/// Only UUID-named directories are considered, and those still held by `jobs` are kept.
pub async fn cleanup_stale_download_jobs(
    transfer_dir: &Path,
    older_than_secs: u64,
    jobs: &JobRegistry,
) {
    if older_than_secs == 0 {
        return;
    }

    let mut entries = match tokio::fs::read_dir(transfer_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open transfer directory for cleanup: {error}");
            }
            return;
        }
    };

    let max_age = Duration::from_secs(older_than_secs);
    let now = SystemTime::now();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate transfer directory for cleanup: {error}");
                break;
            }
        };

        let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(|name| Uuid::parse_str(name).ok())
        else {
            continue;
        };
        if jobs.is_active(&id) {
            continue;
        }

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified_at| now.duration_since(modified_at).ok())
            .unwrap_or_default();
        if !metadata.is_dir() || age < max_age {
            continue;
        }

        debug!("Removing stale job directory {:?}", path);
        cleanup_download_job(&path).await;
    }
}
